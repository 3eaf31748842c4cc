pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod observability;
pub mod packer;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod server;
pub mod ws;

pub use client::{Client, ClientRuntimeConfig};
pub use config::{BrokerConfig, ConfigOverrides};
pub use error::{BrokerError, Result};
pub use frame::{Action, Frame};
pub use server::{serve, BrokerState};
