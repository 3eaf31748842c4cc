use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use lim_broker::client::{Client, ClientRuntimeConfig};
use lim_broker::config::ConfigOverrides;
use lim_broker::metrics::BrokerMetrics;
use lim_broker::{BrokerConfig, BrokerState};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser)]
#[command(name = "limd", about = "A lightweight pub/sub broker", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TCP listen port (default: 4300)
    #[arg(long, env = "CLAWD_BROKER_PORT", global = true)]
    port: Option<u16>,

    /// Data directory for config.toml (default: OS-specific app data dir)
    #[arg(long, env = "CLAWD_BROKER_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "CLAWD_BROKER_LOG", global = true)]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CLAWD_BROKER_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker (default when no subcommand given).
    ///
    /// Examples:
    ///   limd serve
    ///   limd serve --port 4300 --secret-file /etc/lim-broker/secret
    Serve {
        /// Path to a file containing the handshake secret.
        #[arg(long)]
        secret_file: Option<PathBuf>,
    },
    /// Connect, subscribe, publish one message, and exit. Smoke-test client.
    ///
    /// Examples:
    ///   limd pub 127.0.0.1:4300 /etc/lim-broker/secret room "hello"
    Pub {
        addr: String,
        secret_file: PathBuf,
        label: String,
        text: String,
    },
    /// Connect, subscribe to a label, and print received payloads until
    /// Ctrl-C. Smoke-test client.
    ///
    /// Examples:
    ///   limd sub 127.0.0.1:4300 /etc/lim-broker/secret room
    Sub {
        addr: String,
        secret_file: PathBuf,
        label: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve { secret_file: None }) {
        Command::Serve { secret_file } => {
            run_serve(args.port, args.data_dir, args.log, secret_file).await
        }
        Command::Pub {
            addr,
            secret_file,
            label,
            text,
        } => run_pub(addr, secret_file, label, text).await,
        Command::Sub {
            addr,
            secret_file,
            label,
        } => run_sub(addr, secret_file, label).await,
    }
}

/// Initialize the tracing subscriber. Returns a `WorkerGuard` that must
/// stay alive for the process lifetime. Falls back to stdout-only logging
/// if the log directory can't be created — never panics on a bad path.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("limd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

async fn run_serve(
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    log: Option<String>,
    secret_file: Option<PathBuf>,
) -> Result<()> {
    let config = BrokerConfig::load(ConfigOverrides {
        port,
        data_dir,
        log,
        secret_file,
        ws_listen_addr: None,
    })
    .context("failed to load broker configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "lim-broker starting");
    info!(addr = %config.listen_addr, data_dir = %config.data_dir.display(), "config loaded");

    let metrics = Arc::new(BrokerMetrics::new());
    let state = BrokerState::new(config, metrics);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        make_shutdown_future().await;
        info!("shutdown signal received, shutting down");
        let _ = shutdown_tx.send(());
    });

    lim_broker::serve(state, shutdown_rx).await?;
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C, so the broker shuts down
/// cleanly under a process manager or container runtime, not just from a
/// terminal. On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn read_secret(path: &std::path::Path) -> Result<Vec<u8>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read secret file {}", path.display()))?;
    Ok(contents.trim_end().as_bytes().to_vec())
}

async fn run_pub(addr: String, secret_file: PathBuf, label: String, text: String) -> Result<()> {
    let secret = read_secret(&secret_file)?;
    let client = Client::connect(addr, secret, ClientRuntimeConfig::default());
    client
        .label(&label)
        .await
        .context("failed to subscribe before publishing")?;
    client
        .multicast(&label, text.as_bytes())
        .await
        .context("failed to publish")?;
    // Give the send loop a moment to flush the queued frame before exit.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    println!("published to '{label}'");
    Ok(())
}

async fn run_sub(addr: String, secret_file: PathBuf, label: String) -> Result<()> {
    let secret = read_secret(&secret_file)?;
    let client = Client::connect(addr, secret, ClientRuntimeConfig::default());
    client.label(&label).await.context("failed to subscribe")?;
    println!("subscribed to '{label}', waiting for messages (Ctrl-C to exit)...");

    loop {
        tokio::select! {
            received = client.receive() => {
                match received {
                    Some((label, payloads)) => {
                        for payload in payloads {
                            println!("[{label}] {}", String::from_utf8_lossy(&payload));
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = make_shutdown_future() => return Ok(()),
        }
    }
}
