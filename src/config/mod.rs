//! Broker configuration: CLI/env overrides layered over an optional TOML
//! file over built-in defaults, in the same priority order the teacher
//! daemon's config layering uses.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_CONN_READ_SECS: u64 = 10;
const DEFAULT_CONN_WRITE_SECS: u64 = 3;
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_HEARTBEAT_SECS: u64 = 3;

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// TCP listen port (default: 4300).
    port: Option<u16>,
    /// Optional WebSocket listen address, e.g. "0.0.0.0:4301".
    ws_listen_addr: Option<SocketAddr>,
    /// Handshake shared secret. Prefer `CLAWD_BROKER_SECRET` or
    /// `--secret-file` — a secret committed to `config.toml` ends up in
    /// shell history and backups.
    secret: Option<String>,
    /// Log level filter string, e.g. "debug", "info,lim_broker=trace".
    log: Option<String>,
    conn_read_secs: Option<u64>,
    conn_write_secs: Option<u64>,
    response_timeout_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Fully resolved broker configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    pub ws_listen_addr: Option<SocketAddr>,
    /// Handshake shared secret. Never logged or included in `Debug` output.
    pub secret: Vec<u8>,
    pub conn_read_duration: Duration,
    pub conn_write_timeout: Duration,
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub data_dir: PathBuf,
    pub log: String,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("ws_listen_addr", &self.ws_listen_addr)
            .field("secret", &"<redacted>")
            .field("conn_read_duration", &self.conn_read_duration)
            .field("conn_write_timeout", &self.conn_write_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("data_dir", &self.data_dir)
            .field("log", &self.log)
            .finish()
    }
}

/// CLI-sourced overrides; `None` falls through to TOML then defaults.
#[derive(Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub ws_listen_addr: Option<SocketAddr>,
    pub secret_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
}

impl BrokerConfig {
    /// Build config from CLI overrides + optional TOML file + defaults.
    ///
    /// The secret is resolved with its own priority, independent of the
    /// rest: `CLAWD_BROKER_SECRET` env var > `--secret-file` > TOML. There
    /// is no default and no auto-generation — an operator must provision
    /// it, since unlike the teacher's per-install IPC token, this secret is
    /// a credential shared by every client.
    pub fn load(overrides: ConfigOverrides) -> anyhow::Result<Self> {
        let data_dir = overrides.data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = overrides.port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let listen_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        let ws_listen_addr = overrides.ws_listen_addr.or(toml.ws_listen_addr);
        let log = overrides.log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let secret = resolve_secret(overrides.secret_file.as_deref(), toml.secret.as_deref())?;

        let conn_read_duration =
            Duration::from_secs(toml.conn_read_secs.unwrap_or(DEFAULT_CONN_READ_SECS));
        let conn_write_timeout =
            Duration::from_secs(toml.conn_write_secs.unwrap_or(DEFAULT_CONN_WRITE_SECS));
        let response_timeout = Duration::from_secs(
            toml.response_timeout_secs
                .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_SECS),
        );
        let heartbeat_interval =
            Duration::from_secs(toml.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS));

        Ok(Self {
            listen_addr,
            ws_listen_addr,
            secret,
            conn_read_duration,
            conn_write_timeout,
            response_timeout,
            heartbeat_interval,
            data_dir,
            log,
        })
    }
}

fn resolve_secret(secret_file: Option<&Path>, toml_secret: Option<&str>) -> anyhow::Result<Vec<u8>> {
    if let Ok(env_secret) = std::env::var("CLAWD_BROKER_SECRET") {
        if !env_secret.is_empty() {
            return Ok(env_secret.into_bytes());
        }
    }
    if let Some(path) = secret_file {
        let contents = std::fs::read_to_string(path)?;
        return Ok(contents.trim_end().as_bytes().to_vec());
    }
    if let Some(secret) = toml_secret {
        return Ok(secret.as_bytes().to_vec());
    }
    anyhow::bail!(
        "no handshake secret configured — set CLAWD_BROKER_SECRET, pass --secret-file, or set `secret` in config.toml"
    )
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("lim-broker");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("lim-broker");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("lim-broker");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("lim-broker");
        }
    }
    PathBuf::from(".lim-broker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_env_var_takes_priority() {
        std::env::set_var("CLAWD_BROKER_SECRET", "from-env");
        let secret = resolve_secret(None, Some("from-toml")).unwrap();
        std::env::remove_var("CLAWD_BROKER_SECRET");
        assert_eq!(secret, b"from-env");
    }

    #[test]
    fn secret_falls_back_to_toml() {
        std::env::remove_var("CLAWD_BROKER_SECRET");
        let secret = resolve_secret(None, Some("from-toml")).unwrap();
        assert_eq!(secret, b"from-toml");
    }

    #[test]
    fn missing_secret_is_an_error() {
        std::env::remove_var("CLAWD_BROKER_SECRET");
        assert!(resolve_secret(None, None).is_err());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let cfg = BrokerConfig {
            listen_addr: "0.0.0.0:4300".parse().unwrap(),
            ws_listen_addr: None,
            secret: b"super-secret".to_vec(),
            conn_read_duration: Duration::from_secs(10),
            conn_write_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(3),
            data_dir: PathBuf::from("/tmp"),
            log: "info".to_string(),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
