//! Configuration loaded from environment variables

use crate::notify::DEFAULT_CAPACITY;
use crate::state::TunnelProtocol;
use crate::tool::DEFAULT_TOOL;
use crate::tunnel::DEFAULT_STOP_TIMEOUT;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;

/// Runtime configuration
///
/// | variable | default |
/// |---|---|
/// | `FILEBEAM_HOST` | `0.0.0.0` |
/// | `FILEBEAM_PORT` | `5000` |
/// | `FILEBEAM_TUNNEL_BIN` | `cpolar` |
/// | `FILEBEAM_TUNNEL_TOKEN` | empty |
/// | `FILEBEAM_TUNNEL_PROTOCOL` | `http` |
/// | `FILEBEAM_TUNNEL_STOP_TIMEOUT_SECS` | `10` |
/// | `FILEBEAM_SHUTDOWN_GRACE_SECS` | `5` |
/// | `FILEBEAM_NOTIFY_CAPACITY` | `256` |
/// | `FILEBEAM_SECRET` | random |
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub tunnel_bin: String,
    pub tunnel_token: String,
    pub tunnel_protocol: TunnelProtocol,
    pub tunnel_stop_timeout: Duration,
    pub shutdown_grace: Duration,
    pub notify_capacity: usize,
    pub secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Read configuration from the process environment
    ///
    /// Call `dotenv::dotenv()` beforehand to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Unparseable values fall back to their default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            host: text("FILEBEAM_HOST", "0.0.0.0"),
            port: parsed(&lookup, "FILEBEAM_PORT", DEFAULT_PORT),
            tunnel_bin: text("FILEBEAM_TUNNEL_BIN", DEFAULT_TOOL),
            tunnel_token: lookup("FILEBEAM_TUNNEL_TOKEN").unwrap_or_default().trim().to_string(),
            tunnel_protocol: parsed(&lookup, "FILEBEAM_TUNNEL_PROTOCOL", TunnelProtocol::Http),
            tunnel_stop_timeout: Duration::from_secs(parsed(
                &lookup,
                "FILEBEAM_TUNNEL_STOP_TIMEOUT_SECS",
                DEFAULT_STOP_TIMEOUT.as_secs(),
            )),
            shutdown_grace: Duration::from_secs(parsed(&lookup, "FILEBEAM_SHUTDOWN_GRACE_SECS", 5)),
            notify_capacity: parsed(&lookup, "FILEBEAM_NOTIFY_CAPACITY", DEFAULT_CAPACITY).max(1),
            secret: lookup("FILEBEAM_SECRET")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring invalid {}={:?}: {}", key, raw, e);
                default
            }
        },
        _ => default,
    }
}
