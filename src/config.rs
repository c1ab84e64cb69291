//! OrbitCast presence configuration
//!
//! Configuration comes from:
//! 1. Environment variables (`ORBITCAST_*`)
//! 2. Command-line overrides applied by the binary

use std::path::PathBuf;
use std::time::Duration;

/// Default grace period before a disconnected member leaves, in seconds
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 15;

/// Default capacity of the presence event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default bound on a single broadcast call, in milliseconds
pub const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 2000;

/// OrbitCast presence server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the server listens on
    pub socket_path: PathBuf,
    /// Presence engine configuration
    pub presence: PresenceConfig,
}

/// Presence engine configuration
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Presence enabled for this deployment (default: true)
    pub enabled: bool,
    /// Delay before a disconnected member leaves (default: 15s)
    pub grace_period: Duration,
    /// Per-stream grace periods as (stream prefix, delay); longest prefix wins
    pub stream_grace_periods: Vec<(String, Duration)>,
    /// Event queue capacity before events are dropped
    pub queue_capacity: usize,
    /// Upper bound for one broadcast call
    pub notify_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            stream_grace_periods: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            notify_timeout: Duration::from_millis(DEFAULT_NOTIFY_TIMEOUT_MS),
        }
    }
}

impl PresenceConfig {
    /// Grace period for a stream
    pub fn grace_period_for(&self, stream: &str) -> Duration {
        self.stream_grace_periods
            .iter()
            .filter(|(prefix, _)| stream.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, delay)| *delay)
            .unwrap_or(self.grace_period)
    }
}

impl Config {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let socket_path = lookup("ORBITCAST_SOCKET")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_socket_path(&lookup));

        let mut presence = PresenceConfig::default();

        if let Some(enabled) = lookup("ORBITCAST_PRESENCE") {
            presence.enabled = parse_bool(&enabled)
                .ok_or(ConfigError::InvalidEnv("ORBITCAST_PRESENCE", "expected true/false"))?;
        }

        if let Some(ms) = lookup("ORBITCAST_PRESENCE_GRACE_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                ConfigError::InvalidEnv("ORBITCAST_PRESENCE_GRACE_MS", "expected milliseconds")
            })?;
            presence.grace_period = Duration::from_millis(ms);
        }

        if let Some(value) = lookup("ORBITCAST_PRESENCE_STREAM_GRACE") {
            presence.stream_grace_periods = parse_stream_grace(&value)?;
        }

        if let Some(capacity) = lookup("ORBITCAST_PRESENCE_QUEUE") {
            presence.queue_capacity = capacity
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|c| *c > 0)
                .ok_or(ConfigError::InvalidEnv(
                    "ORBITCAST_PRESENCE_QUEUE",
                    "expected positive integer",
                ))?;
        }

        if let Some(ms) = lookup("ORBITCAST_PRESENCE_NOTIFY_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                ConfigError::InvalidEnv(
                    "ORBITCAST_PRESENCE_NOTIFY_TIMEOUT_MS",
                    "expected milliseconds",
                )
            })?;
            presence.notify_timeout = Duration::from_millis(ms);
        }

        Ok(Self {
            socket_path,
            presence,
        })
    }
}

/// Parse `prefix=ms,prefix=ms`
fn parse_stream_grace(value: &str) -> Result<Vec<(String, Duration)>, ConfigError> {
    const INVALID: ConfigError = ConfigError::InvalidEnv(
        "ORBITCAST_PRESENCE_STREAM_GRACE",
        "expected prefix=ms[,prefix=ms]",
    );

    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (prefix, ms) = pair.split_once('=').ok_or(INVALID)?;
            let ms: u64 = ms.trim().parse().map_err(|_| INVALID)?;
            Ok((prefix.trim().to_string(), Duration::from_millis(ms)))
        })
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("true") || v == "1" => Some(true),
        v if v.eq_ignore_ascii_case("false") || v == "0" => Some(false),
        _ => None,
    }
}

/// Get default socket path
fn default_socket_path<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("orbitcast")
        .join("presence.sock")
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert!(config.presence.enabled);
        assert_eq!(config.presence.grace_period, Duration::from_secs(15));
        assert_eq!(config.presence.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(
            config.socket_path,
            std::env::temp_dir().join("orbitcast").join("presence.sock")
        );
    }

    #[test]
    fn test_socket_path_under_runtime_dir() {
        let config = config_from(&[("XDG_RUNTIME_DIR", "/run/user/1000")]).unwrap();
        assert_eq!(
            config.socket_path,
            PathBuf::from("/run/user/1000/orbitcast/presence.sock")
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("ORBITCAST_SOCKET", "/tmp/p.sock"),
            ("ORBITCAST_PRESENCE", "0"),
            ("ORBITCAST_PRESENCE_GRACE_MS", "2500"),
            ("ORBITCAST_PRESENCE_QUEUE", "8"),
            ("ORBITCAST_PRESENCE_NOTIFY_TIMEOUT_MS", "50"),
        ])
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/p.sock"));
        assert!(!config.presence.enabled);
        assert_eq!(config.presence.grace_period, Duration::from_millis(2500));
        assert_eq!(config.presence.queue_capacity, 8);
        assert_eq!(config.presence.notify_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_stream_grace_longest_prefix_wins() {
        let config = config_from(&[
            ("ORBITCAST_PRESENCE_GRACE_MS", "1000"),
            ("ORBITCAST_PRESENCE_STREAM_GRACE", "chat:=5000, chat:vip:=0"),
        ])
        .unwrap();

        let presence = &config.presence;
        assert_eq!(presence.grace_period_for("chat:1"), Duration::from_secs(5));
        assert_eq!(presence.grace_period_for("chat:vip:1"), Duration::ZERO);
        assert_eq!(presence.grace_period_for("doc:1"), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values() {
        assert!(config_from(&[("ORBITCAST_PRESENCE", "maybe")]).is_err());
        assert!(config_from(&[("ORBITCAST_PRESENCE_GRACE_MS", "soon")]).is_err());
        assert!(config_from(&[("ORBITCAST_PRESENCE_QUEUE", "0")]).is_err());
        assert!(config_from(&[("ORBITCAST_PRESENCE_STREAM_GRACE", "chat:")]).is_err());
    }
}
