//! Configuration parsing for the Tidings server.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Backing store for the pending queue, history and subscription index.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// SQLite database under the data directory
    Sqlite,
    /// In-process maps, lost on restart
    Memory,
}

/// What happens to a user's earlier connection when they attach again.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedePolicy {
    /// Cancel the earlier session; it closes its own socket
    Evict,
    /// Leave the earlier socket open but unreachable through the registry
    Keep,
}

/// A `USER=TOPIC[,TOPIC...]` follow preloaded at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follow {
    pub user_id: String,
    pub topics: Vec<String>,
}

fn parse_follow(raw: &str) -> Result<Follow, String> {
    let (user, topics) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected USER=TOPIC[,TOPIC], got '{raw}'"))?;
    let user = user.trim();
    if user.is_empty() {
        return Err("follow user cannot be empty".to_string());
    }
    let topics: Vec<String> = topics
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if topics.is_empty() {
        return Err(format!("follow for '{user}' names no topics"));
    }
    Ok(Follow {
        user_id: user.to_string(),
        topics,
    })
}

/// Tidings: real-time notification delivery with offline queueing.
#[derive(Parser, Debug, Clone)]
#[command(name = "tidings")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "TIDINGS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "TIDINGS_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Data directory for the SQLite database
    #[arg(short, long, env = "TIDINGS_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Storage backend
    #[arg(long, env = "TIDINGS_STORAGE", value_enum, default_value_t = StorageBackend::Sqlite)]
    pub storage: StorageBackend,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Size of the SQLite connection pool
    #[arg(long, env = "TIDINGS_POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Buffered messages per user channel before slow receivers lag
    #[arg(long, env = "TIDINGS_BROKER_CHANNEL_SIZE", default_value_t = 1024)]
    pub broker_channel_size: usize,

    /// Delay between topic fan-out cycles, in seconds
    #[arg(long, env = "TIDINGS_FANOUT_INTERVAL_SECS", default_value_t = 10)]
    pub fanout_interval_secs: u64,

    /// Text prepended to every topic fan-out message
    #[arg(long, env = "TIDINGS_FANOUT_PREFIX", default_value = "Market Update: ")]
    pub fanout_prefix: String,

    /// Topic events buffered between fan-out cycles
    #[arg(long, env = "TIDINGS_EVENT_QUEUE_SIZE", default_value_t = 1024)]
    pub event_queue_size: usize,

    /// Socket write timeout in milliseconds
    #[arg(long, env = "TIDINGS_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Start live relay without waiting for backlog replay to finish
    #[arg(long, env = "TIDINGS_UNORDERED_REPLAY")]
    pub unordered_replay: bool,

    /// Policy for a user's earlier connection when they attach again
    #[arg(long, env = "TIDINGS_SUPERSEDE", value_enum, default_value_t = SupersedePolicy::Evict)]
    pub supersede: SupersedePolicy,

    /// Preload follows at startup (USER=TOPIC[,TOPIC], repeatable)
    #[arg(long = "follow", value_parser = parse_follow)]
    pub follows: Vec<Follow>,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a configuration for tests: memory storage, random port.
    pub fn test_config(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir,
            storage: StorageBackend::Memory,
            log_level: "debug".into(),
            pool_size: 2,
            broker_channel_size: 64,
            fanout_interval_secs: 1,
            event_queue_size: 64,
            write_timeout_ms: 1000,
            ..Self::default()
        }
    }

    pub fn fanout_interval(&self) -> Duration {
        Duration::from_secs(self.fanout_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            storage: StorageBackend::Sqlite,
            log_level: "info".into(),
            pool_size: 10,
            broker_channel_size: 1024,
            fanout_interval_secs: 10,
            fanout_prefix: "Market Update: ".into(),
            event_queue_size: 1024,
            write_timeout_ms: 5000,
            unordered_replay: false,
            supersede: SupersedePolicy::Evict,
            follows: Vec::new(),
            otel_endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.fanout_interval(), Duration::from_secs(10));
        assert_eq!(config.supersede, SupersedePolicy::Evict);
    }

    #[test]
    fn test_parse_follow() {
        let follow = parse_follow("user1=AAPL, MSFT").unwrap();
        assert_eq!(follow.user_id, "user1");
        assert_eq!(follow.topics, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn test_parse_follow_rejects_malformed() {
        assert!(parse_follow("user1").is_err());
        assert!(parse_follow("=AAPL").is_err());
        assert!(parse_follow("user1=,").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let config = Config::try_parse_from([
            "tidings",
            "--storage",
            "memory",
            "--supersede",
            "keep",
            "--unordered-replay",
            "--follow",
            "user1=AAPL",
            "--follow",
            "user2=MSFT",
        ])
        .unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.supersede, SupersedePolicy::Keep);
        assert!(config.unordered_replay);
        assert_eq!(config.follows.len(), 2);
    }
}
