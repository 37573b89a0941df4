use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "GPS tracker streaming server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TRACKER_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "TRACKER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TRACKER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TRACKER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TRACKER_MAX_EXCHANGERS", help = "Upper bound on concurrently registered feeds (strict).")]
    pub max_exchangers: Option<usize>,

    #[clap(long, env = "TRACKER_WORKERS", help = "Number of route aggregation workers.")]
    pub workers: Option<usize>,

    #[clap(long, env = "TRACKER_TASK_CAPACITY", help = "Capacity of the shared task queue.")]
    pub task_capacity: Option<usize>,

    #[clap(long, env = "TRACKER_OUTBOUND_CAPACITY", help = "Per-subscriber outbound queue capacity.")]
    pub outbound_capacity: Option<usize>,

    #[clap(long, env = "TRACKER_INBOUND_CAPACITY", help = "Per-subscriber inbound queue capacity.")]
    pub inbound_capacity: Option<usize>,

    #[clap(long, env = "TRACKER_WRITE_CAPACITY", help = "Capacity of the outbound write channel.")]
    pub write_capacity: Option<usize>,

    #[clap(long, env = "TRACKER_AGGREGATE_EVERY", help = "Aggregate an open route every N fixes.")]
    pub aggregate_every: Option<usize>,

    #[clap(long, env = "TRACKER_TEST_FEEDS", help = "Number of synthetic feeds to start.")]
    pub test_feeds: Option<usize>,

    #[clap(long, env = "TRACKER_TEST_INTERVAL_MS", help = "Tick period of the synthetic feeds in milliseconds.")]
    pub test_interval_ms: Option<u64>,

    #[clap(
        long = "live-feed",
        env = "TRACKER_LIVE_FEEDS",
        value_delimiter = ',',
        help = "Live NDJSON feed as name@host:port. Repeatable or comma separated."
    )]
    pub live_feeds: Option<Vec<String>>,

    #[clap(long, env = "TRACKER_API_KEY", help = "API key subscribers must present. Empty disables the check.")]
    pub api_key: Option<String>,
}

/// A live feed target parsed from `name@host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFeed {
    pub name: String,
    pub host: String,
    pub port: String,
}

impl std::str::FromStr for LiveFeed {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (name, target) = raw
            .trim()
            .split_once('@')
            .with_context(|| format!("live feed '{}' is not name@host:port", raw))?;
        let (host, port) = target
            .rsplit_once(':')
            .with_context(|| format!("live feed '{}' has no port", raw))?;
        if name.is_empty() || host.is_empty() || port.parse::<u16>().is_err() {
            bail!("live feed '{}' is not name@host:port", raw);
        }
        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port: port.to_string(),
        })
    }
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            max_exchangers: other.max_exchangers.or(self.max_exchangers),
            workers: other.workers.or(self.workers),
            task_capacity: other.task_capacity.or(self.task_capacity),
            outbound_capacity: other.outbound_capacity.or(self.outbound_capacity),
            inbound_capacity: other.inbound_capacity.or(self.inbound_capacity),
            write_capacity: other.write_capacity.or(self.write_capacity),
            aggregate_every: other.aggregate_every.or(self.aggregate_every),
            test_feeds: other.test_feeds.or(self.test_feeds),
            test_interval_ms: other.test_interval_ms.or(self.test_interval_ms),
            live_feeds: other.live_feeds.or(self.live_feeds),
            api_key: other.api_key.or(self.api_key),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            max_exchangers: Some(16),
            workers: Some(4),
            task_capacity: Some(1024),
            outbound_capacity: Some(256),
            inbound_capacity: Some(64),
            write_capacity: Some(1024),
            aggregate_every: Some(5),
            test_feeds: Some(2),
            test_interval_ms: Some(100),
            ..Default::default()
        }
    }

    /// Every fix lands in a route; `0` would never aggregate an open route.
    pub fn aggregate_every(&self) -> usize {
        self.aggregate_every.unwrap_or(5).max(1)
    }

    pub fn parsed_live_feeds(&self) -> Result<Vec<LiveFeed>> {
        self.live_feeds
            .iter()
            .flatten()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| raw.parse())
            .collect()
    }
}

pub fn load_config() -> Config {
    // CLI args (which include env vars) are parsed once and applied last.
    build_config(Config::parse())
}

/// defaults -> config file -> env/CLI.
pub fn build_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_tracker.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    let Ok(config_str) = fs::read_to_string(path) else {
        log::warn!("Failed to read config file: {}. Falling back to other sources.", path.display());
        return None;
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!(
                "Failed to parse config file: {} ({}). Falling back to other sources.",
                path.display(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 7000, "workers": 9, "liveFeeds": ["a@10.0.0.1:5000"]}}"#).unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            workers: Some(2),
            ..Default::default()
        };
        let config = build_config(cli);

        assert_eq!(config.port, Some(7000));
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.max_exchangers, Some(16));
        assert_eq!(
            config.parsed_live_feeds().unwrap(),
            vec![LiveFeed {
                name: "a".into(),
                host: "10.0.0.1".into(),
                port: "5000".into()
            }]
        );
    }

    #[test]
    fn unreadable_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(build_config(cli).port, Some(9010));
    }

    #[test]
    fn live_feed_syntax() {
        assert!("feed@localhost:9100".parse::<LiveFeed>().is_ok());
        assert!("feed@[::1]:9100".parse::<LiveFeed>().is_ok());
        assert!("localhost:9100".parse::<LiveFeed>().is_err());
        assert!("feed@localhost".parse::<LiveFeed>().is_err());
        assert!("@localhost:9100".parse::<LiveFeed>().is_err());
        assert!("feed@localhost:http".parse::<LiveFeed>().is_err());
    }

    #[test]
    fn aggregate_every_never_zero() {
        let config = Config {
            aggregate_every: Some(0),
            ..Default::default()
        };
        assert_eq!(config.aggregate_every(), 1);
    }
}
