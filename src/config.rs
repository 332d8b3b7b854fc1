use std::{fs, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    feed::{MongoFeedConfig, MySqlFeedConfig},
    filter::Filter,
    poller::{Poller, DEFAULT_LIMIT, DEFAULT_POLL_INTERVAL, DEFAULT_TRAILING_LAG},
    repository::Repository,
};

pub const DEFAULT_SNAPSHOT_THRESHOLD: u32 = 100;
pub const DEFAULT_RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub poll: PollConfig,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connection_string: String,
    pub snapshot_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub poll_interval_ms: u64,
    /// Safety window subtracted from "now" before a poll may read. Must
    /// exceed the worst-case transaction duration plus clock skew across
    /// writers.
    pub trailing_lag_ms: u64,
    pub limit: usize,
    pub ring_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            trailing_lag_ms: DEFAULT_TRAILING_LAG.as_millis() as u64,
            limit: DEFAULT_LIMIT,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl PollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn trailing_lag(&self) -> Duration {
        Duration::from_millis(self.trailing_lag_ms)
    }

    /// Builds a poller carrying this configuration.
    pub fn poller<R: Repository>(&self, repo: Arc<R>, filter: Filter) -> Poller<R> {
        Poller::new(repo)
            .with_poll_interval(self.poll_interval())
            .with_trailing_lag(self.trailing_lag())
            .with_limit(self.limit)
            .with_filter(filter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub partitions: u32,
    pub partition_low: u32,
    pub partition_hi: u32,
    /// Channel name for the LISTEN/NOTIFY variant.
    pub channel: String,
    pub mysql: MySqlFeedConfig,
    pub mongo: MongoFeedConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            partitions: 0,
            partition_low: 0,
            partition_hi: 0,
            channel: "events".into(),
            mysql: MySqlFeedConfig::default(),
            mongo: MongoFeedConfig::default(),
        }
    }
}

impl FeedConfig {
    pub fn partition_filter(&self) -> Filter {
        Filter::new().with_partitions(self.partitions, self.partition_low, self.partition_hi)
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.poll.trailing_lag(), Duration::from_millis(200));
        assert_eq!(config.poll.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.poll.limit, 20);
        assert_eq!(config.store.snapshot_threshold, 100);
    }

    #[test]
    fn load_or_default_reads_the_file_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let missing = load_or_default(&path).unwrap();
        assert_eq!(missing.poll.limit, 20);

        fs::write(&path, "[store]\nsnapshot_threshold = 7\n").unwrap();
        let loaded = load_or_default(&path).unwrap();
        assert_eq!(loaded.store.snapshot_threshold, 7);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [poll]
            trailing_lag_ms = 500

            [feed]
            partitions = 4
            partition_low = 0
            partition_hi = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.poll.trailing_lag(), Duration::from_millis(500));
        assert_eq!(config.poll.limit, 20);
        let filter = config.feed.partition_filter();
        assert_eq!(filter.partitions, 4);
        assert_eq!(filter.partition_hi, 1);
    }
}
