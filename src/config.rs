use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, ensure};
use serde::Deserialize;

/// Largest table the service agrees to build.
const MAX_TABLE_SIZE: usize = 1 << 24;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen: String,
    /// Number of slots. Must not change during the lifetime of the cluster.
    pub table_size: usize,
    #[serde(default)]
    pub shard_seed: u64,
    #[serde(default = "default_item_seed")]
    pub item_seed: u64,
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    pub shards: Vec<ShardConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    /// Relative weight; checked when the table is built.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_item_seed() -> u64 {
    1
}

fn default_reload_interval() -> u64 {
    10
}

fn default_weight() -> f64 {
    1.0
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Whether switching from `self` to `other` requires a new table.
    pub fn routing_differs(&self, other: &AppConfig) -> bool {
        self.table_size != other.table_size
            || self.shard_seed != other.shard_seed
            || self.item_seed != other.item_seed
            || self.shards != other.shards
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.table_size.is_power_of_two(),
            "table_size must be a positive power of two, got {}",
            self.table_size
        );
        ensure!(
            self.table_size <= MAX_TABLE_SIZE,
            "table_size must not exceed {}",
            MAX_TABLE_SIZE
        );
        ensure!(
            self.reload_interval_secs > 0,
            "reload_interval_secs must be greater than 0"
        );
        ensure!(!self.shards.is_empty(), "at least one shard is required");
        ensure!(
            self.shards.len() <= u16::MAX as usize,
            "at most {} shards are supported",
            u16::MAX
        );
        let mut names = HashSet::new();
        for (i, shard) in self.shards.iter().enumerate() {
            ensure!(!shard.name.is_empty(), "shard[{}] name must not be empty", i);
            ensure!(
                names.insert(shard.name.as_str()),
                "shard[{}] name {:?} is used more than once",
                i,
                shard.name
            );
        }
        Ok(())
    }
}
