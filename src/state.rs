use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::config::AppConfig;
use crate::hasher::{item_hash, shard_hash};
use crate::maglev::{BuildError, Shard, Table, build_table};

pub type SharedState = Arc<ArcSwap<RoutingState>>;

/// An immutable routing snapshot. Readers `load` it, the reloader swaps in a
/// new one after every rebuild.
pub struct RoutingState {
    pub shards: Vec<ShardEntry>,
    pub table: Table,
    pub encoded: EncodedTable,
    pub item_seed: u64,
    /// Incremented on every rebuild; 0 means nothing was built yet.
    pub generation: u64,
    pub built_at: Instant,
    /// Slots that changed owner compared with the previous snapshot.
    pub moved_slots: Option<usize>,
}

pub struct ShardEntry {
    pub name: String,
    pub weight: f64,
    pub hash: u64,
}

/// Pre-rendered table bytes, so serving `/table` costs nothing per request.
pub struct EncodedTable {
    pub raw: Bytes,
    pub gzip: Bytes,
}

/// Result of routing a key.
pub struct Route<'a> {
    pub item_hash: u64,
    pub slot: usize,
    pub shard_index: usize,
    pub shard: &'a ShardEntry,
}

impl RoutingState {
    pub fn is_ready(&self) -> bool {
        self.generation > 0
    }

    /// Finds the shard owning `key`. `None` before the first build.
    pub fn lookup(&self, key: &str) -> Option<Route<'_>> {
        if !self.is_ready() {
            return None;
        }
        let item_hash = item_hash(key, self.item_seed);
        let shard_index = self.table.lookup(item_hash);
        Some(Route {
            item_hash,
            slot: self.table.slot(item_hash),
            shard_index,
            shard: &self.shards[shard_index],
        })
    }
}

/// Builds a new snapshot from `config`, comparing against `previous` to
/// report how many slots moved.
pub fn build_state(
    config: &AppConfig,
    previous: Option<&RoutingState>,
) -> anyhow::Result<RoutingState> {
    let shards: Vec<ShardEntry> = config
        .shards
        .iter()
        .map(|shard| ShardEntry {
            name: shard.name.clone(),
            weight: shard.weight,
            hash: shard_hash(&shard.name, config.shard_seed),
        })
        .collect();
    let input: Vec<Shard> = shards
        .iter()
        .map(|shard| Shard {
            hash: shard.hash,
            weight: shard.weight,
        })
        .collect();

    let table = build_table(&input, config.table_size).map_err(|e| {
        let context = match &e {
            BuildError::InvalidWeight { index, .. } => {
                format!("shard {:?} rejected", config.shards[*index].name)
            }
            BuildError::NoPositiveWeight => "no shard can own slots".to_string(),
        };
        anyhow::Error::new(e).context(context)
    })?;

    let moved_slots = previous
        .filter(|prev| prev.is_ready() && prev.table.len() == table.len())
        .map(|prev| prev.table.moved_slots(&table));
    let raw = table.to_le_bytes();
    let gzip = gzip_compress(&raw).context("failed to compress table")?;

    Ok(RoutingState {
        shards,
        encoded: EncodedTable {
            raw: Bytes::from(raw),
            gzip: Bytes::from(gzip),
        },
        table,
        item_seed: config.item_seed,
        generation: previous.map_or(0, |prev| prev.generation) + 1,
        built_at: Instant::now(),
        moved_slots,
    })
}

fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn empty_state() -> Arc<RoutingState> {
    Arc::new(RoutingState {
        shards: Vec::new(),
        table: Table::default(),
        encoded: EncodedTable {
            raw: Bytes::new(),
            gzip: Bytes::new(),
        },
        item_seed: 0,
        generation: 0,
        built_at: Instant::now(),
        moved_slots: None,
    })
}
