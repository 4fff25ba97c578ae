//! Weighted Maglev consistent hashing.
//!
//! [`maglev::build_table`] is the whole algorithm. The other modules wrap it in
//! a small control-plane service that hashes named shards, rebuilds the table
//! when the config changes and publishes it for lock-free lookups.

pub mod config;
pub mod hasher;
pub mod maglev;
pub mod reloader;
pub mod server;
pub mod state;
#[cfg(test)]
mod tests;

pub use maglev::{BuildError, Shard, Table, build_table};
