use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::ensure;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::state::{SharedState, build_state};

pub enum ReloadOutcome {
    /// The routing-relevant part of the config is unchanged.
    Unchanged,
    /// A new snapshot was built and published.
    Rebuilt(Arc<AppConfig>),
}

/// Re-reads `config_path` every `reload_interval_secs` and publishes a new
/// table whenever the shard set changes. On any failure the current snapshot
/// keeps serving. `listen` and `reload_interval_secs` only apply on restart.
pub async fn run_reload_loop(config_path: PathBuf, initial: Arc<AppConfig>, state: SharedState) {
    let mut current = initial;
    let mut interval = time::interval(Duration::from_secs(current.reload_interval_secs));
    // The first tick fires immediately and the initial table is already built.
    interval.tick().await;

    loop {
        interval.tick().await;
        match reload_once(&config_path, &current, &state) {
            Ok(ReloadOutcome::Unchanged) => debug!("config unchanged"),
            Ok(ReloadOutcome::Rebuilt(config)) => current = config,
            Err(e) => warn!(error = %format!("{e:#}"), "reload failed, keeping current table"),
        }
    }
}

/// Runs one reload step against `current`, publishing into `state` on change.
pub fn reload_once(
    config_path: &Path,
    current: &AppConfig,
    state: &SharedState,
) -> anyhow::Result<ReloadOutcome> {
    let config = AppConfig::load(config_path)?;
    if !current.routing_differs(&config) {
        return Ok(ReloadOutcome::Unchanged);
    }
    ensure!(
        config.table_size == current.table_size,
        "table_size changed from {} to {}; it must stay constant for the lifetime of the cluster",
        current.table_size,
        config.table_size
    );

    let start = Instant::now();
    let previous = state.load_full();
    let next = build_state(&config, Some(previous.as_ref()))?;
    info!(
        generation = next.generation,
        shards = next.shards.len(),
        moved_slots = next.moved_slots.unwrap_or(0),
        duration_ms = start.elapsed().as_millis() as u64,
        "published new table"
    );
    state.store(Arc::new(next));
    Ok(ReloadOutcome::Rebuilt(Arc::new(config)))
}
