use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::http::{StatusCode, header};
use axum_test::TestServer;
use flate2::read::GzDecoder;

use crate::config::AppConfig;
use crate::hasher::item_hash;
use crate::reloader::{ReloadOutcome, reload_once, run_reload_loop};
use crate::server::router;
use crate::state::{SharedState, build_state, empty_state};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TABLE_SIZE: usize = 1024;

const SAMPLE_CONFIG: &str = r#"
listen = "127.0.0.1:0"
table_size = 1024
reload_interval_secs = 1

[[shards]]
name = "backend-a"
weight = 1.0

[[shards]]
name = "backend-b"
weight = 1.0

[[shards]]
name = "backend-c"
weight = 2.0
"#;

fn sample_config() -> AppConfig {
    AppConfig::parse(SAMPLE_CONFIG).expect("sample config should be valid")
}

/// Builds a SharedState holding a table for `config`.
fn populated_state(config: &AppConfig) -> SharedState {
    let state = build_state(config, None).expect("failed to build table");
    Arc::new(ArcSwap::from_pointee(state))
}

fn empty_shared_state() -> SharedState {
    Arc::new(ArcSwap::new(empty_state()))
}

fn test_server(state: SharedState) -> TestServer {
    TestServer::new(router(state)).expect("failed to create test server")
}

/// A config file in the temp dir, removed on drop.
struct TempConfig(PathBuf);

impl TempConfig {
    fn new(name: &str, content: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "weighted_maglev_{}_{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, content).expect("failed to write config");
        Self(path)
    }

    fn rewrite(&self, content: &str) {
        std::fs::write(&self.0, content).expect("failed to rewrite config");
    }
}

impl Drop for TempConfig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn decode_table(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

// ---------------------------------------------------------------------------
// /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_503_before_first_build() {
    let server = test_server(empty_shared_state());
    server
        .get("/health")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_returns_200_after_build() {
    let server = test_server(populated_state(&sample_config()));
    server.get("/health").await.assert_status_ok();
}

// ---------------------------------------------------------------------------
// /lookup/{key}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lookup_returns_503_before_first_build() {
    let server = test_server(empty_shared_state());
    server
        .get("/lookup/user:42")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn lookup_agrees_with_table() {
    let config = sample_config();
    let state = populated_state(&config);
    let table = state.load().table.clone();
    let server = test_server(state);

    for i in 0..50 {
        let key = format!("user:{i}");
        let resp = server.get(&format!("/lookup/{key}")).await;
        resp.assert_status_ok();
        let body: serde_json::Value = serde_json::from_str(&resp.text()).expect("invalid JSON");

        let hash = item_hash(&key, config.item_seed);
        let expected = table.lookup(hash);
        assert_eq!(body["key"], key);
        assert_eq!(body["item_hash"], hash);
        assert_eq!(body["slot"], table.slot(hash));
        assert_eq!(body["shard_index"], expected);
        assert_eq!(body["shard"], config.shards[expected].name);
    }
}

#[tokio::test]
async fn lookup_is_deterministic_across_builds() {
    let server1 = test_server(populated_state(&sample_config()));
    let server2 = test_server(populated_state(&sample_config()));

    for i in 0..50 {
        let path = format!("/lookup/item-{i}");
        assert_eq!(server1.get(&path).await.text(), server2.get(&path).await.text());
    }
}

// ---------------------------------------------------------------------------
// /table
// ---------------------------------------------------------------------------

#[tokio::test]
async fn table_returns_503_before_first_build() {
    let server = test_server(empty_shared_state());
    server
        .get("/table")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn table_returns_raw_slots_by_default() {
    let state = populated_state(&sample_config());
    let expected = state.load().table.to_vec();
    let server = test_server(state);

    let resp = server.get("/table").await;
    resp.assert_status_ok();
    assert!(
        resp.headers().get(header::CONTENT_ENCODING).is_none(),
        "expected no content-encoding for raw response"
    );
    assert_eq!(
        resp.headers()
            .get("x-table-size")
            .and_then(|v| v.to_str().ok()),
        Some("1024")
    );
    assert_eq!(
        resp.headers()
            .get("x-table-generation")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    assert_eq!(decode_table(&resp.as_bytes().to_vec()), expected);
}

#[tokio::test]
async fn gzip_and_raw_table_match() {
    let server = test_server(populated_state(&sample_config()));

    let raw = server.get("/table").await.as_bytes().to_vec();

    let gzip_resp = server
        .get("/table")
        .add_header(header::ACCEPT_ENCODING, "gzip")
        .await;
    gzip_resp.assert_status_ok();
    let ce = gzip_resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert_eq!(ce, "gzip", "expected gzip content-encoding");

    let compressed = gzip_resp.as_bytes().to_vec();
    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .expect("failed to decompress");

    assert_eq!(raw.len(), TABLE_SIZE * 2);
    assert_eq!(raw, decompressed);
}

// ---------------------------------------------------------------------------
// /status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_returns_503_before_first_build() {
    let server = test_server(empty_shared_state());
    server
        .get("/status")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn status_reports_distribution() {
    let server = test_server(populated_state(&sample_config()));
    let resp = server.get("/status").await;
    resp.assert_status_ok();

    let ct = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(ct.contains("application/json"), "expected JSON content-type");

    let body: serde_json::Value = serde_json::from_str(&resp.text()).expect("invalid JSON");
    assert_eq!(body["table_size"], TABLE_SIZE);
    assert_eq!(body["generation"], 1);
    assert!(body["moved_slots"].is_null());
    assert!(
        body["last_rebuild_ago_secs"].is_number(),
        "last_rebuild_ago_secs should be a number"
    );

    let shards = body["shards"].as_array().expect("shards should be an array");
    assert_eq!(shards.len(), 3);
    let slots: Vec<u64> = shards.iter().map(|s| s["slots"].as_u64().unwrap()).collect();
    assert_eq!(slots.iter().sum::<u64>(), TABLE_SIZE as u64);
    // backend-c has twice the weight of the others.
    assert!((508..=516).contains(&slots[2]), "unexpected split: {slots:?}");
}

// ---------------------------------------------------------------------------
// Reloading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reload_ignores_unchanged_config() {
    let file = TempConfig::new("unchanged", SAMPLE_CONFIG);
    let config = sample_config();
    let state = populated_state(&config);

    let outcome = reload_once(&file.0, &config, &state).unwrap();
    assert!(matches!(outcome, ReloadOutcome::Unchanged));
    assert_eq!(state.load().generation, 1);
}

#[tokio::test]
async fn reload_publishes_new_weights() {
    let file = TempConfig::new("weights", &SAMPLE_CONFIG.replace("weight = 2.0", "weight = 2.2"));
    let config = sample_config();
    let state = populated_state(&config);
    let before = state.load_full();

    let outcome = reload_once(&file.0, &config, &state).unwrap();
    let ReloadOutcome::Rebuilt(new_config) = outcome else {
        panic!("expected a rebuild");
    };
    assert_eq!(new_config.shards[2].weight, 2.2);

    let after = state.load_full();
    assert_eq!(after.generation, 2);
    let moved = after.moved_slots.expect("movement should be recorded");
    assert_eq!(moved, before.table.moved_slots(&after.table));
    assert!(moved > 0 && moved < TABLE_SIZE / 4, "moved {moved} slots");
}

#[tokio::test]
async fn reload_rejects_table_size_change() {
    let file = TempConfig::new("resize", &SAMPLE_CONFIG.replace("1024", "2048"));
    let config = sample_config();
    let state = populated_state(&config);

    let err = reload_once(&file.0, &config, &state).err().expect("resize must fail");
    assert!(err.to_string().contains("table_size changed"), "{err}");
    assert_eq!(state.load().generation, 1);
    assert_eq!(state.load().table.len(), TABLE_SIZE);
}

#[tokio::test]
async fn reload_keeps_table_on_invalid_weight() {
    let file = TempConfig::new("negative", &SAMPLE_CONFIG.replace("weight = 2.0", "weight = -2.0"));
    let config = sample_config();
    let state = populated_state(&config);
    let before = state.load_full();

    assert!(reload_once(&file.0, &config, &state).is_err());
    let after = state.load_full();
    assert!(Arc::ptr_eq(&before, &after), "snapshot should not be replaced");
}

/// Runs the real reload loop against a config file on disk and waits for it
/// to publish a table for an added shard.
#[tokio::test]
async fn reload_loop_picks_up_new_shard() {
    let file = TempConfig::new("loop", SAMPLE_CONFIG);
    let config = Arc::new(sample_config());
    let state = populated_state(&config);
    let server = test_server(state.clone());

    tokio::spawn(run_reload_loop(file.0.clone(), config, state.clone()));

    file.rewrite(&format!(
        "{SAMPLE_CONFIG}\n[[shards]]\nname = \"backend-d\"\nweight = 1.0\n"
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for reload");
        }
        if state.load().generation >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let status: serde_json::Value =
        serde_json::from_str(&server.get("/status").await.text()).unwrap();
    assert_eq!(status["shards"].as_array().unwrap().len(), 4);
    assert!(status["moved_slots"].as_u64().unwrap() > 0);
}

// ---------------------------------------------------------------------------
// Snapshot publication
// ---------------------------------------------------------------------------

/// Readers keep routing to a complete table while snapshots are swapped.
#[tokio::test]
async fn readers_always_see_a_complete_table() {
    let config = sample_config();
    let state = populated_state(&config);

    let mut readers = tokio::task::JoinSet::new();
    for r in 0..4 {
        let state = state.clone();
        readers.spawn(async move {
            for i in 0..2000 {
                {
                    let guard = state.load();
                    assert_eq!(guard.table.len(), TABLE_SIZE);
                    let route = guard.lookup(&format!("reader-{r}-{i}")).unwrap();
                    assert!(route.shard_index < guard.shards.len());
                }
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }

    for weight in [2.1, 2.2, 2.3, 2.4, 2.5] {
        let mut next_config = config.clone();
        next_config.shards[2].weight = weight;
        let previous = state.load_full();
        let next = build_state(&next_config, Some(previous.as_ref())).unwrap();
        state.store(Arc::new(next));
        tokio::task::yield_now().await;
    }

    while let Some(res) = readers.join_next().await {
        res.expect("reader panicked");
    }
    assert_eq!(state.load().generation, 6);
}
