use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tower_http::compression::CompressionLayer;

use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    let json_routes = Router::new()
        .route("/status", get(status_handler))
        .layer(CompressionLayer::new());

    Router::new()
        .route("/lookup/{key}", get(lookup_handler))
        .route("/table", get(table_handler))
        .route("/health", get(health_handler))
        .merge(json_routes)
        .with_state(state)
}

async fn lookup_handler(State(state): State<SharedState>, Path(key): Path<String>) -> Response {
    let guard = state.load();
    let Some(route) = guard.lookup(&key) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "table not yet built").into_response();
    };

    let body = json!({
        "key": key,
        "item_hash": route.item_hash,
        "slot": route.slot,
        "shard_index": route.shard_index,
        "shard": route.shard.name,
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Serves the whole table as little-endian `u16` shard indices so data-plane
/// readers can do lookups locally.
async fn table_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let guard = state.load();
    if !guard.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "table not yet built").into_response();
    }

    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));

    let table_size = guard.table.len().to_string();
    let generation = guard.generation.to_string();
    let meta = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::HeaderName::from_static("x-table-size"), table_size),
        (header::HeaderName::from_static("x-table-generation"), generation),
    ];

    if accepts_gzip {
        (
            StatusCode::OK,
            meta,
            [(header::CONTENT_ENCODING, "gzip")],
            guard.encoded.gzip.clone(),
        )
            .into_response()
    } else {
        (StatusCode::OK, meta, guard.encoded.raw.clone()).into_response()
    }
}

async fn health_handler(State(state): State<SharedState>) -> Response {
    if state.load().is_ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn status_handler(State(state): State<SharedState>) -> Response {
    let guard = state.load();
    if !guard.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no table yet").into_response();
    }

    let counts = guard.table.slot_counts(guard.shards.len());
    let shards: Vec<_> = guard
        .shards
        .iter()
        .zip(counts)
        .map(|(shard, slots)| {
            json!({
                "name": shard.name,
                "weight": shard.weight,
                "slots": slots,
            })
        })
        .collect();

    let body = json!({
        "table_size": guard.table.len(),
        "generation": guard.generation,
        "last_rebuild_ago_secs": guard.built_at.elapsed().as_secs_f64(),
        "moved_slots": guard.moved_slots,
        "shards": shards,
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
