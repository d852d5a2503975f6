//! Czar status endpoint
//!
//! A small JSON surface for operators: `GET /status` reports uptime and
//! query counts, `GET /status/queries` the live process list. Responses use
//! the `{success, error, ...payload}` envelope.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::czar::Czar;

/// Build the status router over a czar handle.
pub fn create_router(czar: Arc<Czar>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/status/queries", get(queries))
        .with_state(czar)
}

async fn status(State(czar): State<Arc<Czar>>) -> Json<serde_json::Value> {
    Json(czar.status_summary())
}

async fn queries(State(czar): State<Arc<Czar>>) -> Json<serde_json::Value> {
    let bundle = czar.process_list(true);
    let queries: Vec<serde_json::Value> = bundle
        .rows
        .iter()
        .map(|row| {
            json!({
                "query_id": row.first().cloned().flatten(),
                "state": row.get(1).cloned().flatten(),
                "submitted": row.get(2).cloned().flatten(),
                "sql": row.get(3).cloned().flatten(),
            })
        })
        .collect();
    Json(json!({ "success": true, "error": "", "queries": queries }))
}
