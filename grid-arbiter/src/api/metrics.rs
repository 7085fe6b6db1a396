//! Counter snapshot handler

use axum::{Json, extract::State};
use grid_core::metrics::CounterValue;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::AppState;

/// GET /metrics
pub async fn snapshot(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, CounterValue>> {
    Json(state.counters.snapshot())
}
