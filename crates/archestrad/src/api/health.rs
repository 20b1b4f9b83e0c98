//! Health endpoint

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: i64,
    pub interaction_count: u64,
    pub quota_updates_dropped: u64,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let interaction_count = state
        .repo
        .interactions
        .count_interactions()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to count interactions");
            0
        });

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        interaction_count,
        quota_updates_dropped: state.quota_worker.dropped_total(),
    })
}
