//! Interaction audit-trail query endpoint

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archestra_core::{Interaction, InteractionFilter};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InteractionsQuery {
    pub agent_id: Option<String>,
    pub chat_id: Option<String>,
    #[serde(rename = "type")]
    pub interaction_type: Option<String>,
    pub blocked: Option<bool>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InteractionsResponse {
    pub interactions: Vec<Interaction>,
    pub count: usize,
}

const MAX_PAGE: usize = 500;

/// GET /api/v1/interactions
pub async fn query(
    State(state): State<AppState>,
    Query(query): Query<InteractionsQuery>,
) -> Result<Json<InteractionsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(MAX_PAGE);

    let filter = InteractionFilter {
        agent_id: query.agent_id,
        chat_id: query.chat_id,
        interaction_type: query.interaction_type,
        blocked: query.blocked,
        after: query.after,
        before: query.before,
        limit: Some(limit),
        offset: query.offset,
    };

    let interactions = state.repo.interactions.query_interactions(&filter)?;
    let count = interactions.len();
    Ok(Json(InteractionsResponse {
        interactions,
        count,
    }))
}
