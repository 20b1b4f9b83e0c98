//! Token-cost limit administration

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use archestra_core::{Limit, LimitEntity, LIMIT_TYPE_TOKEN_COST};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Clone, Debug, Deserialize)]
pub struct CreateLimitRequest {
    pub entity_type: LimitEntity,
    pub entity_id: String,
    /// Dollar limits carry a model for pricing; token limits omit it.
    #[serde(default)]
    pub model: Option<String>,
    pub limit_value: f64,
}

/// POST /api/v1/limits
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateLimitRequest>,
) -> Result<(StatusCode, Json<Limit>), ApiError> {
    if request.limit_value <= 0.0 || !request.limit_value.is_finite() {
        return Err(ApiError::Validation(
            "limit_value must be a positive finite number".to_string(),
        ));
    }
    if request.entity_id.trim().is_empty() {
        return Err(ApiError::Validation("entity_id must not be empty".to_string()));
    }
    if let Some(ref model) = request.model {
        if state.repo.token_prices.price_for_model(model)?.is_none() {
            return Err(ApiError::Validation(format!(
                "no token price configured for model `{model}`"
            )));
        }
    }

    let limit = state.repo.limits.insert_limit(Limit {
        id: Uuid::now_v7().to_string(),
        entity_type: request.entity_type,
        entity_id: request.entity_id,
        limit_type: LIMIT_TYPE_TOKEN_COST.to_string(),
        model: request.model,
        limit_value: request.limit_value,
        current_usage_tokens_in: 0,
        current_usage_tokens_out: 0,
        last_cleanup: None,
        updated_at: Utc::now(),
    })?;

    Ok((StatusCode::CREATED, Json(limit)))
}

/// GET /api/v1/limits
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Limit>>, ApiError> {
    Ok(Json(state.repo.limits.list_limits()?))
}

/// DELETE /api/v1/limits/:id
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.repo.limits.delete_limit(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("limit {id}")))
    }
}
