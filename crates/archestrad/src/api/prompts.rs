//! Prompt and agent-prompt administration

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use archestra_core::store::NewPrompt;
use archestra_core::{AgentPrompt, Prompt, PromptType};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Clone, Debug, Deserialize)]
pub struct CreatePromptRequest {
    pub org_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub prompt_type: PromptType,
    pub content: String,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_created_by() -> String {
    "admin".to_string()
}

/// POST /api/v1/prompts
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreatePromptRequest>,
) -> Result<(StatusCode, Json<Prompt>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::Validation("prompt name must not be empty".to_string()));
    }
    if request.content.trim().is_empty() {
        return Err(ApiError::Validation("prompt content must not be empty".to_string()));
    }

    let prompt = state.repo.prompts.create_prompt(NewPrompt {
        org_id: request.org_id,
        name: request.name,
        prompt_type: request.prompt_type,
        content: request.content,
        created_by: request.created_by,
    })?;

    Ok((StatusCode::CREATED, Json(prompt)))
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpdatePromptRequest {
    pub content: String,
}

/// PUT /api/v1/prompts/:id — versioned update: the current row is
/// deactivated and a successor inserted.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdatePromptRequest>,
) -> Result<Json<Prompt>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::Validation("prompt content must not be empty".to_string()));
    }
    let prompt = state.repo.prompts.update_prompt(&id, &request.content)?;
    Ok(Json(prompt))
}

/// GET /api/v1/prompts/:id
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Prompt>, ApiError> {
    let prompt = state
        .repo
        .prompts
        .find_prompt(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("prompt {id}")))?;
    Ok(Json(prompt))
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListPromptsQuery {
    pub org_id: String,
}

/// GET /api/v1/prompts?org_id=...
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListPromptsQuery>,
) -> Result<Json<Vec<Prompt>>, ApiError> {
    Ok(Json(state.repo.prompts.list_prompts(&query.org_id)?))
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReplaceAgentPromptsRequest {
    #[serde(default)]
    pub system_prompt_id: Option<String>,
    #[serde(default)]
    pub regular_prompt_ids: Vec<String>,
}

/// PUT /api/v1/agents/:agent_id/prompts — atomic replacement of the agent's
/// prompt set.
pub async fn replace_agent_prompts(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<ReplaceAgentPromptsRequest>,
) -> Result<Json<Vec<AgentPrompt>>, ApiError> {
    let agent = state
        .repo
        .agents
        .find_agent(&agent_id)?
        .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id}")))?;

    for prompt_id in request
        .regular_prompt_ids
        .iter()
        .chain(request.system_prompt_id.iter())
    {
        if state.repo.prompts.find_prompt(prompt_id)?.is_none() {
            return Err(ApiError::NotFound(format!("prompt {prompt_id}")));
        }
    }

    let rows = state.repo.prompts.replace_agent_prompts(
        &agent.id,
        request.system_prompt_id.as_deref(),
        &request.regular_prompt_ids,
    )?;
    Ok(Json(rows))
}
