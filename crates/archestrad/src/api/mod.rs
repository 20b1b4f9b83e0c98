//! HTTP API for the archestrad daemon

pub mod events;
pub mod health;
pub mod interactions;
pub mod limits;
pub mod prompts;

use axum::{
    middleware,
    routing::{any, delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::proxy::{anthropic, openai, passthrough};
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

pub use health::HealthResponse;
pub use interactions::{InteractionsQuery, InteractionsResponse};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors_enabled = state.config.cors_enabled;
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public_routes = Router::new().route("/health", get(health::health));

    // Provider-compatible proxy surface. Completion endpoints run the full
    // policy pipeline; everything else under /v1/{provider}/ passes through.
    let proxy_routes = Router::new()
        .route("/v1/anthropic/v1/messages", post(anthropic::messages))
        .route(
            "/v1/anthropic/v1/:agent_id/messages",
            post(anthropic::messages_for_agent),
        )
        .route(
            "/v1/openai/v1/chat/completions",
            post(openai::chat_completions),
        )
        .route(
            "/v1/openai/v1/:agent_id/chat/completions",
            post(openai::chat_completions_for_agent),
        )
        .route("/v1/:provider/*rest", any(passthrough::forward));

    let admin_routes = Router::new()
        .route("/api/v1/prompts", post(prompts::create).get(prompts::list))
        .route(
            "/api/v1/prompts/:id",
            put(prompts::update).get(prompts::get),
        )
        .route(
            "/api/v1/agents/:agent_id/prompts",
            put(prompts::replace_agent_prompts),
        )
        .route("/api/v1/limits", post(limits::create).get(limits::list))
        .route("/api/v1/limits/:id", delete(limits::remove))
        .route("/api/v1/interactions", get(interactions::query))
        .route("/api/v1/events", get(events::stream_events))
        .layer(middleware::from_fn_with_state(
            state.rate_limit.clone(),
            rate_limit_middleware,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(proxy_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_enabled {
        app.layer(cors)
    } else {
        app
    }
}
