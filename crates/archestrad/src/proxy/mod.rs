//! Proxy orchestrator: the request lifecycle shared by both providers.
//!
//! One handler per provider drives the same pipeline: resolve agent → quota
//! pre-check → tool upsert and merge → trust classification → dual-LLM
//! sanitisation → primary call → tool-invocation evaluation → persistence →
//! background usage accounting. Provider-specific wire handling lives in the
//! sibling modules.

pub mod anthropic;
pub mod openai;
pub mod passthrough;

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use archestra_core::{
    apply_tool_result_updates, Agent, ChatMessage, DualLlmEvaluator, DualLlmProgress,
    InvocationEvaluator, NewInteraction, NewTool, ProposedToolCall, QuotaEnforcer, Refusal,
    TrustClassification, TrustEngine, UsageDelta,
};

use crate::error::{Provider, ProxyError};
use crate::secondary::SecondaryClient;
use crate::state::{AppState, GatewayEvent};

/// Chat identity: supplied by the caller for cross-request reconstruction,
/// minted per request otherwise.
pub const CHAT_ID_HEADER: &str = "x-archestra-chat-id";

pub fn resolve_chat_id(headers: &HeaderMap) -> String {
    headers
        .get(CHAT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}

/// Resolve the agent: from the request path when present, otherwise
/// get-or-create a default agent derived from the user-agent header.
pub fn resolve_agent(
    state: &AppState,
    path_agent_id: Option<&str>,
    headers: &HeaderMap,
) -> Result<Agent, ProxyError> {
    match path_agent_id {
        Some(id) => state
            .repo
            .agents
            .find_agent(id)?
            .ok_or_else(|| ProxyError::NotFound(format!("agent {id}"))),
        None => {
            let user_agent = headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("default");
            Ok(state.repo.agents.get_or_create_agent(user_agent)?)
        }
    }
}

/// Quota pre-check, broadcasting the refusal when one fires.
pub fn quota_pre_check(state: &AppState, agent: &Agent) -> Result<Option<Refusal>, ProxyError> {
    let enforcer = QuotaEnforcer::new(state.repo.clone());
    let refusal = enforcer.pre_check(agent)?;
    if let Some(ref refusal) = refusal {
        state.broadcast(GatewayEvent {
            event_type: "refusal".to_string(),
            data: json!({
                "agent_id": agent.id,
                "kind": "token_cost",
                "audit": refusal.audit,
            }),
        });
    }
    Ok(refusal)
}

/// Upsert every inbound tool declaration, then merge the agent's stored
/// tool set over the request. Returns the merged tool list plus the names
/// of managed tools (agent-assigned, not declared in this request).
pub fn upsert_and_merge_tools(
    state: &AppState,
    agent: &Agent,
    request_tools: Vec<NewTool>,
) -> Result<(Vec<archestra_core::Tool>, Vec<String>), ProxyError> {
    let request_names: Vec<String> = request_tools.iter().map(|t| t.name.clone()).collect();
    for tool in request_tools {
        state.repo.tools.upsert_tool(tool)?;
    }

    let merged = state.repo.tools.tools_for_agent(&agent.id)?;
    let managed = merged
        .iter()
        .filter(|tool| !request_names.contains(&tool.name))
        .map(|tool| tool.name.clone())
        .collect();
    Ok((merged, managed))
}

/// Run trust classification over the conversation, broadcasting one event
/// per classified tool result. Repository failures here are pre-flight and
/// abort the request.
pub fn classify(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    messages: &[ChatMessage],
) -> Result<Vec<TrustClassification>, ProxyError> {
    let engine = TrustEngine::new(state.repo.clone());
    let classifications = engine.evaluate_policies(agent, chat_id, messages)?;

    for classification in &classifications {
        state.broadcast(GatewayEvent {
            event_type: "classification".to_string(),
            data: json!({
                "agent_id": agent.id,
                "chat_id": chat_id,
                "tool": classification.tool.name,
                "tool_call_id": classification.tool_call_id,
                "trusted": classification.trusted,
                "blocked": classification.blocked,
                "reason": classification.reason,
            }),
        });
    }

    Ok(classifications)
}

/// The sanitised conversation ready to forward upstream.
pub struct TrustOutcome {
    pub messages: Vec<ChatMessage>,
    pub context_is_trusted: bool,
}

/// Dual-LLM evaluation, rewrite application, and blocked-message filtering.
/// The secondary client is built fresh per request with the caller's
/// upstream key.
pub async fn sanitize(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    api_key: &str,
    classifications: &[TrustClassification],
    mut messages: Vec<ChatMessage>,
    progress: Option<&UnboundedSender<DualLlmProgress>>,
) -> Result<TrustOutcome, ProxyError> {
    let secondary = SecondaryClient::new(
        &state.config.providers.anthropic_base_url,
        &state.config.secondary_model,
        api_key,
        Duration::from_secs(state.config.deadlines.upstream_secs),
    )
    .map_err(|err| ProxyError::Internal(err.to_string()))?;

    let evaluator = DualLlmEvaluator::new(Arc::new(secondary));
    let outcome = evaluator
        .evaluate_context(classifications, &messages, progress)
        .await;

    tracing::debug!(
        agent_id = %agent.id,
        chat_id,
        rewrites = outcome.tool_result_updates.len(),
        context_is_trusted = outcome.context_is_trusted,
        "context trust evaluated"
    );

    apply_tool_result_updates(&mut messages, &outcome.tool_result_updates);

    let engine = TrustEngine::new(state.repo.clone());
    let messages = engine.filter_out_blocked_data(chat_id, messages)?;

    Ok(TrustOutcome {
        messages,
        context_is_trusted: outcome.context_is_trusted,
    })
}

/// Tool-invocation evaluation with refusal broadcasting.
pub fn evaluate_invocation(
    state: &AppState,
    agent: &Agent,
    calls: &[ProposedToolCall],
    context_is_trusted: bool,
) -> Result<Option<Refusal>, ProxyError> {
    let evaluator = InvocationEvaluator::new(state.repo.clone());
    let refusal = evaluator.evaluate(agent, calls, context_is_trusted)?;
    if let Some(ref refusal) = refusal {
        state.broadcast(GatewayEvent {
            event_type: "refusal".to_string(),
            data: json!({
                "agent_id": agent.id,
                "kind": "tool_invocation",
                "audit": refusal.audit,
            }),
        });
    }
    Ok(refusal)
}

/// Parse the model's proposed tool calls into the evaluator's shape.
/// Arguments that fail to parse evaluate as empty objects.
pub fn proposed_calls(tool_calls: &[archestra_core::ToolCall]) -> Vec<ProposedToolCall> {
    tool_calls
        .iter()
        .map(|call| ProposedToolCall {
            name: call.function.name.clone(),
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| json!({})),
        })
        .collect()
}

/// Persist a completed interaction. Post-upstream failures are logged and
/// swallowed: the user still sees their completion.
#[allow(clippy::too_many_arguments)]
pub fn persist_interaction(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    interaction_type: &str,
    request: serde_json::Value,
    response: serde_json::Value,
    tokens: (i64, i64),
    reason: Option<String>,
) {
    let result = state.repo.interactions.insert_interaction(NewInteraction {
        agent_id: agent.id.clone(),
        chat_id: Some(chat_id.to_string()),
        interaction_type: interaction_type.to_string(),
        request: Some(request),
        response: Some(response),
        input_tokens: tokens.0,
        output_tokens: tokens.1,
        content: None,
        trusted: false,
        blocked: false,
        reason,
    });
    if let Err(err) = result {
        tracing::warn!(
            agent_id = %agent.id,
            chat_id,
            error = %err,
            "failed to persist interaction"
        );
    }
}

/// Queue the background usage update for every governing scope.
pub fn enqueue_usage(state: &AppState, agent: &Agent, tokens_in: i64, tokens_out: i64) {
    if tokens_in == 0 && tokens_out == 0 {
        return;
    }

    let enforcer = QuotaEnforcer::new(state.repo.clone());
    let org_id = match enforcer.governing_scopes(agent) {
        Ok((_, org)) => org.map(|org| org.id),
        Err(err) => {
            tracing::warn!(agent_id = %agent.id, error = %err, "failed to resolve quota scopes");
            None
        }
    };

    state.quota_worker.try_enqueue(UsageDelta {
        agent_id: agent.id.clone(),
        team_ids: agent.team_ids.clone(),
        org_id,
        tokens_in,
        tokens_out,
    });
}

/// The refusal interaction type for a provider, e.g. `anthropic:refusal`.
pub fn refusal_type(provider: Provider) -> String {
    format!("{}:refusal", provider.as_str())
}

/// The completion interaction type for a provider.
pub fn completion_type(provider: Provider) -> String {
    match provider {
        Provider::Anthropic => "anthropic:messages".to_string(),
        Provider::OpenAi => "openai:chat_completions".to_string(),
    }
}
