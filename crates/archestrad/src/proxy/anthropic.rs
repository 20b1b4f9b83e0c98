//! Anthropic Messages proxy handler.
//!
//! Streaming responses reproduce the provider's event vocabulary exactly:
//! `message_start`, `content_block_start`, `content_block_delta`,
//! `message_delta`, `message_stop`. Tool-use blocks are buffered until their
//! `input_json_delta` stream concludes; a tool-invocation refusal suppresses
//! every buffered tool event and streams the user refusal as a text delta.

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use archestra_core::{Agent, ChatMessage, FunctionCall, Refusal, ToolCall};

use crate::error::{Provider, ProxyError};
use crate::state::{AppState, GatewayEvent};
use crate::upstream::anthropic::{
    from_internal, to_internal, AnthropicTool, MessagesRequest, MessagesResponse, StreamEvent,
};

use super::{
    classify, completion_type, enqueue_usage, evaluate_invocation, persist_interaction,
    proposed_calls, quota_pre_check, refusal_type, resolve_agent, resolve_chat_id, sanitize,
    upsert_and_merge_tools,
};

/// POST /v1/anthropic/v1/messages
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, None, headers, body).await
}

/// POST /v1/anthropic/v1/:agent_id/messages
pub async fn messages_for_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, Some(agent_id), headers, body).await
}

async fn handle(
    state: AppState,
    path_agent_id: Option<String>,
    headers: HeaderMap,
    body: Value,
) -> Response {
    let deadline = std::time::Duration::from_secs(state.config.deadlines.request_secs);
    match tokio::time::timeout(deadline, run(state, path_agent_id, headers, body)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => err.into_provider_response(Provider::Anthropic),
        Err(_) => ProxyError::Timeout.into_provider_response(Provider::Anthropic),
    }
}

async fn run(
    state: AppState,
    path_agent_id: Option<String>,
    headers: HeaderMap,
    body: Value,
) -> Result<Response, ProxyError> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Unauthorized("missing x-api-key header".to_string()))?;

    let agent = resolve_agent(&state, path_agent_id.as_deref(), &headers)?;
    let chat_id = resolve_chat_id(&headers);

    let result = process(&state, &agent, &chat_id, &api_key, body.clone()).await;
    if let Err(ref err) = result {
        // Error states leave an audit record too.
        persist_interaction(
            &state,
            &agent,
            &chat_id,
            &refusal_type(Provider::Anthropic),
            body,
            serde_json::json!({"error": err.to_string()}),
            (0, 0),
            Some(err.to_string()),
        );
    }
    result
}

async fn process(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    api_key: &str,
    body: Value,
) -> Result<Response, ProxyError> {
    let request: MessagesRequest = serde_json::from_value(body.clone())
        .map_err(|err| ProxyError::Validation(format!("invalid messages request: {err}")))?;

    // Quota pre-flight: refusals are 200s in the provider's shape, streamed
    // when the caller asked for a stream. No upstream call happens.
    if let Some(refusal) = quota_pre_check(state, agent)? {
        let response = MessagesResponse::refusal(&request.model, &refusal.user);
        persist_interaction(
            state,
            agent,
            chat_id,
            &refusal_type(Provider::Anthropic),
            body,
            serde_json::to_value(&response).unwrap_or(Value::Null),
            (0, 0),
            Some(refusal.audit.clone()),
        );
        return Ok(if request.stream {
            stream_refusal(&request.model, &refusal.user)
        } else {
            Json(response).into_response()
        });
    }

    // Persist inbound tool declarations, then inject managed tools; the
    // stored definition wins on name collision.
    let request_tools: Vec<archestra_core::NewTool> = request
        .tools
        .iter()
        .map(|tool| archestra_core::NewTool {
            agent_id: agent.id.clone(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
            allow_usage_when_untrusted_data_is_present: false,
            data_is_trusted_by_default: false,
        })
        .collect();
    let (merged_tools, managed_names) = upsert_and_merge_tools(state, agent, request_tools)?;

    let internal = to_internal(&request);
    let classifications = classify(state, agent, chat_id, &internal)?;

    let mut upstream_request = request.clone();
    upstream_request.tools = merged_tools
        .iter()
        .map(|tool| AnthropicTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        })
        .collect();

    if request.stream {
        return Ok(stream_response(
            state.clone(),
            agent.clone(),
            chat_id.to_string(),
            api_key.to_string(),
            body,
            upstream_request,
            classifications,
            internal,
        ));
    }

    let outcome = sanitize(
        state,
        agent,
        chat_id,
        api_key,
        &classifications,
        internal,
        None,
    )
    .await?;

    unary(
        state,
        agent,
        chat_id,
        api_key,
        body,
        upstream_request,
        outcome,
        managed_names,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn unary(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    api_key: &str,
    original_body: Value,
    mut upstream_request: MessagesRequest,
    outcome: super::TrustOutcome,
    managed_names: Vec<String>,
) -> Result<Response, ProxyError> {
    let (system, messages) = from_internal(&outcome.messages);
    upstream_request.system = system;
    upstream_request.messages = messages;

    let response = state
        .anthropic
        .messages(api_key, &upstream_request)
        .await?;
    let mut tokens = (response.usage.input_tokens, response.usage.output_tokens);

    let tool_calls = tool_calls_of(&response);
    let calls = proposed_calls(&tool_calls);

    if !calls.is_empty() {
        if let Some(refusal) =
            evaluate_invocation(state, agent, &calls, outcome.context_is_trusted)?
        {
            let refusal_response = MessagesResponse::refusal(&upstream_request.model, &refusal.user);
            persist_interaction(
                state,
                agent,
                chat_id,
                &refusal_type(Provider::Anthropic),
                original_body,
                serde_json::to_value(&refusal_response).unwrap_or(Value::Null),
                tokens,
                Some(refusal.audit),
            );
            enqueue_usage(state, agent, tokens.0, tokens.1);
            return Ok(Json(refusal_response).into_response());
        }

        // Managed tool calls execute through the MCP client and feed a
        // follow-up provider call; client-declared tools go back to the
        // caller untouched.
        if calls.iter().all(|call| managed_names.contains(&call.name)) {
            let final_response = execute_managed_and_follow_up(
                state,
                agent,
                chat_id,
                api_key,
                upstream_request.clone(),
                &outcome.messages,
                &response,
                &tool_calls,
            )
            .await?;
            tokens.0 += final_response.usage.input_tokens;
            tokens.1 += final_response.usage.output_tokens;

            persist_interaction(
                state,
                agent,
                chat_id,
                &completion_type(Provider::Anthropic),
                original_body,
                serde_json::to_value(&final_response).unwrap_or(Value::Null),
                tokens,
                None,
            );
            enqueue_usage(state, agent, tokens.0, tokens.1);
            return Ok(Json(final_response).into_response());
        }
    }

    persist_interaction(
        state,
        agent,
        chat_id,
        &completion_type(Provider::Anthropic),
        original_body,
        serde_json::to_value(&response).unwrap_or(Value::Null),
        tokens,
        None,
    );
    enqueue_usage(state, agent, tokens.0, tokens.1);
    Ok(Json(response).into_response())
}

#[allow(clippy::too_many_arguments)]
async fn execute_managed_and_follow_up(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    api_key: &str,
    mut followup_request: MessagesRequest,
    prior_messages: &[ChatMessage],
    response: &MessagesResponse,
    tool_calls: &[ToolCall],
) -> Result<MessagesResponse, ProxyError> {
    let mut messages = prior_messages.to_vec();
    messages.push(assistant_message_of(response));

    for call in tool_calls {
        let arguments: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        let content = match state.mcp.execute(&call.function.name, &arguments).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    tool = %call.function.name,
                    error = %err,
                    "managed tool execution failed"
                );
                format!("tool execution failed: {err}")
            }
        };
        messages.push(ChatMessage::Tool {
            tool_call_id: call.id.clone(),
            content,
        });
    }

    // Fresh tool results run through the same classification and isolation
    // pipeline before the follow-up call.
    let classifications = classify(state, agent, chat_id, &messages)?;
    let outcome = sanitize(
        state,
        agent,
        chat_id,
        api_key,
        &classifications,
        messages,
        None,
    )
    .await?;

    let (system, upstream_messages) = from_internal(&outcome.messages);
    followup_request.system = system;
    followup_request.messages = upstream_messages;

    Ok(state.anthropic.messages(api_key, &followup_request).await?)
}

/// The assistant turn carried by a response, in the internal shape.
fn assistant_message_of(response: &MessagesResponse) -> ChatMessage {
    use crate::upstream::anthropic::ContentBlock;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult { .. } => {}
        }
    }

    ChatMessage::Assistant {
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls,
    }
}

fn tool_calls_of(response: &MessagesResponse) -> Vec<ToolCall> {
    use crate::upstream::anthropic::ContentBlock;

    response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            _ => None,
        })
        .collect()
}

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

async fn send_event(tx: &EventSender, name: &str, data: &Value) -> bool {
    let event = Event::default().event(name).data(data.to_string());
    tx.send(Ok(event)).await.is_ok()
}

/// Stream a refusal as a complete, well-formed message exchange.
fn stream_refusal(model: &str, text: &str) -> Response {
    let (tx, rx) = mpsc::channel(16);
    let model = model.to_string();
    let text = text.to_string();

    tokio::spawn(async move {
        for (name, data) in refusal_event_sequence(&model, &text) {
            if !send_event(&tx, name, &data).await {
                return;
            }
        }
    });

    sse_response(rx)
}

fn refusal_event_sequence(model: &str, text: &str) -> Vec<(&'static str, Value)> {
    vec![
        (
            "message_start",
            json!({"type": "message_start", "message": {
                "id": format!("msg_{}", uuid::Uuid::now_v7().simple()),
                "type": "message", "role": "assistant", "model": model,
                "content": [], "stop_reason": null, "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }}),
        ),
        (
            "content_block_start",
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "text", "text": ""}}),
        ),
        (
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "text_delta", "text": text}}),
        ),
        (
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
        (
            "message_delta",
            json!({"type": "message_delta",
                   "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                   "usage": {"output_tokens": 0}}),
        ),
        ("message_stop", json!({"type": "message_stop"})),
    ]
}

fn sse_response(rx: mpsc::Receiver<Result<Event, Infallible>>) -> Response {
    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

/// A tool-use block held back until invocation evaluation decides its fate.
struct BufferedToolUse {
    index: usize,
    id: String,
    name: String,
    partial_json: String,
    start_event: Value,
}

impl BufferedToolUse {
    fn to_tool_call(&self) -> ToolCall {
        let arguments = if self.partial_json.trim().is_empty() {
            "{}".to_string()
        } else {
            self.partial_json.clone()
        };
        ToolCall {
            id: self.id.clone(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: self.name.clone(),
                arguments,
            },
        }
    }
}

fn tool_use_start(content_block: &Value) -> Option<(String, String)> {
    if content_block.get("type").and_then(Value::as_str) == Some("tool_use") {
        let id = content_block.get("id").and_then(Value::as_str)?;
        let name = content_block.get("name").and_then(Value::as_str)?;
        Some((id.to_string(), name.to_string()))
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    agent: Agent,
    chat_id: String,
    api_key: String,
    original_body: Value,
    upstream_request: MessagesRequest,
    classifications: Vec<archestra_core::TrustClassification>,
    internal: Vec<ChatMessage>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        if let Err(err) = drive_stream(
            &state,
            &agent,
            &chat_id,
            &api_key,
            &original_body,
            upstream_request,
            classifications,
            internal,
            &tx,
        )
        .await
        {
            tracing::warn!(error = %err, chat_id = %chat_id, "streaming request failed");
            let _ = send_event(
                &tx,
                "error",
                &json!({"type": "error",
                        "error": {"type": "api_error", "message": err.to_string()}}),
            )
            .await;
            let _ = send_event(
                &tx,
                "message_delta",
                &json!({"type": "message_delta",
                        "delta": {"stop_reason": "error", "stop_sequence": null},
                        "usage": {"output_tokens": 0}}),
            )
            .await;
            let _ = send_event(&tx, "message_stop", &json!({"type": "message_stop"})).await;

            persist_interaction(
                &state,
                &agent,
                &chat_id,
                &refusal_type(Provider::Anthropic),
                original_body,
                json!({"error": err.to_string()}),
                (0, 0),
                Some(err.to_string()),
            );
        }
    });

    sse_response(rx)
}

#[allow(clippy::too_many_arguments)]
async fn drive_stream(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    api_key: &str,
    original_body: &Value,
    mut upstream_request: MessagesRequest,
    classifications: Vec<archestra_core::TrustClassification>,
    internal: Vec<ChatMessage>,
    tx: &EventSender,
) -> Result<(), ProxyError> {
    // Dual-LLM trail streams to the caller while evaluation runs.
    if !send_event(
        tx,
        "archestra_dual_llm_start",
        &json!({"type": "archestra_dual_llm_start"}),
    )
    .await
    {
        return Ok(());
    }

    let (progress_tx, mut progress_rx) =
        mpsc::unbounded_channel::<archestra_core::DualLlmProgress>();
    let forward_tx = tx.clone();
    let event_tx = state.event_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            let data = json!({
                "type": "archestra_dual_llm_progress",
                "question": progress.question,
                "options": progress.options,
                "answer": progress.answer,
            });
            let _ = event_tx.send(GatewayEvent {
                event_type: "dual_llm_progress".to_string(),
                data: data.clone(),
            });
            if !send_event(&forward_tx, "archestra_dual_llm_progress", &data).await {
                break;
            }
        }
    });

    let outcome = sanitize(
        state,
        agent,
        chat_id,
        api_key,
        &classifications,
        internal,
        Some(&progress_tx),
    )
    .await;
    drop(progress_tx);
    let _ = forwarder.await;
    let outcome = outcome?;

    let (system, messages) = from_internal(&outcome.messages);
    upstream_request.system = system;
    upstream_request.messages = messages;

    let mut source = state
        .anthropic
        .stream_messages(api_key, &upstream_request)
        .await?;

    let mut buffered: Vec<BufferedToolUse> = Vec::new();
    let mut buffered_by_index: HashMap<usize, usize> = HashMap::new();
    let mut text = String::new();
    let mut tokens = (0i64, 0i64);
    let mut stop_reason: Option<String> = None;
    let mut held_message_delta: Option<Value> = None;

    while let Some(sse) = source.next_event().await? {
        if sse.data.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(&sse.data) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable upstream event; dropping");
                continue;
            }
        };
        let event = match StreamEvent::parse(&sse.data) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "unknown upstream event; forwarding verbatim");
                let name = sse.event.as_deref().unwrap_or("message");
                let _ = tx
                    .send(Ok(Event::default().event(name.to_string()).data(sse.data)))
                    .await;
                continue;
            }
        };

        match event {
            StreamEvent::MessageStart { ref message } => {
                tokens.0 = message
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if !send_event(tx, "message_start", &raw).await {
                    return Ok(());
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                ref content_block,
            } => {
                if let Some((id, name)) = tool_use_start(content_block) {
                    buffered_by_index.insert(index, buffered.len());
                    buffered.push(BufferedToolUse {
                        index,
                        id,
                        name,
                        partial_json: String::new(),
                        start_event: raw.clone(),
                    });
                } else if !send_event(tx, "content_block_start", &raw).await {
                    return Ok(());
                }
            }
            StreamEvent::ContentBlockDelta { index, ref delta } => {
                if let Some(&slot) = buffered_by_index.get(&index) {
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        buffered[slot].partial_json.push_str(partial);
                    }
                } else {
                    if let Some(t) = delta.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                    if !send_event(tx, "content_block_delta", &raw).await {
                        return Ok(());
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if !buffered_by_index.contains_key(&index)
                    && !send_event(tx, "content_block_stop", &raw).await
                {
                    return Ok(());
                }
            }
            StreamEvent::MessageDelta {
                ref delta,
                ref usage,
            } => {
                if let Some(reason) = delta.get("stop_reason").and_then(Value::as_str) {
                    stop_reason = Some(reason.to_string());
                }
                if let Some(out) = usage
                    .as_ref()
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_i64)
                {
                    tokens.1 = out;
                }
                held_message_delta = Some(raw);
            }
            StreamEvent::MessageStop => {
                let finished = finish_stream(
                    state,
                    agent,
                    chat_id,
                    original_body,
                    &upstream_request,
                    outcome.context_is_trusted,
                    tx,
                    FinishState {
                        buffered: &buffered,
                        text: &text,
                        tokens,
                        stop_reason: stop_reason.clone(),
                        held_message_delta: held_message_delta.take(),
                        raw_stop: raw,
                    },
                )
                .await?;
                if !finished {
                    return Ok(());
                }
            }
            StreamEvent::Ping => {
                if !send_event(tx, "ping", &raw).await {
                    return Ok(());
                }
            }
            StreamEvent::Error { .. } => {
                let _ = send_event(tx, "error", &raw).await;
            }
        }
    }

    Ok(())
}

struct FinishState<'a> {
    buffered: &'a [BufferedToolUse],
    text: &'a str,
    tokens: (i64, i64),
    stop_reason: Option<String>,
    held_message_delta: Option<Value>,
    raw_stop: Value,
}

/// Terminal phase of a stream: evaluate buffered tool calls, then either
/// flush them in their original order or replace them with a refusal.
#[allow(clippy::too_many_arguments)]
async fn finish_stream(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    original_body: &Value,
    upstream_request: &MessagesRequest,
    context_is_trusted: bool,
    tx: &EventSender,
    finish: FinishState<'_>,
) -> Result<bool, ProxyError> {
    let tool_calls: Vec<ToolCall> = finish.buffered.iter().map(|b| b.to_tool_call()).collect();
    let calls = proposed_calls(&tool_calls);

    let refusal: Option<Refusal> = if calls.is_empty() {
        None
    } else {
        evaluate_invocation(state, agent, &calls, context_is_trusted)?
    };

    match refusal {
        Some(refusal) => {
            // Suppress every buffered tool event; the user sees a refusal
            // text block instead.
            let index = finish.buffered.iter().map(|b| b.index).max().unwrap_or(0) + 1;
            let events = vec![
                json!({"type": "content_block_start", "index": index,
                       "content_block": {"type": "text", "text": ""}}),
                json!({"type": "content_block_delta", "index": index,
                       "delta": {"type": "text_delta", "text": refusal.user.clone()}}),
                json!({"type": "content_block_stop", "index": index}),
                json!({"type": "message_delta",
                       "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                       "usage": {"output_tokens": finish.tokens.1}}),
            ];
            for data in &events {
                let name = data["type"].as_str().unwrap_or("message");
                if !send_event(tx, name, data).await {
                    return Ok(false);
                }
            }
            if !send_event(tx, "message_stop", &finish.raw_stop).await {
                return Ok(false);
            }

            let response = refusal_interaction_response(upstream_request, &refusal, finish.tokens);
            persist_interaction(
                state,
                agent,
                chat_id,
                &refusal_type(Provider::Anthropic),
                original_body.clone(),
                response,
                finish.tokens,
                Some(refusal.audit),
            );
        }
        None => {
            for buffered in finish.buffered {
                if !send_event(tx, "content_block_start", &buffered.start_event).await {
                    return Ok(false);
                }
                let delta = json!({"type": "content_block_delta", "index": buffered.index,
                                   "delta": {"type": "input_json_delta",
                                             "partial_json": buffered.partial_json}});
                if !send_event(tx, "content_block_delta", &delta).await {
                    return Ok(false);
                }
                let stop = json!({"type": "content_block_stop", "index": buffered.index});
                if !send_event(tx, "content_block_stop", &stop).await {
                    return Ok(false);
                }
            }
            if let Some(held) = finish.held_message_delta {
                if !send_event(tx, "message_delta", &held).await {
                    return Ok(false);
                }
            }
            if !send_event(tx, "message_stop", &finish.raw_stop).await {
                return Ok(false);
            }

            let response = assembled_response(
                upstream_request,
                finish.text,
                &tool_calls,
                finish.stop_reason.as_deref(),
                finish.tokens,
            );
            persist_interaction(
                state,
                agent,
                chat_id,
                &completion_type(Provider::Anthropic),
                original_body.clone(),
                response,
                finish.tokens,
                None,
            );
        }
    }

    enqueue_usage(state, agent, finish.tokens.0, finish.tokens.1);
    Ok(true)
}

fn refusal_interaction_response(
    request: &MessagesRequest,
    refusal: &Refusal,
    tokens: (i64, i64),
) -> Value {
    let mut response = MessagesResponse::refusal(&request.model, &refusal.user);
    response.usage.input_tokens = tokens.0;
    response.usage.output_tokens = tokens.1;
    serde_json::to_value(&response).unwrap_or(Value::Null)
}

fn assembled_response(
    request: &MessagesRequest,
    text: &str,
    tool_calls: &[ToolCall],
    stop_reason: Option<&str>,
    tokens: (i64, i64),
) -> Value {
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for call in tool_calls {
        let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }

    json!({
        "id": format!("msg_{}", uuid::Uuid::now_v7().simple()),
        "type": "message",
        "role": "assistant",
        "model": request.model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": tokens.0, "output_tokens": tokens.1},
    })
}
