//! OpenAI chat-completions proxy handler.
//!
//! The streaming surface is `chat.completion.chunk` framing with a terminal
//! `[DONE]`. Tool-call fragments are buffered until the stream concludes;
//! refused calls never leave the gateway.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use archestra_core::{Agent, ChatMessage, FunctionCall, ToolCall};

use crate::error::{Provider, ProxyError};
use crate::state::{AppState, GatewayEvent};
use crate::upstream::openai::{
    ChatCompletionChunk, ChatCompletionsRequest, ChatCompletionsResponse, OpenAiFunction,
    OpenAiTool, OpenAiUsage,
};

use super::{
    classify, completion_type, enqueue_usage, evaluate_invocation, persist_interaction,
    proposed_calls, quota_pre_check, refusal_type, resolve_agent, resolve_chat_id, sanitize,
    upsert_and_merge_tools,
};

/// POST /v1/openai/v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    handle(state, None, headers, body).await
}

/// POST /v1/openai/v1/:agent_id/chat/completions
pub async fn chat_completions_for_agent(
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
        Ok(Err(err)) => err.into_provider_response(Provider::OpenAi),
        Err(_) => ProxyError::Timeout.into_provider_response(Provider::OpenAi),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn run(
    state: AppState,
    path_agent_id: Option<String>,
    headers: HeaderMap,
    body: Value,
) -> Result<Response, ProxyError> {
    let api_key = bearer_token(&headers)
        .ok_or_else(|| ProxyError::Unauthorized("missing bearer token".to_string()))?;

    let agent = resolve_agent(&state, path_agent_id.as_deref(), &headers)?;
    let chat_id = resolve_chat_id(&headers);

    let result = process(&state, &agent, &chat_id, &api_key, body.clone()).await;
    if let Err(ref err) = result {
        // Error states leave an audit record too.
        persist_interaction(
            &state,
            &agent,
            &chat_id,
            &refusal_type(Provider::OpenAi),
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
    let request: ChatCompletionsRequest = serde_json::from_value(body.clone())
        .map_err(|err| ProxyError::Validation(format!("invalid chat completions request: {err}")))?;

    if let Some(refusal) = quota_pre_check(state, agent)? {
        let response = ChatCompletionsResponse::refusal(&request.model, &refusal.user);
        persist_interaction(
            state,
            agent,
            chat_id,
            &refusal_type(Provider::OpenAi),
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

    let request_tools: Vec<archestra_core::NewTool> = request
        .tools
        .iter()
        .map(|tool| archestra_core::NewTool {
            agent_id: agent.id.clone(),
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
            allow_usage_when_untrusted_data_is_present: false,
            data_is_trusted_by_default: false,
        })
        .collect();
    let (merged_tools, managed_names) = upsert_and_merge_tools(state, agent, request_tools)?;

    let internal = request.messages.clone();
    let classifications = classify(state, agent, chat_id, &internal)?;

    let mut upstream_request = request.clone();
    upstream_request.tools = merged_tools
        .iter()
        .map(|tool| OpenAiTool {
            tool_type: "function".to_string(),
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
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
    mut upstream_request: ChatCompletionsRequest,
    outcome: super::TrustOutcome,
    managed_names: Vec<String>,
) -> Result<Response, ProxyError> {
    upstream_request.messages = outcome.messages.clone();

    let response = state
        .openai
        .chat_completions(api_key, &upstream_request)
        .await?;
    let mut tokens = (
        response.usage.prompt_tokens,
        response.usage.completion_tokens,
    );

    let tool_calls = response.proposed_tool_calls().to_vec();
    let calls = proposed_calls(&tool_calls);

    if !calls.is_empty() {
        if let Some(refusal) =
            evaluate_invocation(state, agent, &calls, outcome.context_is_trusted)?
        {
            let refusal_response =
                ChatCompletionsResponse::refusal(&upstream_request.model, &refusal.user);
            persist_interaction(
                state,
                agent,
                chat_id,
                &refusal_type(Provider::OpenAi),
                original_body,
                serde_json::to_value(&refusal_response).unwrap_or(Value::Null),
                tokens,
                Some(refusal.audit),
            );
            enqueue_usage(state, agent, tokens.0, tokens.1);
            return Ok(Json(refusal_response).into_response());
        }

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
            tokens.0 += final_response.usage.prompt_tokens;
            tokens.1 += final_response.usage.completion_tokens;

            persist_interaction(
                state,
                agent,
                chat_id,
                &completion_type(Provider::OpenAi),
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
        &completion_type(Provider::OpenAi),
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
    mut followup_request: ChatCompletionsRequest,
    prior_messages: &[ChatMessage],
    response: &ChatCompletionsResponse,
    tool_calls: &[ToolCall],
) -> Result<ChatCompletionsResponse, ProxyError> {
    let mut messages = prior_messages.to_vec();
    if let Some(choice) = response.choices.first() {
        messages.push(choice.message.clone());
    }

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

    followup_request.messages = outcome.messages;
    Ok(state
        .openai
        .chat_completions(api_key, &followup_request)
        .await?)
}

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

/// OpenAI streams are data-only SSE: no event names, terminal `[DONE]`.
async fn send_data(tx: &EventSender, data: String) -> bool {
    tx.send(Ok(Event::default().data(data))).await.is_ok()
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

fn chunk_value(id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
    })
}

fn stream_refusal(model: &str, text: &str) -> Response {
    let (tx, rx) = mpsc::channel(16);
    let id = format!("chatcmpl-{}", uuid::Uuid::now_v7().simple());
    let model = model.to_string();
    let text = text.to_string();

    tokio::spawn(async move {
        let chunks = vec![
            chunk_value(&id, &model, json!({"role": "assistant", "content": ""}), None),
            chunk_value(&id, &model, json!({"content": text}), None),
            chunk_value(&id, &model, json!({}), Some("stop")),
        ];
        for chunk in chunks {
            if !send_data(&tx, chunk.to_string()).await {
                return;
            }
        }
        let _ = send_data(&tx, "[DONE]".to_string()).await;
    });

    sse_response(rx)
}

/// Accumulator for one streamed tool call.
#[derive(Clone, Debug, Default)]
struct BufferedCall {
    id: String,
    name: String,
    arguments: String,
}

impl BufferedCall {
    fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            id: self.id.clone(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: self.name.clone(),
                arguments: if self.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    self.arguments.clone()
                },
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: AppState,
    agent: Agent,
    chat_id: String,
    api_key: String,
    original_body: Value,
    upstream_request: ChatCompletionsRequest,
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
            let _ = send_data(
                &tx,
                json!({"error": {"message": err.to_string(), "type": "server_error"}}).to_string(),
            )
            .await;
            let _ = send_data(&tx, "[DONE]".to_string()).await;

            persist_interaction(
                &state,
                &agent,
                &chat_id,
                &refusal_type(Provider::OpenAi),
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
    mut upstream_request: ChatCompletionsRequest,
    classifications: Vec<archestra_core::TrustClassification>,
    internal: Vec<ChatMessage>,
    tx: &EventSender,
) -> Result<(), ProxyError> {
    if !send_data(
        tx,
        json!({"object": "archestra.dual_llm.start"}).to_string(),
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
                "object": "archestra.dual_llm.progress",
                "question": progress.question,
                "options": progress.options,
                "answer": progress.answer,
            });
            let _ = event_tx.send(GatewayEvent {
                event_type: "dual_llm_progress".to_string(),
                data: data.clone(),
            });
            if !send_data(&forward_tx, data.to_string()).await {
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

    upstream_request.messages = outcome.messages;

    let mut source = state
        .openai
        .stream_chat_completions(api_key, &upstream_request)
        .await?;

    let mut buffered: BTreeMap<usize, BufferedCall> = BTreeMap::new();
    let mut text = String::new();
    let mut tokens = (0i64, 0i64);
    let mut chunk_id = format!("chatcmpl-{}", uuid::Uuid::now_v7().simple());
    let mut model = upstream_request.model.clone();
    let mut held_finish: Option<String> = None;

    while let Some(sse) = source.next_event().await? {
        if sse.data.is_empty() {
            continue;
        }
        if sse.data.trim() == "[DONE]" {
            finish_stream(
                state,
                agent,
                chat_id,
                original_body,
                outcome.context_is_trusted,
                tx,
                FinishState {
                    buffered: &buffered,
                    text: &text,
                    tokens,
                    chunk_id: &chunk_id,
                    model: &model,
                    held_finish: held_finish.take(),
                },
            )
            .await?;
            return Ok(());
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(&sse.data) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable upstream chunk; forwarding verbatim");
                if !send_data(tx, sse.data).await {
                    return Ok(());
                }
                continue;
            }
        };

        chunk_id = chunk.id.clone();
        model = chunk.model.clone();
        if let Some(ref usage) = chunk.usage {
            tokens = (usage.prompt_tokens, usage.completion_tokens);
        }

        let Some(choice) = chunk.choices.first() else {
            // Usage-only frames stay internal; the assembled tail re-emits
            // totals.
            continue;
        };

        if !choice.delta.tool_calls.is_empty() {
            for delta in &choice.delta.tool_calls {
                let slot = buffered.entry(delta.index).or_default();
                if let Some(ref id) = delta.id {
                    slot.id = id.clone();
                }
                if let Some(ref function) = delta.function {
                    if let Some(ref name) = function.name {
                        slot.name = name.clone();
                    }
                    if let Some(ref arguments) = function.arguments {
                        slot.arguments.push_str(arguments);
                    }
                }
            }
            if let Some(ref reason) = choice.finish_reason {
                held_finish = Some(reason.clone());
            }
            continue;
        }

        if let Some(ref reason) = choice.finish_reason {
            if !buffered.is_empty() {
                held_finish = Some(reason.clone());
                continue;
            }
        }

        if let Some(ref content) = choice.delta.content {
            text.push_str(content);
        }
        if !send_data(tx, sse.data).await {
            return Ok(());
        }
    }

    Ok(())
}

struct FinishState<'a> {
    buffered: &'a BTreeMap<usize, BufferedCall>,
    text: &'a str,
    tokens: (i64, i64),
    chunk_id: &'a str,
    model: &'a str,
    held_finish: Option<String>,
}

async fn finish_stream(
    state: &AppState,
    agent: &Agent,
    chat_id: &str,
    original_body: &Value,
    context_is_trusted: bool,
    tx: &EventSender,
    finish: FinishState<'_>,
) -> Result<(), ProxyError> {
    let tool_calls: Vec<ToolCall> = finish
        .buffered
        .values()
        .map(BufferedCall::to_tool_call)
        .collect();
    let calls = proposed_calls(&tool_calls);

    let refusal = if calls.is_empty() {
        None
    } else {
        evaluate_invocation(state, agent, &calls, context_is_trusted)?
    };

    match refusal {
        Some(refusal) => {
            let chunks = vec![
                chunk_value(
                    finish.chunk_id,
                    finish.model,
                    json!({"content": refusal.user.clone()}),
                    None,
                ),
                chunk_value(finish.chunk_id, finish.model, json!({}), Some("stop")),
            ];
            for chunk in chunks {
                if !send_data(tx, chunk.to_string()).await {
                    return Ok(());
                }
            }
            if !send_data(tx, "[DONE]".to_string()).await {
                return Ok(());
            }

            let mut response = ChatCompletionsResponse::refusal(finish.model, &refusal.user);
            response.usage = OpenAiUsage {
                prompt_tokens: finish.tokens.0,
                completion_tokens: finish.tokens.1,
                total_tokens: finish.tokens.0 + finish.tokens.1,
            };
            persist_interaction(
                state,
                agent,
                chat_id,
                &refusal_type(Provider::OpenAi),
                original_body.clone(),
                serde_json::to_value(&response).unwrap_or(Value::Null),
                finish.tokens,
                Some(refusal.audit),
            );
        }
        None => {
            for (index, (_, call)) in finish.buffered.iter().enumerate() {
                let delta = json!({"tool_calls": [{
                    "index": index,
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                }]});
                if !send_data(
                    tx,
                    chunk_value(finish.chunk_id, finish.model, delta, None).to_string(),
                )
                .await
                {
                    return Ok(());
                }
            }
            if !tool_calls.is_empty() || finish.held_finish.is_some() {
                let reason = finish.held_finish.as_deref().unwrap_or("tool_calls");
                if !send_data(
                    tx,
                    chunk_value(finish.chunk_id, finish.model, json!({}), Some(reason))
                        .to_string(),
                )
                .await
                {
                    return Ok(());
                }
            }
            if !send_data(tx, "[DONE]".to_string()).await {
                return Ok(());
            }

            let message = ChatMessage::Assistant {
                content: if finish.text.is_empty() {
                    None
                } else {
                    Some(finish.text.to_string())
                },
                tool_calls: tool_calls.clone(),
            };
            let response = json!({
                "id": finish.chunk_id,
                "object": "chat.completion",
                "created": chrono::Utc::now().timestamp(),
                "model": finish.model,
                "choices": [{
                    "index": 0,
                    "message": message,
                    "finish_reason": if tool_calls.is_empty() { "stop" } else { "tool_calls" },
                }],
                "usage": {
                    "prompt_tokens": finish.tokens.0,
                    "completion_tokens": finish.tokens.1,
                    "total_tokens": finish.tokens.0 + finish.tokens.1,
                },
            });
            persist_interaction(
                state,
                agent,
                chat_id,
                &completion_type(Provider::OpenAi),
                original_body.clone(),
                response,
                finish.tokens,
                None,
            );
        }
    }

    enqueue_usage(state, agent, finish.tokens.0, finish.tokens.1);
    Ok(())
}
