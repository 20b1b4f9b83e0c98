//! Anthropic Messages API wire types and client.
//!
//! Requests and responses stay in the provider's native shape end to end;
//! the policy pipeline works on the common internal message model, so this
//! module also owns the conversion in both directions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use archestra_core::{ChatMessage, FunctionCall, ToolCall};

use super::{error_body, streaming_client, unary_client, EventSource, UpstreamResult};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    /// Pass-through for sampling parameters and anything else the caller
    /// sent; the gateway neither inspects nor rewrites these.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl MessagesResponse {
    /// A synthetic end-turn response carrying only refusal text, in the
    /// provider's native shape.
    pub fn refusal(model: &str, text: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::now_v7().simple()),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: model.to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

/// Streaming events, tagged exactly as on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Value,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

impl StreamEvent {
    pub fn parse(data: &str) -> UpstreamResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Flatten an Anthropic `system` value (string or text blocks) to plain text.
fn system_text(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

/// Tool-result content arrives as a string or as content blocks; the policy
/// engines want the raw text.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                content.to_string()
            } else {
                texts.join("\n")
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert an inbound request into the common internal message list.
pub fn to_internal(request: &MessagesRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(ref system) = request.system {
        messages.push(ChatMessage::System {
            content: system_text(system),
        });
    }

    for message in &request.messages {
        match (&message.role[..], &message.content) {
            ("user", MessageContent::Text(text)) => {
                messages.push(ChatMessage::User {
                    content: text.clone(),
                });
            }
            ("user", MessageContent::Blocks(blocks)) => {
                let mut text = String::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            messages.push(ChatMessage::Tool {
                                tool_call_id: tool_use_id.clone(),
                                content: tool_result_text(content),
                            });
                        }
                        ContentBlock::ToolUse { .. } => {}
                    }
                }
                if !text.is_empty() {
                    messages.push(ChatMessage::User { content: text });
                }
            }
            ("assistant", MessageContent::Text(text)) => {
                messages.push(ChatMessage::Assistant {
                    content: Some(text.clone()),
                    tool_calls: Vec::new(),
                });
            }
            ("assistant", MessageContent::Blocks(blocks)) => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(t);
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCall {
                                id: id.clone(),
                                call_type: "function".to_string(),
                                function: FunctionCall {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        ContentBlock::ToolResult { .. } => {}
                    }
                }
                messages.push(ChatMessage::Assistant {
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls,
                });
            }
            _ => {
                tracing::warn!(role = %message.role, "unknown message role; dropping");
            }
        }
    }

    messages
}

/// Convert the (filtered, sanitised) internal messages back to the
/// provider's shape. Consecutive tool results merge into one user turn.
pub fn from_internal(messages: &[ChatMessage]) -> (Option<Value>, Vec<AnthropicMessage>) {
    let mut system: Option<String> = None;
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        match message {
            ChatMessage::System { content } => match system {
                Some(ref mut existing) => {
                    existing.push_str("\n\n");
                    existing.push_str(content);
                }
                None => system = Some(content.clone()),
            },
            ChatMessage::User { content } => {
                out.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: MessageContent::Text(content.clone()),
                });
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut blocks = Vec::new();
                if let Some(text) = content {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
                for call in tool_calls {
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input,
                    });
                }
                out.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: MessageContent::Blocks(blocks),
                });
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: Value::String(content.clone()),
                    is_error: None,
                };
                // Tool results live in user turns; merge runs of them.
                match out.last_mut() {
                    Some(AnthropicMessage {
                        role,
                        content: MessageContent::Blocks(blocks),
                    }) if role == "user"
                        && blocks
                            .iter()
                            .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        blocks.push(block);
                    }
                    _ => out.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: MessageContent::Blocks(vec![block]),
                    }),
                }
            }
        }
    }

    (system.map(Value::String), out)
}

pub struct AnthropicClient {
    unary: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(base_url: &str, upstream_deadline: Duration) -> UpstreamResult<Self> {
        Ok(Self {
            unary: unary_client(upstream_deadline)?,
            streaming: streaming_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    pub async fn messages(
        &self,
        api_key: &str,
        request: &MessagesRequest,
    ) -> UpstreamResult<MessagesResponse> {
        let mut request = request.clone();
        request.stream = false;

        let response = self
            .unary
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn stream_messages(
        &self,
        api_key: &str,
        request: &MessagesRequest,
    ) -> UpstreamResult<EventSource> {
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .streaming
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        Ok(EventSource::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with(messages: Vec<AnthropicMessage>, system: Option<Value>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4".to_string(),
            max_tokens: 1024,
            system,
            messages,
            tools: Vec::new(),
            stream: false,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn request_preserves_unknown_fields() {
        let raw = json!({
            "model": "claude-sonnet-4",
            "max_tokens": 256,
            "temperature": 0.2,
            "top_p": 0.9,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let request: MessagesRequest = serde_json::from_value(raw).expect("parse");
        assert_eq!(request.extra.get("temperature"), Some(&json!(0.2)));

        let out = serde_json::to_value(&request).expect("serialize");
        assert_eq!(out.get("temperature"), Some(&json!(0.2)));
        assert_eq!(out.get("top_p"), Some(&json!(0.9)));
        // stream=false stays off the wire.
        assert!(out.get("stream").is_none());
    }

    #[test]
    fn to_internal_splits_tool_results_and_text() {
        let request = request_with(
            vec![
                AnthropicMessage {
                    role: "assistant".to_string(),
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".to_string(),
                        name: "list_emails".to_string(),
                        input: json!({"folder": "inbox"}),
                    }]),
                },
                AnthropicMessage {
                    role: "user".to_string(),
                    content: MessageContent::Blocks(vec![
                        ContentBlock::ToolResult {
                            tool_use_id: "toolu_1".to_string(),
                            content: json!("{\"emails\":[]}"),
                            is_error: None,
                        },
                        ContentBlock::Text {
                            text: "anything urgent?".to_string(),
                        },
                    ]),
                },
            ],
            Some(json!("be careful")),
        );

        let internal = to_internal(&request);
        assert_eq!(internal.len(), 4);
        assert!(matches!(internal[0], ChatMessage::System { .. }));
        assert_eq!(internal[1].tool_calls().len(), 1);
        assert_eq!(internal[2].tool_call_id(), Some("toolu_1"));
        assert!(matches!(internal[3], ChatMessage::User { .. }));
    }

    #[test]
    fn round_trip_through_internal_keeps_tool_structure() {
        let internal = vec![
            ChatMessage::System {
                content: "sys".to_string(),
            },
            ChatMessage::User {
                content: "check mail".to_string(),
            },
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "toolu_1".to_string(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: "list_emails".to_string(),
                        arguments: "{\"folder\":\"inbox\"}".to_string(),
                    },
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "toolu_1".to_string(),
                content: "sanitised".to_string(),
            },
        ];

        let (system, messages) = from_internal(&internal);
        assert_eq!(system, Some(json!("sys")));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[2].role, "user");
        match &messages[2].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    assert_eq!(tool_use_id, "toolu_1");
                    assert_eq!(content, &json!("sanitised"));
                }
                other => panic!("expected tool_result, got {other:?}"),
            },
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn consecutive_tool_results_merge_into_one_user_turn() {
        let internal = vec![
            ChatMessage::Tool {
                tool_call_id: "a".to_string(),
                content: "1".to_string(),
            },
            ChatMessage::Tool {
                tool_call_id: "b".to_string(),
                content: "2".to_string(),
            },
        ];
        let (_, messages) = from_internal(&internal);
        assert_eq!(messages.len(), 1);
        match &messages[0].content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn stream_event_names_round_trip() {
        let event = StreamEvent::parse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        )
        .expect("parse");
        assert_eq!(event.name(), "content_block_delta");

        let event =
            StreamEvent::parse(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":10}}"#)
                .expect("parse");
        match event {
            StreamEvent::MessageDelta { usage, .. } => {
                assert_eq!(usage.unwrap()["output_tokens"], json!(10));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_text_handles_block_lists() {
        assert_eq!(tool_result_text(&json!("plain")), "plain");
        assert_eq!(
            tool_result_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(tool_result_text(&json!({"emails": []})), "{\"emails\":[]}");
    }
}
