//! OpenAI chat-completions wire types and client.
//!
//! The internal message model is the OpenAI shape, so request messages
//! deserialize straight into [`ChatMessage`] and no conversion layer exists
//! on this surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use archestra_core::{ChatMessage, ToolCall};

use super::{error_body, streaming_client, unary_client, EventSource, UpstreamResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<OpenAiTool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    pub function: OpenAiFunction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_tool_type() -> String {
    "function".to_string()
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: OpenAiUsage,
}

impl ChatCompletionsResponse {
    /// A synthetic completion carrying only refusal text.
    pub fn refusal(model: &str, text: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::now_v7().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::Assistant {
                    content: Some(text.to_string()),
                    tool_calls: Vec::new(),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: OpenAiUsage::default(),
        }
    }

    /// Tool calls proposed by the first choice.
    pub fn proposed_tool_calls(&self) -> &[ToolCall] {
        self.choices
            .first()
            .map(|choice| choice.message.tool_calls())
            .unwrap_or(&[])
    }
}

/// One streamed chunk (`chat.completion.chunk`). Deltas stay as raw values:
/// the orchestrator only inspects tool-call fragments and text content, and
/// forwards everything else untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

pub struct OpenAiClient {
    unary: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, upstream_deadline: Duration) -> UpstreamResult<Self> {
        Ok(Self {
            unary: unary_client(upstream_deadline)?,
            streaming: streaming_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    pub async fn chat_completions(
        &self,
        api_key: &str,
        request: &ChatCompletionsRequest,
    ) -> UpstreamResult<ChatCompletionsResponse> {
        let mut request = request.clone();
        request.stream = false;

        let response = self
            .unary
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn stream_chat_completions(
        &self,
        api_key: &str,
        request: &ChatCompletionsRequest,
    ) -> UpstreamResult<EventSource> {
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .streaming
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_body(response).await);
        }

        Ok(EventSource::new(response))
    }
}
