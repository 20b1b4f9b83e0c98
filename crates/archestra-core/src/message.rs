//! Common conversation message shape shared by both provider surfaces.
//!
//! Messages are a tagged union over `role`, serialised in the OpenAI chat
//! shape. Provider handlers convert their native formats into this model
//! before any policy evaluation runs, and back out afterwards.

use serde::{Deserialize, Serialize};

/// One conversation message, discriminated by role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A tool call proposed by the assistant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// The function half of a tool call; `arguments` is a raw JSON string as on
/// the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

fn default_call_type() -> String {
    "function".to_string()
}

impl ChatMessage {
    pub fn is_tool(&self) -> bool {
        matches!(self, ChatMessage::Tool { .. })
    }

    /// The tool_call_id, for tool-result messages.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            ChatMessage::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Tool calls carried by this message, if it is an assistant turn.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            ChatMessage::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Scan a slice of messages for the assistant tool call with the given id
/// and return the tool name it invoked.
pub fn tool_name_for_call<'a>(messages: &'a [ChatMessage], call_id: &str) -> Option<&'a str> {
    messages.iter().find_map(|message| {
        message
            .tool_calls()
            .iter()
            .find(|call| call.id == call_id)
            .map(|call| call.function.name.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_tag_round_trip() {
        let messages = vec![
            ChatMessage::System {
                content: "be helpful".to_string(),
            },
            ChatMessage::User {
                content: "check my email".to_string(),
            },
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: "list_emails".to_string(),
                        arguments: "{}".to_string(),
                    },
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "call_1".to_string(),
                content: "{\"emails\":[]}".to_string(),
            },
        ];

        let json = serde_json::to_string(&messages).expect("serialize");
        let parsed: Vec<ChatMessage> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, messages);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let result: Result<ChatMessage, _> =
            serde_json::from_str(r#"{"role":"narrator","content":"hi"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn tool_name_resolution_scans_assistant_turns() {
        let messages = vec![
            ChatMessage::Assistant {
                content: Some("checking".to_string()),
                tool_calls: vec![ToolCall {
                    id: "call_9".to_string(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: "read_calendar".to_string(),
                        arguments: "{}".to_string(),
                    },
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "call_9".to_string(),
                content: "busy".to_string(),
            },
        ];

        assert_eq!(tool_name_for_call(&messages, "call_9"), Some("read_calendar"));
        assert_eq!(tool_name_for_call(&messages, "call_missing"), None);
    }
}
