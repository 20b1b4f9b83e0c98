//! Refusal payloads shared by the invocation evaluator and quota enforcement.
//!
//! A refusal is not an error: it travels back to the caller as a normal
//! provider response. The audit half wraps the user-facing text in an
//! `<archestra-refusal>` envelope so persisted records carry the policy
//! metadata.

use serde::{Deserialize, Serialize};

/// Why a refusal was issued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    ToolInvocation,
    TokenCost,
}

impl RefusalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalKind::ToolInvocation => "tool_invocation",
            RefusalKind::TokenCost => "token_cost",
        }
    }
}

/// The pair returned by policy evaluation: a structured audit payload and a
/// plain-text message suitable to stream to the end user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Refusal {
    pub audit: String,
    pub user: String,
}

impl Refusal {
    pub fn new(
        kind: RefusalKind,
        tool: Option<&str>,
        reason: &str,
        user: impl Into<String>,
    ) -> Self {
        let user = user.into();
        let tool_attr = tool
            .map(|name| format!(" tool=\"{}\"", escape_attr(name)))
            .unwrap_or_default();
        let audit = format!(
            "<archestra-refusal type=\"{}\"{} reason=\"{}\">{}</archestra-refusal>",
            kind.as_str(),
            tool_attr,
            escape_attr(reason),
            user,
        );
        Self { audit, user }
    }
}

fn escape_attr(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}
