//! Domain records persisted behind the repository traits.
//!
//! Identifiers are opaque UUID strings; timestamps are UTC instants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named configuration bundle that owns tools, prompts, and policies; the
/// unit of policy scoping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Key/value labels, always sorted by key.
    pub labels: Vec<(String, String)>,
    pub team_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    System,
    Regular,
}

impl PromptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptType::System => "system",
            PromptType::Regular => "regular",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(PromptType::System),
            "regular" => Some(PromptType::Regular),
            _ => None,
        }
    }
}

/// A versioned prompt row. Updating a prompt deactivates the current row and
/// inserts a successor with `version + 1` and `parent_prompt_id` pointing at
/// the superseded row; exactly one row per `(org_id, name, prompt_type)` is
/// active at any time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub prompt_type: PromptType,
    pub content: String,
    pub version: i64,
    pub parent_prompt_id: Option<String>,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Assignment of a prompt to an agent; unique on `(agent_id, prompt_id)`.
/// The system prompt, when present, sits at order 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    pub id: String,
    pub agent_id: String,
    pub prompt_id: String,
    pub order: i64,
}

/// A capability the model may invoke, backed by an MCP endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub agent_id: String,
    pub name: String,
    pub description: String,
    /// JSON schema of the tool parameters.
    pub parameters: serde_json::Value,
    pub allow_usage_when_untrusted_data_is_present: bool,
    pub data_is_trusted_by_default: bool,
}

/// Input for a tool upsert. Re-declaring an existing `(agent_id, name)` pair
/// updates description and parameters but never the trust defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTool {
    pub agent_id: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub allow_usage_when_untrusted_data_is_present: bool,
    pub data_is_trusted_by_default: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicyAction {
    MarkAsTrusted,
    BlockAlways,
}

impl TrustPolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustPolicyAction::MarkAsTrusted => "mark_as_trusted",
            TrustPolicyAction::BlockAlways => "block_always",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mark_as_trusted" => Some(TrustPolicyAction::MarkAsTrusted),
            "block_always" => Some(TrustPolicyAction::BlockAlways),
            _ => None,
        }
    }
}

/// An attribute-path rule classifying tool-result content. Agents opt in to
/// policies through `agent_trusted_data_policies` join rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustedDataPolicy {
    pub id: String,
    pub tool_id: String,
    pub attribute_path: String,
    pub operator: crate::attribute::Operator,
    pub value: String,
    pub action: TrustPolicyAction,
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPolicyAction {
    RequireTrustedContext,
    BlockAlways,
}

impl InvocationPolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationPolicyAction::RequireTrustedContext => "require_trusted_context",
            InvocationPolicyAction::BlockAlways => "block_always",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "require_trusted_context" => Some(InvocationPolicyAction::RequireTrustedContext),
            "block_always" => Some(InvocationPolicyAction::BlockAlways),
            _ => None,
        }
    }
}

/// An optional attribute condition scoping an invocation policy to matching
/// call arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationCondition {
    pub attribute_path: String,
    pub operator: crate::attribute::Operator,
    pub value: String,
}

/// A per-agent rule deciding whether a proposed tool call may run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationPolicy {
    pub id: String,
    pub agent_id: String,
    pub tool_name: String,
    /// When set, the policy only applies to calls whose arguments match.
    pub condition: Option<InvocationCondition>,
    pub action: InvocationPolicyAction,
    pub description: String,
}

/// One persisted audit record: a classified tool message or a completed
/// request/response pair. Never mutated after insert.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub agent_id: String,
    pub chat_id: Option<String>,
    pub interaction_type: String,
    pub request: Option<serde_json::Value>,
    pub response: Option<serde_json::Value>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Role-tagged message envelope in the OpenAI shape.
    pub content: Option<serde_json::Value>,
    pub trusted: bool,
    pub blocked: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an interaction; the store assigns id and timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewInteraction {
    pub agent_id: String,
    pub chat_id: Option<String>,
    pub interaction_type: String,
    pub request: Option<serde_json::Value>,
    pub response: Option<serde_json::Value>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub content: Option<serde_json::Value>,
    pub trusted: bool,
    pub blocked: bool,
    pub reason: Option<String>,
}

/// Scope of a token-cost limit, in priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitEntity {
    Organization,
    Team,
    Agent,
}

impl LimitEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitEntity::Organization => "organization",
            LimitEntity::Team => "team",
            LimitEntity::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "organization" => Some(LimitEntity::Organization),
            "team" => Some(LimitEntity::Team),
            "agent" => Some(LimitEntity::Agent),
            _ => None,
        }
    }
}

/// A token-cost limit. When `model` is set the limit value is dollars and
/// usage is priced through [`TokenPrice`]; otherwise the value is raw tokens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub id: String,
    pub entity_type: LimitEntity,
    pub entity_id: String,
    pub limit_type: String,
    pub model: Option<String>,
    pub limit_value: f64,
    pub current_usage_tokens_in: i64,
    pub current_usage_tokens_out: i64,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub const LIMIT_TYPE_TOKEN_COST: &str = "token_cost";

/// Per-model pricing used to translate tokens into dollars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub model: String,
    pub price_per_million_input: f64,
    pub price_per_million_output: f64,
}

/// How often an organization's limit counters are reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupInterval {
    #[default]
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "12h")]
    HalfDaily,
    #[serde(rename = "24h")]
    Daily,
    #[serde(rename = "1w")]
    Weekly,
    #[serde(rename = "1m")]
    Monthly,
}

impl CleanupInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupInterval::Hourly => "1h",
            CleanupInterval::HalfDaily => "12h",
            CleanupInterval::Daily => "24h",
            CleanupInterval::Weekly => "1w",
            CleanupInterval::Monthly => "1m",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1h" => Some(CleanupInterval::Hourly),
            "12h" => Some(CleanupInterval::HalfDaily),
            "24h" => Some(CleanupInterval::Daily),
            "1w" => Some(CleanupInterval::Weekly),
            "1m" => Some(CleanupInterval::Monthly),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> chrono::Duration {
        match self {
            CleanupInterval::Hourly => chrono::Duration::hours(1),
            CleanupInterval::HalfDaily => chrono::Duration::hours(12),
            CleanupInterval::Daily => chrono::Duration::hours(24),
            CleanupInterval::Weekly => chrono::Duration::weeks(1),
            CleanupInterval::Monthly => chrono::Duration::days(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub limit_cleanup_interval: CleanupInterval,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub org_id: String,
    pub name: String,
}
