//! Repository traits the policy engines consume.
//!
//! Persistence is an external collaborator: the engines see these narrow,
//! synchronous interfaces and nothing else. The daemon supplies a
//! SQLite-backed implementation; tests supply in-memory stubs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Agent, AgentPrompt, Interaction, Limit, LimitEntity, NewInteraction, NewTool, Organization,
    Prompt, PromptType, TokenPrice, Tool, ToolInvocationPolicy, TrustedDataPolicy,
};

/// Error type for repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait AgentStore: Send + Sync {
    fn find_agent(&self, id: &str) -> StoreResult<Option<Agent>>;
    /// Resolve an agent by name, creating it when absent. Used to derive a
    /// default agent from the user-agent header.
    fn get_or_create_agent(&self, name: &str) -> StoreResult<Agent>;
    fn find_organization(&self, id: &str) -> StoreResult<Option<Organization>>;
    fn organization_of_team(&self, team_id: &str) -> StoreResult<Option<Organization>>;
    /// Fallback scope for agents without teams.
    fn first_organization_with_limit(&self) -> StoreResult<Option<Organization>>;
}

pub trait ToolStore: Send + Sync {
    fn tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<Tool>>;
    fn find_tool(&self, agent_id: &str, name: &str) -> StoreResult<Option<Tool>>;
    /// Upsert by `(agent_id, name)`; re-declaration never changes trust
    /// defaults.
    fn upsert_tool(&self, tool: NewTool) -> StoreResult<Tool>;
}

pub trait TrustPolicyStore: Send + Sync {
    /// Policies bound to the agent (via opt-in) and to this tool.
    fn trust_policies(&self, agent_id: &str, tool_id: &str)
        -> StoreResult<Vec<TrustedDataPolicy>>;
}

pub trait InvocationPolicyStore: Send + Sync {
    fn invocation_policies(
        &self,
        agent_id: &str,
        tool_name: &str,
    ) -> StoreResult<Vec<ToolInvocationPolicy>>;
}

/// Filter for querying the interaction audit trail.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InteractionFilter {
    pub agent_id: Option<String>,
    pub chat_id: Option<String>,
    pub interaction_type: Option<String>,
    pub blocked: Option<bool>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub trait InteractionStore: Send + Sync {
    fn insert_interaction(&self, interaction: NewInteraction) -> StoreResult<Interaction>;
    /// All interactions of a chat, oldest first.
    fn interactions_for_chat(&self, chat_id: &str) -> StoreResult<Vec<Interaction>>;
    fn query_interactions(&self, filter: &InteractionFilter) -> StoreResult<Vec<Interaction>>;
    fn count_interactions(&self) -> StoreResult<u64>;
}

pub trait LimitStore: Send + Sync {
    fn limits_for_entity(&self, entity: LimitEntity, entity_id: &str) -> StoreResult<Vec<Limit>>;
    fn insert_limit(&self, limit: Limit) -> StoreResult<Limit>;
    fn list_limits(&self) -> StoreResult<Vec<Limit>>;
    fn delete_limit(&self, id: &str) -> StoreResult<bool>;
    /// Single atomic `x = x + delta` increment of the usage counters on every
    /// limit matching the entity.
    fn add_usage(
        &self,
        entity: LimitEntity,
        entity_id: &str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> StoreResult<()>;
    /// Zero the usage counters and advance `last_cleanup`.
    fn reset_usage(&self, limit_id: &str, now: DateTime<Utc>) -> StoreResult<()>;
}

pub trait TokenPriceStore: Send + Sync {
    fn price_for_model(&self, model: &str) -> StoreResult<Option<TokenPrice>>;
}

/// Input for creating the first version of a prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewPrompt {
    pub org_id: String,
    pub name: String,
    pub prompt_type: PromptType,
    pub content: String,
    pub created_by: String,
}

pub trait PromptStore: Send + Sync {
    fn create_prompt(&self, prompt: NewPrompt) -> StoreResult<Prompt>;
    /// Versioned update: deactivates the current row and inserts a successor
    /// with `version + 1` and `parent_prompt_id` set.
    fn update_prompt(&self, id: &str, content: &str) -> StoreResult<Prompt>;
    fn find_prompt(&self, id: &str) -> StoreResult<Option<Prompt>>;
    fn list_prompts(&self, org_id: &str) -> StoreResult<Vec<Prompt>>;
    /// Atomic delete-then-insert of an agent's prompt set; the system prompt,
    /// when present, is written at order 0 and regular prompts at `i + 1`.
    fn replace_agent_prompts(
        &self,
        agent_id: &str,
        system_prompt_id: Option<&str>,
        regular_prompt_ids: &[String],
    ) -> StoreResult<Vec<AgentPrompt>>;
    fn agent_prompts(&self, agent_id: &str) -> StoreResult<Vec<AgentPrompt>>;
}

/// Bundle of repository handles threaded through the engines.
#[derive(Clone)]
pub struct Repository {
    pub agents: Arc<dyn AgentStore>,
    pub tools: Arc<dyn ToolStore>,
    pub trust_policies: Arc<dyn TrustPolicyStore>,
    pub invocation_policies: Arc<dyn InvocationPolicyStore>,
    pub interactions: Arc<dyn InteractionStore>,
    pub limits: Arc<dyn LimitStore>,
    pub token_prices: Arc<dyn TokenPriceStore>,
    pub prompts: Arc<dyn PromptStore>,
}
