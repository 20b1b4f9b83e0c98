#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! # Archestra Core - Gateway Policy Engine
//!
//! This crate provides the policy engine guarding the Archestra LLM proxy:
//! - `TrustEngine`: classifies tool results as trusted / untrusted / blocked
//! - `DualLlmEvaluator`: isolates untrusted content in a sandboxed secondary model
//! - `InvocationEvaluator`: allows or refuses proposed tool calls
//! - `QuotaEnforcer`: token-cost limits per agent, team, and organization
//! - `attribute`: the path-expression matcher both policy engines build on
//!
//! The engines consume persistence through the narrow repository traits in
//! [`store`]; they carry no HTTP or SQL of their own.

pub mod attribute;
pub mod domain;
pub mod dual_llm;
pub mod error;
pub mod invocation;
pub mod message;
pub mod quota;
pub mod refusal;
pub mod store;
#[cfg(test)]
pub(crate) mod testutil;
pub mod trust;

pub use attribute::{evaluate_attribute, AttributeMatch, Operator};
pub use domain::{
    Agent, AgentPrompt, CleanupInterval, Interaction, InvocationCondition, InvocationPolicyAction,
    Limit, LimitEntity, NewInteraction, NewTool, Organization, Prompt, PromptType, Team,
    TokenPrice, Tool, ToolInvocationPolicy, TrustPolicyAction, TrustedDataPolicy,
    LIMIT_TYPE_TOKEN_COST,
};
pub use dual_llm::{
    apply_tool_result_updates, candidates_for, DualLlmEvaluator, DualLlmOutcome, DualLlmProgress,
    SecondaryModel, NO_RELEVANT_CONTENT,
};
pub use error::{Error, Result};
pub use invocation::{InvocationEvaluator, ProposedToolCall};
pub use message::{tool_name_for_call, ChatMessage, FunctionCall, ToolCall};
pub use quota::{QuotaEnforcer, UsageDelta};
pub use refusal::{Refusal, RefusalKind};
pub use store::{
    InteractionFilter, NewPrompt, Repository, StoreError, StoreResult,
};
pub use trust::{EffectiveTrust, TrustClassification, TrustEngine, NO_MATCH_REASON, TOOL_RESULT_TYPE};
