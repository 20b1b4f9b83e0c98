//! Trusted-data policy engine.
//!
//! Classifies every tool-result message flowing back into the conversation
//! as trusted, untrusted, or blocked, persists one interaction per
//! classification, and filters blocked messages out of anything forwarded
//! upstream. Block policies are evaluated before trust policies: a single
//! `block_always` match ends classification for that message.

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Agent, NewInteraction, Tool, TrustPolicyAction, TrustedDataPolicy};
use crate::error::Result;
use crate::message::{tool_name_for_call, ChatMessage};
use crate::store::Repository;
use crate::{attribute, Interaction};

/// Reason recorded when no policy matched.
pub const NO_MATCH_REASON: &str = "content does not match any trust policies";

/// Interaction type recorded for classified tool results.
pub const TOOL_RESULT_TYPE: &str = "tool_result";

/// What a classification means to downstream consumers once the tool's trust
/// default is taken into account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectiveTrust {
    Trusted,
    Untrusted,
    Blocked,
}

/// The persisted classification of one tool-result message.
///
/// The stored `(trusted, blocked)` pair reflects policy matching only;
/// `(false, false)` means "consult the tool default", which
/// [`TrustClassification::effective_trust`] does.
#[derive(Clone, Debug)]
pub struct TrustClassification {
    pub tool_call_id: String,
    pub tool: Tool,
    pub trusted: bool,
    pub blocked: bool,
    pub reason: String,
    /// Whether any policy was attached to this agent/tool pair.
    pub had_policies: bool,
}

impl TrustClassification {
    pub fn effective_trust(&self) -> EffectiveTrust {
        if self.blocked {
            EffectiveTrust::Blocked
        } else if self.trusted {
            EffectiveTrust::Trusted
        } else if self.tool.data_is_trusted_by_default && !self.had_policies {
            // No policy spoke for or against the content; the tool vouches
            // for it.
            EffectiveTrust::Trusted
        } else {
            EffectiveTrust::Untrusted
        }
    }
}

/// The trusted-data policy engine.
pub struct TrustEngine {
    repo: Repository,
}

impl TrustEngine {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Classify every tool message in `messages` and persist one interaction
    /// per classification. Non-tool messages are ignored; tool messages with
    /// no resolvable originating call are skipped with a warning.
    pub fn evaluate_policies(
        &self,
        agent: &Agent,
        chat_id: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<TrustClassification>> {
        let mut classifications = Vec::new();

        for message in messages {
            let ChatMessage::Tool {
                tool_call_id,
                content,
            } = message
            else {
                continue;
            };

            let Some(tool_name) = self.resolve_tool_name(chat_id, messages, tool_call_id)? else {
                warn!(
                    chat_id,
                    tool_call_id,
                    "tool result without a matching assistant tool call; skipping"
                );
                continue;
            };

            let Some(tool) = self.repo.tools.find_tool(&agent.id, &tool_name)? else {
                warn!(
                    agent_id = %agent.id,
                    tool = %tool_name,
                    "tool result for a tool the agent does not own; skipping"
                );
                continue;
            };

            let document = parse_tool_content(content);
            let policies = self.repo.trust_policies.trust_policies(&agent.id, &tool.id)?;
            let classification =
                classify(tool_call_id.clone(), tool, &document, &policies);

            debug!(
                chat_id,
                tool_call_id,
                trusted = classification.trusted,
                blocked = classification.blocked,
                reason = %classification.reason,
                "classified tool result"
            );

            self.persist(agent, chat_id, message, &classification)?;
            classifications.push(classification);
        }

        Ok(classifications)
    }

    /// Return `messages` minus every tool message whose persisted
    /// classification for this chat is blocked. Non-tool messages pass
    /// through unchanged, in order.
    pub fn filter_out_blocked_data(
        &self,
        chat_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<Vec<ChatMessage>> {
        let interactions = self.repo.interactions.interactions_for_chat(chat_id)?;
        let blocked_ids: Vec<String> = interactions
            .iter()
            .filter(|interaction| interaction.blocked)
            .filter_map(|interaction| tool_call_id_of(interaction))
            .collect();

        Ok(messages
            .into_iter()
            .filter(|message| match message.tool_call_id() {
                Some(id) => !blocked_ids.iter().any(|blocked| blocked == id),
                None => true,
            })
            .collect())
    }

    /// Find the tool name behind a tool_call_id: the current batch first,
    /// then assistant turns persisted earlier in the chat.
    fn resolve_tool_name(
        &self,
        chat_id: &str,
        messages: &[ChatMessage],
        tool_call_id: &str,
    ) -> Result<Option<String>> {
        if let Some(name) = tool_name_for_call(messages, tool_call_id) {
            return Ok(Some(name.to_string()));
        }

        let interactions = self.repo.interactions.interactions_for_chat(chat_id)?;
        for interaction in &interactions {
            let Some(message) = interaction_message(interaction) else {
                continue;
            };
            if let Some(name) = tool_name_for_call(std::slice::from_ref(&message), tool_call_id) {
                return Ok(Some(name.to_string()));
            }
        }

        Ok(None)
    }

    fn persist(
        &self,
        agent: &Agent,
        chat_id: &str,
        message: &ChatMessage,
        classification: &TrustClassification,
    ) -> Result<()> {
        self.repo.interactions.insert_interaction(NewInteraction {
            agent_id: agent.id.clone(),
            chat_id: Some(chat_id.to_string()),
            interaction_type: TOOL_RESULT_TYPE.to_string(),
            request: None,
            response: None,
            input_tokens: 0,
            output_tokens: 0,
            content: Some(serde_json::to_value(message)?),
            trusted: classification.trusted,
            blocked: classification.blocked,
            reason: Some(classification.reason.clone()),
        })?;
        Ok(())
    }
}

fn classify(
    tool_call_id: String,
    tool: Tool,
    document: &Value,
    policies: &[TrustedDataPolicy],
) -> TrustClassification {
    let had_policies = !policies.is_empty();

    // Fail closed: block policies first.
    for policy in policies
        .iter()
        .filter(|p| p.action == TrustPolicyAction::BlockAlways)
    {
        if attribute::evaluate_attribute(document, &policy.attribute_path, policy.operator, &policy.value)
            .matched
        {
            return TrustClassification {
                tool_call_id,
                tool,
                trusted: false,
                blocked: true,
                reason: policy.description.clone(),
                had_policies,
            };
        }
    }

    for policy in policies
        .iter()
        .filter(|p| p.action == TrustPolicyAction::MarkAsTrusted)
    {
        if attribute::evaluate_attribute(document, &policy.attribute_path, policy.operator, &policy.value)
            .matched
        {
            return TrustClassification {
                tool_call_id,
                tool,
                trusted: true,
                blocked: false,
                reason: policy.description.clone(),
                had_policies,
            };
        }
    }

    TrustClassification {
        tool_call_id,
        tool,
        trusted: false,
        blocked: false,
        reason: NO_MATCH_REASON.to_string(),
        had_policies,
    }
}

/// Tool results are JSON when possible; anything else becomes a single
/// scalar keyed at the root, reachable via the `content` path.
fn parse_tool_content(content: &str) -> Value {
    serde_json::from_str(content)
        .unwrap_or_else(|_| serde_json::json!({ "content": content }))
}

fn interaction_message(interaction: &Interaction) -> Option<ChatMessage> {
    let content = interaction.content.clone()?;
    serde_json::from_value(content).ok()
}

fn tool_call_id_of(interaction: &Interaction) -> Option<String> {
    match interaction_message(interaction)? {
        ChatMessage::Tool { tool_call_id, .. } => Some(tool_call_id),
        _ => None,
    }
}
