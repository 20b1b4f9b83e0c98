//! Tool-invocation policy evaluator.
//!
//! Runs after the primary model has proposed tool calls and before anything
//! executes. The first refusal wins; the orchestrator rewrites the model's
//! response around it.

use serde_json::Value;
use tracing::debug;

use crate::attribute;
use crate::domain::{Agent, InvocationPolicyAction, ToolInvocationPolicy};
use crate::error::Result;
use crate::refusal::{Refusal, RefusalKind};
use crate::store::Repository;

/// A tool call proposed by the primary model, with parsed arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedToolCall {
    pub name: String,
    pub arguments: Value,
}

pub struct InvocationEvaluator {
    repo: Repository,
}

impl InvocationEvaluator {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Decide whether the proposed calls may run given the current context
    /// trust. Returns the first refusal, or `None` when every call is
    /// permitted.
    pub fn evaluate(
        &self,
        agent: &Agent,
        calls: &[ProposedToolCall],
        context_is_trusted: bool,
    ) -> Result<Option<Refusal>> {
        for call in calls {
            let policies = self
                .repo
                .invocation_policies
                .invocation_policies(&agent.id, &call.name)?;

            for policy in &policies {
                if !policy_applies(policy, call) {
                    continue;
                }

                match policy.action {
                    InvocationPolicyAction::BlockAlways => {
                        debug!(tool = %call.name, policy = %policy.id, "tool call blocked by policy");
                        return Ok(Some(refuse_by_policy(call, policy)));
                    }
                    InvocationPolicyAction::RequireTrustedContext if !context_is_trusted => {
                        debug!(
                            tool = %call.name,
                            policy = %policy.id,
                            "tool call requires trusted context"
                        );
                        return Ok(Some(refuse_by_policy(call, policy)));
                    }
                    InvocationPolicyAction::RequireTrustedContext => {}
                }
            }

            if !context_is_trusted {
                if let Some(tool) = self.repo.tools.find_tool(&agent.id, &call.name)? {
                    if !tool.allow_usage_when_untrusted_data_is_present {
                        debug!(
                            tool = %call.name,
                            "tool call refused: untrusted data present"
                        );
                        return Ok(Some(Refusal::new(
                            RefusalKind::ToolInvocation,
                            Some(&call.name),
                            &tool.id,
                            format!(
                                "I can't use the {} tool while untrusted data is present in this \
                                 conversation.",
                                call.name
                            ),
                        )));
                    }
                }
            }
        }

        Ok(None)
    }
}

fn policy_applies(policy: &ToolInvocationPolicy, call: &ProposedToolCall) -> bool {
    match &policy.condition {
        None => true,
        Some(condition) => {
            attribute::evaluate_attribute(
                &call.arguments,
                &condition.attribute_path,
                condition.operator,
                &condition.value,
            )
            .matched
        }
    }
}

fn refuse_by_policy(call: &ProposedToolCall, policy: &ToolInvocationPolicy) -> Refusal {
    let user = if policy.description.is_empty() {
        format!("I can't use the {} tool for this request.", call.name)
    } else {
        format!(
            "I can't use the {} tool for this request: {}",
            call.name, policy.description
        )
    };
    Refusal::new(RefusalKind::ToolInvocation, Some(&call.name), &policy.id, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Operator;
    use crate::domain::{InvocationCondition, InvocationPolicyAction};
    use crate::testutil::{agent, invocation_policy, memory_repository, tool};
    use serde_json::json;

    #[test]
    fn block_always_refuses_regardless_of_trust() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        tool(&store, &agent.id, "send_email", true, false);
        let policy = invocation_policy(
            &store,
            &agent.id,
            "send_email",
            InvocationPolicyAction::BlockAlways,
            "outbound email is disabled",
        );

        let evaluator = InvocationEvaluator::new(repo);
        let calls = vec![ProposedToolCall {
            name: "send_email".to_string(),
            arguments: json!({"to": "x@example.com"}),
        }];

        let refusal = evaluator
            .evaluate(&agent, &calls, true)
            .expect("evaluate")
            .expect("refusal");
        assert!(refusal.audit.contains("type=\"tool_invocation\""));
        assert!(refusal.audit.contains("tool=\"send_email\""));
        assert!(refusal.audit.contains(&format!("reason=\"{}\"", policy.id)));
        assert!(refusal.user.contains("outbound email is disabled"));
    }

    #[test]
    fn require_trusted_context_passes_when_trusted() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        tool(&store, &agent.id, "send_email", true, false);
        invocation_policy(
            &store,
            &agent.id,
            "send_email",
            InvocationPolicyAction::RequireTrustedContext,
            "needs trusted context",
        );

        let evaluator = InvocationEvaluator::new(repo);
        let calls = vec![ProposedToolCall {
            name: "send_email".to_string(),
            arguments: json!({}),
        }];

        assert!(evaluator
            .evaluate(&agent, &calls, true)
            .expect("evaluate")
            .is_none());
        assert!(evaluator
            .evaluate(&agent, &calls, false)
            .expect("evaluate")
            .is_some());
    }

    #[test]
    fn untrusted_context_refuses_tools_that_disallow_it() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        let tool = tool(&store, &agent.id, "send_email", false, false);

        let evaluator = InvocationEvaluator::new(repo);
        let calls = vec![ProposedToolCall {
            name: "send_email".to_string(),
            arguments: json!({}),
        }];

        let refusal = evaluator
            .evaluate(&agent, &calls, false)
            .expect("evaluate")
            .expect("refusal");
        assert!(refusal.audit.contains(&format!("reason=\"{}\"", tool.id)));
        assert!(refusal.user.contains("untrusted data"));

        // The same tool runs fine in a trusted context.
        assert!(evaluator
            .evaluate(&agent, &calls, true)
            .expect("evaluate")
            .is_none());
    }

    #[test]
    fn tool_allowing_untrusted_usage_passes_without_policies() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        tool(&store, &agent.id, "read_notes", true, false);

        let evaluator = InvocationEvaluator::new(repo);
        let calls = vec![ProposedToolCall {
            name: "read_notes".to_string(),
            arguments: json!({}),
        }];

        assert!(evaluator
            .evaluate(&agent, &calls, false)
            .expect("evaluate")
            .is_none());
    }

    #[test]
    fn conditional_policy_only_applies_to_matching_arguments() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        tool(&store, &agent.id, "send_email", true, false);
        {
            let mut policies = store.invocation_policies.lock().unwrap();
            policies.push(ToolInvocationPolicy {
                id: "pol-external".to_string(),
                agent_id: agent.id.clone(),
                tool_name: "send_email".to_string(),
                condition: Some(InvocationCondition {
                    attribute_path: "to".to_string(),
                    operator: Operator::NotContains,
                    value: "@corp.example".to_string(),
                }),
                action: InvocationPolicyAction::BlockAlways,
                description: "external recipients are blocked".to_string(),
            });
        }

        let evaluator = InvocationEvaluator::new(repo);

        let internal = vec![ProposedToolCall {
            name: "send_email".to_string(),
            arguments: json!({"to": "it@corp.example"}),
        }];
        assert!(evaluator
            .evaluate(&agent, &internal, true)
            .expect("evaluate")
            .is_none());

        let external = vec![ProposedToolCall {
            name: "send_email".to_string(),
            arguments: json!({"to": "crook@elsewhere.example"}),
        }];
        assert!(evaluator
            .evaluate(&agent, &external, true)
            .expect("evaluate")
            .is_some());
    }

    #[test]
    fn first_refusal_wins_across_calls() {
        let (repo, store) = memory_repository();
        let agent = agent(&store, "agent-a");
        tool(&store, &agent.id, "read_notes", true, false);
        tool(&store, &agent.id, "send_email", false, false);

        let evaluator = InvocationEvaluator::new(repo);
        let calls = vec![
            ProposedToolCall {
                name: "read_notes".to_string(),
                arguments: json!({}),
            },
            ProposedToolCall {
                name: "send_email".to_string(),
                arguments: json!({}),
            },
        ];

        let refusal = evaluator
            .evaluate(&agent, &calls, false)
            .expect("evaluate")
            .expect("refusal");
        assert!(refusal.audit.contains("tool=\"send_email\""));
    }
}
