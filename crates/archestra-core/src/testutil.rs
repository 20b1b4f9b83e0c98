//! In-memory repository stubs for engine unit tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attribute::Operator;
use crate::domain::{
    Agent, AgentPrompt, Interaction, Limit, LimitEntity, NewInteraction, NewTool, Organization,
    Prompt, TokenPrice, Tool, ToolInvocationPolicy, TrustPolicyAction, TrustedDataPolicy,
};
use crate::store::{
    AgentStore, InteractionFilter, InteractionStore, InvocationPolicyStore, LimitStore, NewPrompt,
    PromptStore, Repository, StoreResult, TokenPriceStore, ToolStore, TrustPolicyStore,
};

#[derive(Default)]
pub struct MemoryStore {
    pub agents: Mutex<Vec<Agent>>,
    pub organizations: Mutex<Vec<Organization>>,
    pub team_orgs: Mutex<Vec<(String, String)>>,
    pub tools: Mutex<Vec<Tool>>,
    pub trust_policies: Mutex<Vec<TrustedDataPolicy>>,
    pub invocation_policies: Mutex<Vec<ToolInvocationPolicy>>,
    pub interactions: Mutex<Vec<Interaction>>,
    pub limits: Mutex<Vec<Limit>>,
    pub prices: Mutex<Vec<TokenPrice>>,
    pub prompts: Mutex<Vec<Prompt>>,
    pub agent_prompts: Mutex<Vec<AgentPrompt>>,
}

impl AgentStore for MemoryStore {
    fn find_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    fn get_or_create_agent(&self, name: &str) -> StoreResult<Agent> {
        let mut agents = self.agents.lock().unwrap();
        if let Some(existing) = agents.iter().find(|a| a.name == name) {
            return Ok(existing.clone());
        }
        let agent = Agent {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            labels: Vec::new(),
            team_ids: Vec::new(),
        };
        agents.push(agent.clone());
        Ok(agent)
    }

    fn find_organization(&self, id: &str) -> StoreResult<Option<Organization>> {
        Ok(self
            .organizations
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    fn organization_of_team(&self, team_id: &str) -> StoreResult<Option<Organization>> {
        let team_orgs = self.team_orgs.lock().unwrap();
        let Some((_, org_id)) = team_orgs.iter().find(|(team, _)| team == team_id) else {
            return Ok(None);
        };
        self.find_organization(org_id)
    }

    fn first_organization_with_limit(&self) -> StoreResult<Option<Organization>> {
        let limits = self.limits.lock().unwrap();
        let organizations = self.organizations.lock().unwrap();
        Ok(organizations
            .iter()
            .find(|org| {
                limits.iter().any(|l| {
                    l.entity_type == LimitEntity::Organization && l.entity_id == org.id
                })
            })
            .cloned())
    }
}

impl ToolStore for MemoryStore {
    fn tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<Tool>> {
        Ok(self
            .tools
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect())
    }

    fn find_tool(&self, agent_id: &str, name: &str) -> StoreResult<Option<Tool>> {
        Ok(self
            .tools
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.agent_id == agent_id && t.name == name)
            .cloned())
    }

    fn upsert_tool(&self, new: NewTool) -> StoreResult<Tool> {
        let mut tools = self.tools.lock().unwrap();
        if let Some(existing) = tools
            .iter_mut()
            .find(|t| t.agent_id == new.agent_id && t.name == new.name)
        {
            existing.description = new.description;
            existing.parameters = new.parameters;
            return Ok(existing.clone());
        }
        let tool = Tool {
            id: Uuid::now_v7().to_string(),
            agent_id: new.agent_id,
            name: new.name,
            description: new.description,
            parameters: new.parameters,
            allow_usage_when_untrusted_data_is_present: new
                .allow_usage_when_untrusted_data_is_present,
            data_is_trusted_by_default: new.data_is_trusted_by_default,
        };
        tools.push(tool.clone());
        Ok(tool)
    }
}

impl TrustPolicyStore for MemoryStore {
    fn trust_policies(
        &self,
        _agent_id: &str,
        tool_id: &str,
    ) -> StoreResult<Vec<TrustedDataPolicy>> {
        Ok(self
            .trust_policies
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.tool_id == tool_id)
            .cloned()
            .collect())
    }
}

impl InvocationPolicyStore for MemoryStore {
    fn invocation_policies(
        &self,
        agent_id: &str,
        tool_name: &str,
    ) -> StoreResult<Vec<ToolInvocationPolicy>> {
        Ok(self
            .invocation_policies
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.agent_id == agent_id && p.tool_name == tool_name)
            .cloned()
            .collect())
    }
}

impl InteractionStore for MemoryStore {
    fn insert_interaction(&self, new: NewInteraction) -> StoreResult<Interaction> {
        let interaction = Interaction {
            id: Uuid::now_v7().to_string(),
            agent_id: new.agent_id,
            chat_id: new.chat_id,
            interaction_type: new.interaction_type,
            request: new.request,
            response: new.response,
            input_tokens: new.input_tokens,
            output_tokens: new.output_tokens,
            content: new.content,
            trusted: new.trusted,
            blocked: new.blocked,
            reason: new.reason,
            created_at: Utc::now(),
        };
        self.interactions.lock().unwrap().push(interaction.clone());
        Ok(interaction)
    }

    fn interactions_for_chat(&self, chat_id: &str) -> StoreResult<Vec<Interaction>> {
        Ok(self
            .interactions
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.chat_id.as_deref() == Some(chat_id))
            .cloned()
            .collect())
    }

    fn query_interactions(&self, filter: &InteractionFilter) -> StoreResult<Vec<Interaction>> {
        Ok(self
            .interactions
            .lock()
            .unwrap()
            .iter()
            .filter(|i| {
                filter
                    .agent_id
                    .as_deref()
                    .is_none_or(|agent| i.agent_id == agent)
                    && filter
                        .chat_id
                        .as_deref()
                        .is_none_or(|chat| i.chat_id.as_deref() == Some(chat))
                    && filter.blocked.is_none_or(|blocked| i.blocked == blocked)
            })
            .cloned()
            .collect())
    }

    fn count_interactions(&self) -> StoreResult<u64> {
        Ok(self.interactions.lock().unwrap().len() as u64)
    }
}

impl LimitStore for MemoryStore {
    fn limits_for_entity(&self, entity: LimitEntity, entity_id: &str) -> StoreResult<Vec<Limit>> {
        Ok(self
            .limits
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.entity_type == entity && l.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn insert_limit(&self, limit: Limit) -> StoreResult<Limit> {
        self.limits.lock().unwrap().push(limit.clone());
        Ok(limit)
    }

    fn list_limits(&self) -> StoreResult<Vec<Limit>> {
        Ok(self.limits.lock().unwrap().clone())
    }

    fn delete_limit(&self, id: &str) -> StoreResult<bool> {
        let mut limits = self.limits.lock().unwrap();
        let before = limits.len();
        limits.retain(|l| l.id != id);
        Ok(limits.len() < before)
    }

    fn add_usage(
        &self,
        entity: LimitEntity,
        entity_id: &str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> StoreResult<()> {
        let mut limits = self.limits.lock().unwrap();
        for limit in limits
            .iter_mut()
            .filter(|l| l.entity_type == entity && l.entity_id == entity_id)
        {
            limit.current_usage_tokens_in += tokens_in;
            limit.current_usage_tokens_out += tokens_out;
            limit.updated_at = Utc::now();
        }
        Ok(())
    }

    fn reset_usage(&self, limit_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut limits = self.limits.lock().unwrap();
        if let Some(limit) = limits.iter_mut().find(|l| l.id == limit_id) {
            limit.current_usage_tokens_in = 0;
            limit.current_usage_tokens_out = 0;
            limit.last_cleanup = Some(now);
            limit.updated_at = now;
        }
        Ok(())
    }
}

impl TokenPriceStore for MemoryStore {
    fn price_for_model(&self, model: &str) -> StoreResult<Option<TokenPrice>> {
        Ok(self
            .prices
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.model == model)
            .cloned())
    }
}

impl PromptStore for MemoryStore {
    fn create_prompt(&self, new: NewPrompt) -> StoreResult<Prompt> {
        let now = Utc::now();
        let prompt = Prompt {
            id: Uuid::now_v7().to_string(),
            org_id: new.org_id,
            name: new.name,
            prompt_type: new.prompt_type,
            content: new.content,
            version: 1,
            parent_prompt_id: None,
            is_active: true,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        self.prompts.lock().unwrap().push(prompt.clone());
        Ok(prompt)
    }

    fn update_prompt(&self, id: &str, content: &str) -> StoreResult<Prompt> {
        let mut prompts = self.prompts.lock().unwrap();
        let old = prompts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| crate::store::StoreError::NotFound(id.to_string()))?;
        old.is_active = false;
        let old = old.clone();
        let now = Utc::now();
        let next = Prompt {
            id: Uuid::now_v7().to_string(),
            org_id: old.org_id.clone(),
            name: old.name.clone(),
            prompt_type: old.prompt_type,
            content: content.to_string(),
            version: old.version + 1,
            parent_prompt_id: Some(old.id.clone()),
            is_active: true,
            created_by: old.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        prompts.push(next.clone());
        Ok(next)
    }

    fn find_prompt(&self, id: &str) -> StoreResult<Option<Prompt>> {
        Ok(self
            .prompts
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    fn list_prompts(&self, org_id: &str) -> StoreResult<Vec<Prompt>> {
        Ok(self
            .prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect())
    }

    fn replace_agent_prompts(
        &self,
        agent_id: &str,
        system_prompt_id: Option<&str>,
        regular_prompt_ids: &[String],
    ) -> StoreResult<Vec<AgentPrompt>> {
        let mut agent_prompts = self.agent_prompts.lock().unwrap();
        agent_prompts.retain(|ap| ap.agent_id != agent_id);

        let mut rows = Vec::new();
        if let Some(system) = system_prompt_id {
            rows.push(AgentPrompt {
                id: Uuid::now_v7().to_string(),
                agent_id: agent_id.to_string(),
                prompt_id: system.to_string(),
                order: 0,
            });
        }
        for (index, prompt_id) in regular_prompt_ids.iter().enumerate() {
            rows.push(AgentPrompt {
                id: Uuid::now_v7().to_string(),
                agent_id: agent_id.to_string(),
                prompt_id: prompt_id.clone(),
                order: index as i64 + 1,
            });
        }
        agent_prompts.extend(rows.clone());
        Ok(rows)
    }

    fn agent_prompts(&self, agent_id: &str) -> StoreResult<Vec<AgentPrompt>> {
        let mut rows: Vec<AgentPrompt> = self
            .agent_prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|ap| ap.agent_id == agent_id)
            .cloned()
            .collect();
        rows.sort_by_key(|ap| ap.order);
        Ok(rows)
    }
}

/// Build a repository plus a handle to the backing store, so tests can seed
/// rows the traits have no write path for (policies, prices, organizations).
pub fn memory_repository() -> (Repository, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let repo = Repository {
        agents: store.clone(),
        tools: store.clone(),
        trust_policies: store.clone(),
        invocation_policies: store.clone(),
        interactions: store.clone(),
        limits: store.clone(),
        token_prices: store.clone(),
        prompts: store.clone(),
    };
    (repo, store)
}

pub fn agent(store: &MemoryStore, name: &str) -> Agent {
    store.get_or_create_agent(name).unwrap()
}

pub fn tool(
    store: &MemoryStore,
    agent_id: &str,
    name: &str,
    allow_when_untrusted: bool,
    trusted_by_default: bool,
) -> Tool {
    store
        .upsert_tool(NewTool {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: serde_json::json!({"type": "object"}),
            allow_usage_when_untrusted_data_is_present: allow_when_untrusted,
            data_is_trusted_by_default: trusted_by_default,
        })
        .unwrap()
}

#[allow(clippy::too_many_arguments)]
pub fn trust_policy(
    store: &MemoryStore,
    tool_id: &str,
    path: &str,
    operator: Operator,
    value: &str,
    action: TrustPolicyAction,
    description: &str,
) -> TrustedDataPolicy {
    let policy = TrustedDataPolicy {
        id: Uuid::now_v7().to_string(),
        tool_id: tool_id.to_string(),
        attribute_path: path.to_string(),
        operator,
        value: value.to_string(),
        action,
        description: description.to_string(),
    };
    store.trust_policies.lock().unwrap().push(policy.clone());
    policy
}

pub fn invocation_policy(
    store: &MemoryStore,
    agent_id: &str,
    tool_name: &str,
    action: crate::domain::InvocationPolicyAction,
    description: &str,
) -> ToolInvocationPolicy {
    let policy = ToolInvocationPolicy {
        id: Uuid::now_v7().to_string(),
        agent_id: agent_id.to_string(),
        tool_name: tool_name.to_string(),
        condition: None,
        action,
        description: description.to_string(),
    };
    store
        .invocation_policies
        .lock()
        .unwrap()
        .push(policy.clone());
    policy
}

pub fn organization(store: &MemoryStore, interval: crate::domain::CleanupInterval) -> Organization {
    let org = Organization {
        id: Uuid::now_v7().to_string(),
        name: "default".to_string(),
        limit_cleanup_interval: interval,
    };
    store.organizations.lock().unwrap().push(org.clone());
    org
}

pub fn limit(
    store: &MemoryStore,
    entity: LimitEntity,
    entity_id: &str,
    model: Option<&str>,
    limit_value: f64,
    usage: (i64, i64),
) -> Limit {
    let limit = Limit {
        id: Uuid::now_v7().to_string(),
        entity_type: entity,
        entity_id: entity_id.to_string(),
        limit_type: crate::domain::LIMIT_TYPE_TOKEN_COST.to_string(),
        model: model.map(String::from),
        limit_value,
        current_usage_tokens_in: usage.0,
        current_usage_tokens_out: usage.1,
        last_cleanup: Some(Utc::now()),
        updated_at: Utc::now(),
    };
    store.limits.lock().unwrap().push(limit.clone());
    limit
}

pub fn token_price(store: &MemoryStore, model: &str, input: f64, output: f64) -> TokenPrice {
    let price = TokenPrice {
        model: model.to_string(),
        price_per_million_input: input,
        price_per_million_output: output,
    };
    store.prices.lock().unwrap().push(price.clone());
    price
}
