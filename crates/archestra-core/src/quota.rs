//! Token-cost quota enforcement.
//!
//! Limits resolve in priority order agent → teams → organization; an agent
//! with no teams falls back to the first organization carrying a limit. The
//! pre-check runs the reset sweep first, then refuses on the first exceeded
//! limit. Usage recording happens after the response and must never fail a
//! completed interaction: errors are logged and swallowed.

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::{Agent, Limit, LimitEntity, Organization, LIMIT_TYPE_TOKEN_COST};
use crate::error::Result;
use crate::refusal::{Refusal, RefusalKind};
use crate::store::Repository;

/// Usage attribution for one completed interaction.
#[derive(Clone, Debug, PartialEq)]
pub struct UsageDelta {
    pub agent_id: String,
    pub team_ids: Vec<String>,
    pub org_id: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

pub struct QuotaEnforcer {
    repo: Repository,
}

impl QuotaEnforcer {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Resolve the governing organization and the limit scopes for an agent,
    /// in priority order.
    pub fn governing_scopes(
        &self,
        agent: &Agent,
    ) -> Result<(Vec<(LimitEntity, String)>, Option<Organization>)> {
        let mut org = None;
        for team_id in &agent.team_ids {
            if let Some(found) = self.repo.agents.organization_of_team(team_id)? {
                org = Some(found);
                break;
            }
        }
        if org.is_none() {
            org = self.repo.agents.first_organization_with_limit()?;
        }

        let mut scopes = vec![(LimitEntity::Agent, agent.id.clone())];
        for team_id in &agent.team_ids {
            scopes.push((LimitEntity::Team, team_id.clone()));
        }
        if let Some(ref org) = org {
            scopes.push((LimitEntity::Organization, org.id.clone()));
        }

        Ok((scopes, org))
    }

    /// Pre-flight check. Returns a `token_cost` refusal when any governing
    /// limit is already exhausted; ties across scopes go to the
    /// highest-priority (agent-most) limit.
    pub fn pre_check(&self, agent: &Agent) -> Result<Option<Refusal>> {
        let (scopes, org) = self.governing_scopes(agent)?;

        for (entity, entity_id) in scopes {
            let limits = self.repo.limits.limits_for_entity(entity, &entity_id)?;
            for limit in limits
                .iter()
                .filter(|l| l.limit_type == LIMIT_TYPE_TOKEN_COST)
            {
                let limit = self.sweep_if_due(limit, org.as_ref())?;
                if self.exceeded(&limit)? {
                    debug!(
                        limit_id = %limit.id,
                        entity = entity.as_str(),
                        entity_id = %entity_id,
                        "token cost limit exhausted"
                    );
                    return Ok(Some(token_cost_refusal(&limit)));
                }
            }
        }

        Ok(None)
    }

    /// Reset the limit's counters when the governing organization's cleanup
    /// interval has elapsed. Idempotent relative to `last_cleanup`: a
    /// concurrent sweep of the same limit only moves the timestamp forward.
    fn sweep_if_due(&self, limit: &Limit, org: Option<&Organization>) -> Result<Limit> {
        let Some(org) = org else {
            return Ok(limit.clone());
        };

        let now = Utc::now();
        let due = match limit.last_cleanup {
            None => true,
            Some(last) => now - last >= org.limit_cleanup_interval.as_duration(),
        };
        if !due {
            return Ok(limit.clone());
        }

        self.repo.limits.reset_usage(&limit.id, now)?;
        debug!(limit_id = %limit.id, "reset limit usage counters");

        let mut reset = limit.clone();
        reset.current_usage_tokens_in = 0;
        reset.current_usage_tokens_out = 0;
        reset.last_cleanup = Some(now);
        Ok(reset)
    }

    fn exceeded(&self, limit: &Limit) -> Result<bool> {
        let tokens_in = limit.current_usage_tokens_in;
        let tokens_out = limit.current_usage_tokens_out;

        match &limit.model {
            None => Ok((tokens_in + tokens_out) as f64 >= limit.limit_value),
            Some(model) => {
                let Some(price) = self.repo.token_prices.price_for_model(model)? else {
                    warn!(
                        limit_id = %limit.id,
                        model = %model,
                        "no token price for limit model; skipping limit"
                    );
                    return Ok(false);
                };
                let cost = tokens_in as f64 * price.price_per_million_input / 1_000_000.0
                    + tokens_out as f64 * price.price_per_million_output / 1_000_000.0;
                Ok(cost >= limit.limit_value)
            }
        }
    }

    /// Post-flight usage recording. One atomic increment per matching scope;
    /// failures are logged and swallowed so a completed interaction never
    /// fails on accounting.
    pub fn record_usage(&self, delta: &UsageDelta) {
        let mut scopes = vec![(LimitEntity::Agent, delta.agent_id.clone())];
        for team_id in &delta.team_ids {
            scopes.push((LimitEntity::Team, team_id.clone()));
        }
        if let Some(ref org_id) = delta.org_id {
            scopes.push((LimitEntity::Organization, org_id.clone()));
        }

        for (entity, entity_id) in scopes {
            if let Err(err) = self.repo.limits.add_usage(
                entity,
                &entity_id,
                delta.tokens_in,
                delta.tokens_out,
            ) {
                warn!(
                    entity = entity.as_str(),
                    entity_id = %entity_id,
                    error = %err,
                    "quota usage update failed"
                );
            }
        }
    }
}

fn token_cost_refusal(limit: &Limit) -> Refusal {
    let scope = limit.entity_type.as_str();
    Refusal::new(
        RefusalKind::TokenCost,
        None,
        &limit.id,
        format!(
            "This request was refused because the {scope} has reached its configured token cost \
             limit."
        ),
    )
}
