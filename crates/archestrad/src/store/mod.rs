//! SQLite-backed repository for the gateway.
//!
//! One connection behind a mutex, WAL mode, schema created at open. The
//! concrete type implements every repository trait consumed by the policy
//! engines plus the seeding operations the admin surface and bootstrap use.

mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use archestra_core::store::{
    AgentStore, InteractionFilter, InteractionStore, InvocationPolicyStore, LimitStore, NewPrompt,
    PromptStore, Repository, StoreError, StoreResult, TokenPriceStore, ToolStore,
    TrustPolicyStore,
};
use archestra_core::{
    Agent, AgentPrompt, CleanupInterval, Interaction, InvocationCondition, InvocationPolicyAction,
    Limit, LimitEntity, NewInteraction, NewTool, Operator, Organization, Prompt, PromptType, Team,
    TokenPrice, Tool, ToolInvocationPolicy, TrustPolicyAction, TrustedDataPolicy,
};

// rusqlite errors carry no useful structure for callers; flatten to strings.
fn db_err(err: rusqlite::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn decode_err(what: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(what.to_string())
}

fn parse_datetime(field: &str, value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| decode_err(format!("invalid {field}: {value}: {err}")))
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Database(err.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(schema::CREATE_TABLES).map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(schema::CREATE_TABLES).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Bundle this store into the repository handle the engines consume.
    pub fn repository(self: &Arc<Self>) -> Repository {
        Repository {
            agents: self.clone(),
            tools: self.clone(),
            trust_policies: self.clone(),
            invocation_policies: self.clone(),
            interactions: self.clone(),
            limits: self.clone(),
            token_prices: self.clone(),
            prompts: self.clone(),
        }
    }

    /// Ensure a default organization exists; returns it.
    pub fn bootstrap_default_organization(
        &self,
        interval: CleanupInterval,
    ) -> StoreResult<Organization> {
        let conn = self.lock_conn();
        let existing = conn
            .query_row(
                "SELECT id, name, limit_cleanup_interval FROM organizations ORDER BY created_at LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;

        if let Some((id, name, raw_interval)) = existing {
            let limit_cleanup_interval = CleanupInterval::parse(&raw_interval)
                .ok_or_else(|| decode_err(format!("invalid cleanup interval `{raw_interval}`")))?;
            return Ok(Organization {
                id,
                name,
                limit_cleanup_interval,
            });
        }

        let org = Organization {
            id: Uuid::now_v7().to_string(),
            name: "default".to_string(),
            limit_cleanup_interval: interval,
        };
        conn.execute(
            "INSERT INTO organizations (id, name, limit_cleanup_interval) VALUES (?1, ?2, ?3)",
            params![org.id, org.name, org.limit_cleanup_interval.as_str()],
        )
        .map_err(db_err)?;
        Ok(org)
    }

    pub fn insert_team(&self, org_id: &str, name: &str) -> StoreResult<Team> {
        let team = Team {
            id: Uuid::now_v7().to_string(),
            org_id: org_id.to_string(),
            name: name.to_string(),
        };
        self.lock_conn()
            .execute(
                "INSERT INTO teams (id, org_id, name) VALUES (?1, ?2, ?3)",
                params![team.id, team.org_id, team.name],
            )
            .map_err(db_err)?;
        Ok(team)
    }

    pub fn assign_agent_team(&self, agent_id: &str, team_id: &str) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                "INSERT OR IGNORE INTO agent_teams (agent_id, team_id) VALUES (?1, ?2)",
                params![agent_id, team_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_trust_policy(&self, policy: &TrustedDataPolicy) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO trusted_data_policies \
                 (id, tool_id, attribute_path, operator, value, action, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    policy.id,
                    policy.tool_id,
                    policy.attribute_path,
                    policy.operator.as_str(),
                    policy.value,
                    policy.action.as_str(),
                    policy.description,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn opt_in_trust_policy(&self, agent_id: &str, policy_id: &str) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                "INSERT OR IGNORE INTO agent_trusted_data_policies (agent_id, policy_id) \
                 VALUES (?1, ?2)",
                params![agent_id, policy_id],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_invocation_policy(&self, policy: &ToolInvocationPolicy) -> StoreResult<()> {
        let condition = policy
            .condition
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(decode_err)?;
        self.lock_conn()
            .execute(
                "INSERT INTO tool_invocation_policies \
                 (id, agent_id, tool_name, condition, action, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    policy.id,
                    policy.agent_id,
                    policy.tool_name,
                    condition,
                    policy.action.as_str(),
                    policy.description,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_token_price(&self, price: &TokenPrice) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO token_prices (model, price_per_million_input, price_per_million_output) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(model) DO UPDATE SET \
                     price_per_million_input = excluded.price_per_million_input, \
                     price_per_million_output = excluded.price_per_million_output",
                params![
                    price.model,
                    price.price_per_million_input,
                    price.price_per_million_output,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

fn ignore_no_rows<T>(err: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn decode_agent(conn: &Connection, id: String, name: String, labels_raw: String) -> StoreResult<Agent> {
    let mut labels: Vec<(String, String)> =
        serde_json::from_str(&labels_raw).map_err(decode_err)?;
    labels.sort_by(|a, b| a.0.cmp(&b.0));

    let mut stmt = conn
        .prepare("SELECT team_id FROM agent_teams WHERE agent_id = ?1 ORDER BY team_id")
        .map_err(db_err)?;
    let team_ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;

    Ok(Agent {
        id,
        name,
        labels,
        team_ids,
    })
}

impl AgentStore for SqliteRepository {
    fn find_agent(&self, id: &str) -> StoreResult<Option<Agent>> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, name, labels FROM agents WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;

        match row {
            Some((id, name, labels)) => Ok(Some(decode_agent(&conn, id, name, labels)?)),
            None => Ok(None),
        }
    }

    fn get_or_create_agent(&self, name: &str) -> StoreResult<Agent> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, name, labels FROM agents WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;

        if let Some((id, name, labels)) = row {
            return decode_agent(&conn, id, name, labels);
        }

        let id = Uuid::now_v7().to_string();
        conn.execute(
            "INSERT INTO agents (id, name, labels) VALUES (?1, ?2, '[]')",
            params![id, name],
        )
        .map_err(db_err)?;

        Ok(Agent {
            id,
            name: name.to_string(),
            labels: Vec::new(),
            team_ids: Vec::new(),
        })
    }

    fn find_organization(&self, id: &str) -> StoreResult<Option<Organization>> {
        self.lock_conn()
            .query_row(
                "SELECT id, name, limit_cleanup_interval FROM organizations WHERE id = ?1",
                params![id],
                decode_organization,
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)
    }

    fn organization_of_team(&self, team_id: &str) -> StoreResult<Option<Organization>> {
        self.lock_conn()
            .query_row(
                "SELECT o.id, o.name, o.limit_cleanup_interval \
                 FROM organizations o JOIN teams t ON t.org_id = o.id \
                 WHERE t.id = ?1",
                params![team_id],
                decode_organization,
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)
    }

    fn first_organization_with_limit(&self) -> StoreResult<Option<Organization>> {
        self.lock_conn()
            .query_row(
                "SELECT o.id, o.name, o.limit_cleanup_interval \
                 FROM organizations o \
                 JOIN limits l ON l.entity_type = 'organization' AND l.entity_id = o.id \
                 ORDER BY o.created_at LIMIT 1",
                [],
                decode_organization,
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)
    }
}

fn decode_organization(row: &Row<'_>) -> rusqlite::Result<Organization> {
    let raw: String = row.get(2)?;
    let limit_cleanup_interval = CleanupInterval::parse(&raw).unwrap_or_default();
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        limit_cleanup_interval,
    })
}

fn decode_tool(row: &Row<'_>) -> rusqlite::Result<(Tool, String)> {
    let parameters_raw: String = row.get(4)?;
    Ok((
        Tool {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            parameters: serde_json::Value::Null,
            allow_usage_when_untrusted_data_is_present: row.get::<_, i64>(5)? != 0,
            data_is_trusted_by_default: row.get::<_, i64>(6)? != 0,
        },
        parameters_raw,
    ))
}

fn finish_tool((mut tool, parameters_raw): (Tool, String)) -> StoreResult<Tool> {
    tool.parameters = serde_json::from_str(&parameters_raw).map_err(decode_err)?;
    Ok(tool)
}

impl ToolStore for SqliteRepository {
    fn tools_for_agent(&self, agent_id: &str) -> StoreResult<Vec<Tool>> {
        let conn = self.lock_conn();
        let sql = format!("{} WHERE agent_id = ?1 ORDER BY name", schema::SELECT_TOOLS);
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id], decode_tool)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_tool).collect()
    }

    fn find_tool(&self, agent_id: &str, name: &str) -> StoreResult<Option<Tool>> {
        let conn = self.lock_conn();
        let sql = format!("{} WHERE agent_id = ?1 AND name = ?2", schema::SELECT_TOOLS);
        let row = conn
            .query_row(&sql, params![agent_id, name], decode_tool)
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;
        row.map(finish_tool).transpose()
    }

    fn upsert_tool(&self, tool: NewTool) -> StoreResult<Tool> {
        let parameters = serde_json::to_string(&tool.parameters).map_err(decode_err)?;
        {
            let conn = self.lock_conn();
            // Trust defaults are set on first declaration and never changed
            // by later upserts.
            conn.execute(
                "INSERT INTO tools \
                 (id, agent_id, name, description, parameters, \
                  allow_usage_when_untrusted, data_trusted_by_default) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(agent_id, name) DO UPDATE SET \
                     description = excluded.description, \
                     parameters = excluded.parameters",
                params![
                    Uuid::now_v7().to_string(),
                    tool.agent_id,
                    tool.name,
                    tool.description,
                    parameters,
                    tool.allow_usage_when_untrusted_data_is_present as i64,
                    tool.data_is_trusted_by_default as i64,
                ],
            )
            .map_err(db_err)?;
        }

        self.find_tool(&tool.agent_id, &tool.name)?
            .ok_or_else(|| StoreError::NotFound(format!("tool {} just upserted", tool.name)))
    }
}

impl TrustPolicyStore for SqliteRepository {
    fn trust_policies(
        &self,
        agent_id: &str,
        tool_id: &str,
    ) -> StoreResult<Vec<TrustedDataPolicy>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(schema::SELECT_TRUST_POLICIES_FOR_AGENT_TOOL)
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id, tool_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, tool_id, attribute_path, operator, value, action, description)| {
                Ok(TrustedDataPolicy {
                    id,
                    tool_id,
                    attribute_path,
                    operator: Operator::parse(&operator)
                        .ok_or_else(|| decode_err(format!("invalid operator `{operator}`")))?,
                    value,
                    action: TrustPolicyAction::parse(&action)
                        .ok_or_else(|| decode_err(format!("invalid action `{action}`")))?,
                    description,
                })
            })
            .collect()
    }
}

impl InvocationPolicyStore for SqliteRepository {
    fn invocation_policies(
        &self,
        agent_id: &str,
        tool_name: &str,
    ) -> StoreResult<Vec<ToolInvocationPolicy>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, agent_id, tool_name, condition, action, description \
                 FROM tool_invocation_policies \
                 WHERE agent_id = ?1 AND tool_name = ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id, tool_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, agent_id, tool_name, condition, action, description)| {
                let condition: Option<InvocationCondition> = condition
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .map_err(decode_err)?;
                Ok(ToolInvocationPolicy {
                    id,
                    agent_id,
                    tool_name,
                    condition,
                    action: InvocationPolicyAction::parse(&action)
                        .ok_or_else(|| decode_err(format!("invalid action `{action}`")))?,
                    description,
                })
            })
            .collect()
    }
}

struct InteractionRow {
    interaction: Interaction,
    request: Option<String>,
    response: Option<String>,
    content: Option<String>,
    created_at: String,
}

fn decode_interaction(row: &Row<'_>) -> rusqlite::Result<InteractionRow> {
    Ok(InteractionRow {
        interaction: Interaction {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            chat_id: row.get(2)?,
            interaction_type: row.get(3)?,
            request: None,
            response: None,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            content: None,
            trusted: row.get::<_, i64>(9)? != 0,
            blocked: row.get::<_, i64>(10)? != 0,
            reason: row.get(11)?,
            created_at: Utc::now(),
        },
        request: row.get(4)?,
        response: row.get(5)?,
        content: row.get(8)?,
        created_at: row.get(12)?,
    })
}

fn finish_interaction(row: InteractionRow) -> StoreResult<Interaction> {
    let parse = |raw: Option<String>| -> StoreResult<Option<serde_json::Value>> {
        raw.map(|s| serde_json::from_str(&s).map_err(decode_err))
            .transpose()
    };

    let mut interaction = row.interaction;
    interaction.request = parse(row.request)?;
    interaction.response = parse(row.response)?;
    interaction.content = parse(row.content)?;
    interaction.created_at = parse_datetime("created_at", &row.created_at)?;
    Ok(interaction)
}

impl InteractionStore for SqliteRepository {
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

        let to_text = |value: &Option<serde_json::Value>| -> StoreResult<Option<String>> {
            value
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(decode_err)
        };

        self.lock_conn()
            .execute(
                schema::INSERT_INTERACTION,
                params![
                    interaction.id,
                    interaction.agent_id,
                    interaction.chat_id,
                    interaction.interaction_type,
                    to_text(&interaction.request)?,
                    to_text(&interaction.response)?,
                    interaction.input_tokens,
                    interaction.output_tokens,
                    to_text(&interaction.content)?,
                    interaction.trusted as i64,
                    interaction.blocked as i64,
                    interaction.reason,
                    interaction.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;

        Ok(interaction)
    }

    fn interactions_for_chat(&self, chat_id: &str) -> StoreResult<Vec<Interaction>> {
        let conn = self.lock_conn();
        let sql = format!(
            "{} AND chat_id = ?1 ORDER BY created_at ASC, id ASC",
            schema::SELECT_INTERACTIONS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![chat_id], decode_interaction)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_interaction).collect()
    }

    fn query_interactions(&self, filter: &InteractionFilter) -> StoreResult<Vec<Interaction>> {
        let conn = self.lock_conn();

        let mut sql = schema::SELECT_INTERACTIONS.to_string();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(ref agent_id) = filter.agent_id {
            sql.push_str(" AND agent_id = ?");
            params_vec.push(Box::new(agent_id.clone()));
        }
        if let Some(ref chat_id) = filter.chat_id {
            sql.push_str(" AND chat_id = ?");
            params_vec.push(Box::new(chat_id.clone()));
        }
        if let Some(ref interaction_type) = filter.interaction_type {
            sql.push_str(" AND interaction_type = ?");
            params_vec.push(Box::new(interaction_type.clone()));
        }
        if let Some(blocked) = filter.blocked {
            sql.push_str(" AND blocked = ?");
            params_vec.push(Box::new(blocked as i64));
        }
        if let Some(after) = filter.after {
            sql.push_str(" AND created_at > ?");
            params_vec.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = filter.before {
            sql.push_str(" AND created_at < ?");
            params_vec.push(Box::new(before.to_rfc3339()));
        }

        sql.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = filter.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_refs.as_slice(), decode_interaction)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_interaction).collect()
    }

    fn count_interactions(&self) -> StoreResult<u64> {
        let count: i64 = self
            .lock_conn()
            .query_row(schema::COUNT_INTERACTIONS, [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(count as u64)
    }
}

fn decode_limit(row: &Row<'_>) -> rusqlite::Result<(Limit, String, Option<String>, String)> {
    let entity_type: String = row.get(1)?;
    let last_cleanup: Option<String> = row.get(8)?;
    let updated_at: String = row.get(9)?;
    Ok((
        Limit {
            id: row.get(0)?,
            entity_type: LimitEntity::Agent,
            entity_id: row.get(2)?,
            limit_type: row.get(3)?,
            model: row.get(4)?,
            limit_value: row.get(5)?,
            current_usage_tokens_in: row.get(6)?,
            current_usage_tokens_out: row.get(7)?,
            last_cleanup: None,
            updated_at: Utc::now(),
        },
        entity_type,
        last_cleanup,
        updated_at,
    ))
}

fn finish_limit(
    (mut limit, entity_type, last_cleanup, updated_at): (Limit, String, Option<String>, String),
) -> StoreResult<Limit> {
    limit.entity_type = LimitEntity::parse(&entity_type)
        .ok_or_else(|| decode_err(format!("invalid entity type `{entity_type}`")))?;
    limit.last_cleanup = last_cleanup
        .map(|raw| parse_datetime("last_cleanup", &raw))
        .transpose()?;
    limit.updated_at = parse_datetime("updated_at", &updated_at)?;
    Ok(limit)
}

impl LimitStore for SqliteRepository {
    fn limits_for_entity(&self, entity: LimitEntity, entity_id: &str) -> StoreResult<Vec<Limit>> {
        let conn = self.lock_conn();
        let sql = format!(
            "{} WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY updated_at",
            schema::SELECT_LIMITS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![entity.as_str(), entity_id], decode_limit)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_limit).collect()
    }

    fn insert_limit(&self, limit: Limit) -> StoreResult<Limit> {
        self.lock_conn()
            .execute(
                "INSERT INTO limits \
                 (id, entity_type, entity_id, limit_type, model, limit_value, \
                  current_usage_tokens_in, current_usage_tokens_out, last_cleanup, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    limit.id,
                    limit.entity_type.as_str(),
                    limit.entity_id,
                    limit.limit_type,
                    limit.model,
                    limit.limit_value,
                    limit.current_usage_tokens_in,
                    limit.current_usage_tokens_out,
                    limit.last_cleanup.map(|t| t.to_rfc3339()),
                    limit.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(limit)
    }

    fn list_limits(&self) -> StoreResult<Vec<Limit>> {
        let conn = self.lock_conn();
        let sql = format!("{} ORDER BY updated_at", schema::SELECT_LIMITS);
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([], decode_limit)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_limit).collect()
    }

    fn delete_limit(&self, id: &str) -> StoreResult<bool> {
        let changed = self
            .lock_conn()
            .execute("DELETE FROM limits WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn add_usage(
        &self,
        entity: LimitEntity,
        entity_id: &str,
        tokens_in: i64,
        tokens_out: i64,
    ) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                schema::ADD_LIMIT_USAGE,
                params![
                    tokens_in,
                    tokens_out,
                    Utc::now().to_rfc3339(),
                    entity.as_str(),
                    entity_id,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn reset_usage(&self, limit_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        self.lock_conn()
            .execute(
                schema::RESET_LIMIT_USAGE,
                params![now.to_rfc3339(), limit_id],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

impl TokenPriceStore for SqliteRepository {
    fn price_for_model(&self, model: &str) -> StoreResult<Option<TokenPrice>> {
        self.lock_conn()
            .query_row(
                "SELECT model, price_per_million_input, price_per_million_output \
                 FROM token_prices WHERE model = ?1",
                params![model],
                |row| {
                    Ok(TokenPrice {
                        model: row.get(0)?,
                        price_per_million_input: row.get(1)?,
                        price_per_million_output: row.get(2)?,
                    })
                },
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)
    }
}

fn decode_prompt(row: &Row<'_>) -> rusqlite::Result<(Prompt, String, String, String)> {
    let prompt_type: String = row.get(3)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok((
        Prompt {
            id: row.get(0)?,
            org_id: row.get(1)?,
            name: row.get(2)?,
            prompt_type: PromptType::Regular,
            content: row.get(4)?,
            version: row.get(5)?,
            parent_prompt_id: row.get(6)?,
            is_active: row.get::<_, i64>(7)? != 0,
            created_by: row.get(8)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        },
        prompt_type,
        created_at,
        updated_at,
    ))
}

fn finish_prompt(
    (mut prompt, prompt_type, created_at, updated_at): (Prompt, String, String, String),
) -> StoreResult<Prompt> {
    prompt.prompt_type = PromptType::parse(&prompt_type)
        .ok_or_else(|| decode_err(format!("invalid prompt type `{prompt_type}`")))?;
    prompt.created_at = parse_datetime("created_at", &created_at)?;
    prompt.updated_at = parse_datetime("updated_at", &updated_at)?;
    Ok(prompt)
}

impl PromptStore for SqliteRepository {
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

        self.lock_conn()
            .execute(
                "INSERT INTO prompts \
                 (id, org_id, name, prompt_type, content, version, parent_prompt_id, \
                  is_active, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, NULL, 1, ?6, ?7, ?7)",
                params![
                    prompt.id,
                    prompt.org_id,
                    prompt.name,
                    prompt.prompt_type.as_str(),
                    prompt.content,
                    prompt.created_by,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(e, _)
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!(
                        "an active prompt named `{}` already exists",
                        prompt.name
                    ))
                }
                other => db_err(other),
            })?;

        Ok(prompt)
    }

    fn update_prompt(&self, id: &str, content: &str) -> StoreResult<Prompt> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;

        let old = tx
            .query_row(
                &format!("{} WHERE id = ?1", schema::SELECT_PROMPTS),
                params![id],
                decode_prompt,
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("prompt {id}")))?;
        let old = finish_prompt(old)?;

        if !old.is_active {
            return Err(StoreError::Conflict(format!(
                "prompt {id} is superseded; update the active version"
            )));
        }

        tx.execute(
            "UPDATE prompts SET is_active = 0 WHERE id = ?1",
            params![id],
        )
        .map_err(db_err)?;

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

        tx.execute(
            "INSERT INTO prompts \
             (id, org_id, name, prompt_type, content, version, parent_prompt_id, \
              is_active, created_by, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)",
            params![
                next.id,
                next.org_id,
                next.name,
                next.prompt_type.as_str(),
                next.content,
                next.version,
                next.parent_prompt_id,
                next.created_by,
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(next)
    }

    fn find_prompt(&self, id: &str) -> StoreResult<Option<Prompt>> {
        let row = self
            .lock_conn()
            .query_row(
                &format!("{} WHERE id = ?1", schema::SELECT_PROMPTS),
                params![id],
                decode_prompt,
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(db_err)?;
        row.map(finish_prompt).transpose()
    }

    fn list_prompts(&self, org_id: &str) -> StoreResult<Vec<Prompt>> {
        let conn = self.lock_conn();
        let sql = format!(
            "{} WHERE org_id = ?1 ORDER BY name, version",
            schema::SELECT_PROMPTS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![org_id], decode_prompt)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(finish_prompt).collect()
    }

    fn replace_agent_prompts(
        &self,
        agent_id: &str,
        system_prompt_id: Option<&str>,
        regular_prompt_ids: &[String],
    ) -> StoreResult<Vec<AgentPrompt>> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(
            "DELETE FROM agent_prompts WHERE agent_id = ?1",
            params![agent_id],
        )
        .map_err(db_err)?;

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

        for row in &rows {
            tx.execute(
                "INSERT INTO agent_prompts (id, agent_id, prompt_id, \"order\") \
                 VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.agent_id, row.prompt_id, row.order],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(rows)
    }

    fn agent_prompts(&self, agent_id: &str) -> StoreResult<Vec<AgentPrompt>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, agent_id, prompt_id, \"order\" FROM agent_prompts \
                 WHERE agent_id = ?1 ORDER BY \"order\"",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok(AgentPrompt {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    prompt_id: row.get(2)?,
                    order: row.get(3)?,
                })
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archestra_core::attribute::Operator;

    fn store() -> Arc<SqliteRepository> {
        Arc::new(SqliteRepository::in_memory().unwrap())
    }

    fn new_tool(agent_id: &str, name: &str) -> NewTool {
        NewTool {
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            description: "a tool".to_string(),
            parameters: serde_json::json!({"type": "object"}),
            allow_usage_when_untrusted_data_is_present: false,
            data_is_trusted_by_default: true,
        }
    }

    #[test]
    fn get_or_create_agent_is_idempotent() {
        let store = store();
        let first = store.get_or_create_agent("curl/8.0").unwrap();
        let second = store.get_or_create_agent("curl/8.0").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "curl/8.0");
    }

    #[test]
    fn tool_upsert_preserves_trust_defaults() {
        let store = store();
        let agent = store.get_or_create_agent("a").unwrap();
        let tool = store.upsert_tool(new_tool(&agent.id, "list_emails")).unwrap();
        assert!(tool.data_is_trusted_by_default);

        // Re-declare with flipped defaults: description updates, trust does not.
        let redeclared = store
            .upsert_tool(NewTool {
                description: "updated".to_string(),
                allow_usage_when_untrusted_data_is_present: true,
                data_is_trusted_by_default: false,
                ..new_tool(&agent.id, "list_emails")
            })
            .unwrap();
        assert_eq!(redeclared.id, tool.id);
        assert_eq!(redeclared.description, "updated");
        assert!(redeclared.data_is_trusted_by_default);
        assert!(!redeclared.allow_usage_when_untrusted_data_is_present);
    }

    #[test]
    fn trust_policies_require_agent_opt_in() {
        let store = store();
        let agent = store.get_or_create_agent("a").unwrap();
        let tool = store.upsert_tool(new_tool(&agent.id, "list_emails")).unwrap();

        let policy = TrustedDataPolicy {
            id: "pol-1".to_string(),
            tool_id: tool.id.clone(),
            attribute_path: "emails[*].from".to_string(),
            operator: Operator::EndsWith,
            value: "@trusted.com".to_string(),
            action: TrustPolicyAction::MarkAsTrusted,
            description: "Allow trusted emails".to_string(),
        };
        store.insert_trust_policy(&policy).unwrap();

        assert!(store.trust_policies(&agent.id, &tool.id).unwrap().is_empty());

        store.opt_in_trust_policy(&agent.id, &policy.id).unwrap();
        let policies = store.trust_policies(&agent.id, &tool.id).unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0], policy);
    }

    #[test]
    fn interaction_round_trip_and_filters() {
        let store = store();
        let inserted = store
            .insert_interaction(NewInteraction {
                agent_id: "agent-1".to_string(),
                chat_id: Some("chat-1".to_string()),
                interaction_type: "tool_result".to_string(),
                request: None,
                response: None,
                input_tokens: 0,
                output_tokens: 0,
                content: Some(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": "call_1",
                    "content": "{}",
                })),
                trusted: false,
                blocked: true,
                reason: Some("Block hacker senders".to_string()),
            })
            .unwrap();

        store
            .insert_interaction(NewInteraction {
                agent_id: "agent-1".to_string(),
                chat_id: Some("chat-1".to_string()),
                interaction_type: "anthropic:messages".to_string(),
                request: Some(serde_json::json!({"model": "m"})),
                response: Some(serde_json::json!({"id": "msg"})),
                input_tokens: 12,
                output_tokens: 34,
                content: None,
                trusted: false,
                blocked: false,
                reason: None,
            })
            .unwrap();

        let chat = store.interactions_for_chat("chat-1").unwrap();
        assert_eq!(chat.len(), 2);
        assert_eq!(chat[0].id, inserted.id);
        assert!(chat[0].blocked);

        let blocked_only = store
            .query_interactions(&InteractionFilter {
                blocked: Some(true),
                ..InteractionFilter::default()
            })
            .unwrap();
        assert_eq!(blocked_only.len(), 1);

        let typed = store
            .query_interactions(&InteractionFilter {
                interaction_type: Some("anthropic:messages".to_string()),
                ..InteractionFilter::default()
            })
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].input_tokens, 12);

        assert_eq!(store.count_interactions().unwrap(), 2);
    }

    #[test]
    fn limit_usage_accumulates_and_resets() {
        let store = store();
        let limit = Limit {
            id: "lim-1".to_string(),
            entity_type: LimitEntity::Agent,
            entity_id: "agent-1".to_string(),
            limit_type: "token_cost".to_string(),
            model: None,
            limit_value: 1000.0,
            current_usage_tokens_in: 0,
            current_usage_tokens_out: 0,
            last_cleanup: None,
            updated_at: Utc::now(),
        };
        store.insert_limit(limit).unwrap();

        for _ in 0..3 {
            store
                .add_usage(LimitEntity::Agent, "agent-1", 100, 25)
                .unwrap();
        }

        let limits = store.limits_for_entity(LimitEntity::Agent, "agent-1").unwrap();
        assert_eq!(limits[0].current_usage_tokens_in, 300);
        assert_eq!(limits[0].current_usage_tokens_out, 75);

        let now = Utc::now();
        store.reset_usage("lim-1", now).unwrap();
        let limits = store.limits_for_entity(LimitEntity::Agent, "agent-1").unwrap();
        assert_eq!(limits[0].current_usage_tokens_in, 0);
        assert_eq!(limits[0].current_usage_tokens_out, 0);
        assert!(limits[0].last_cleanup.is_some());

        assert!(store.delete_limit("lim-1").unwrap());
        assert!(!store.delete_limit("lim-1").unwrap());
    }

    #[test]
    fn prompt_versioning_builds_a_linear_chain() {
        let store = store();
        let v1 = store
            .create_prompt(NewPrompt {
                org_id: "org-1".to_string(),
                name: "greeting".to_string(),
                prompt_type: PromptType::System,
                content: "v1".to_string(),
                created_by: "admin".to_string(),
            })
            .unwrap();

        let v2 = store.update_prompt(&v1.id, "v2").unwrap();
        let v3 = store.update_prompt(&v2.id, "v3").unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v3.version, 3);
        assert_eq!(v2.parent_prompt_id.as_deref(), Some(v1.id.as_str()));
        assert_eq!(v3.parent_prompt_id.as_deref(), Some(v2.id.as_str()));

        let all = store.list_prompts("org-1").unwrap();
        assert_eq!(all.len(), 3);
        let active: Vec<_> = all.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, v3.id);

        // Updating a superseded version is rejected.
        assert!(matches!(
            store.update_prompt(&v1.id, "v4"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn duplicate_active_prompt_is_a_conflict() {
        let store = store();
        let new = |content: &str| NewPrompt {
            org_id: "org-1".to_string(),
            name: "greeting".to_string(),
            prompt_type: PromptType::System,
            content: content.to_string(),
            created_by: "admin".to_string(),
        };
        store.create_prompt(new("v1")).unwrap();
        assert!(matches!(
            store.create_prompt(new("other")),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn replace_agent_prompts_orders_system_first() {
        let store = store();
        let agent = store.get_or_create_agent("a").unwrap();
        let rows = store
            .replace_agent_prompts(
                &agent.id,
                Some("prompt-sys"),
                &["prompt-r1".to_string(), "prompt-r2".to_string()],
            )
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].order, 0);
        assert_eq!(rows[0].prompt_id, "prompt-sys");
        assert_eq!(rows[1].order, 1);
        assert_eq!(rows[2].order, 2);

        // Replacement is delete-then-insert.
        let rows = store
            .replace_agent_prompts(&agent.id, None, &["prompt-r2".to_string()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order, 1);
        assert_eq!(store.agent_prompts(&agent.id).unwrap().len(), 1);
    }

    #[test]
    fn organization_resolution_for_teams_and_limits() {
        let store = store();
        let org = store
            .bootstrap_default_organization(CleanupInterval::Hourly)
            .unwrap();
        // Idempotent.
        let again = store
            .bootstrap_default_organization(CleanupInterval::Daily)
            .unwrap();
        assert_eq!(org.id, again.id);
        assert_eq!(again.limit_cleanup_interval, CleanupInterval::Hourly);

        let team = store.insert_team(&org.id, "platform").unwrap();
        let agent = store.get_or_create_agent("a").unwrap();
        store.assign_agent_team(&agent.id, &team.id).unwrap();

        let agent = store.find_agent(&agent.id).unwrap().unwrap();
        assert_eq!(agent.team_ids, vec![team.id.clone()]);

        let resolved = store.organization_of_team(&team.id).unwrap().unwrap();
        assert_eq!(resolved.id, org.id);

        assert!(store.first_organization_with_limit().unwrap().is_none());
        store
            .insert_limit(Limit {
                id: "lim-org".to_string(),
                entity_type: LimitEntity::Organization,
                entity_id: org.id.clone(),
                limit_type: "token_cost".to_string(),
                model: None,
                limit_value: 10.0,
                current_usage_tokens_in: 0,
                current_usage_tokens_out: 0,
                last_cleanup: None,
                updated_at: Utc::now(),
            })
            .unwrap();
        let found = store.first_organization_with_limit().unwrap().unwrap();
        assert_eq!(found.id, org.id);
    }

    #[test]
    fn token_price_upsert_round_trip() {
        let store = store();
        store
            .upsert_token_price(&TokenPrice {
                model: "claude-sonnet".to_string(),
                price_per_million_input: 3.0,
                price_per_million_output: 15.0,
            })
            .unwrap();
        store
            .upsert_token_price(&TokenPrice {
                model: "claude-sonnet".to_string(),
                price_per_million_input: 4.0,
                price_per_million_output: 20.0,
            })
            .unwrap();

        let price = store.price_for_model("claude-sonnet").unwrap().unwrap();
        assert_eq!(price.price_per_million_input, 4.0);
        assert!(store.price_for_model("unknown").unwrap().is_none());
    }
}
