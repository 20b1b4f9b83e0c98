//! Database schema for the gateway store

/// SQL to create all tables and indices
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    limit_cleanup_interval TEXT NOT NULL DEFAULT '1h',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL REFERENCES organizations(id),
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    labels TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS agent_teams (
    agent_id TEXT NOT NULL REFERENCES agents(id),
    team_id TEXT NOT NULL REFERENCES teams(id),
    PRIMARY KEY (agent_id, team_id)
);

CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    name TEXT NOT NULL,
    prompt_type TEXT NOT NULL,
    content TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    parent_prompt_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_prompts_active
    ON prompts(org_id, name, prompt_type) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS agent_prompts (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    prompt_id TEXT NOT NULL REFERENCES prompts(id),
    "order" INTEGER NOT NULL,
    UNIQUE (agent_id, prompt_id)
);

CREATE INDEX IF NOT EXISTS idx_agent_prompts_order ON agent_prompts(agent_id, "order");

CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    parameters TEXT NOT NULL DEFAULT '{}',
    allow_usage_when_untrusted INTEGER NOT NULL DEFAULT 0,
    data_trusted_by_default INTEGER NOT NULL DEFAULT 0,
    UNIQUE (agent_id, name)
);

CREATE TABLE IF NOT EXISTS trusted_data_policies (
    id TEXT PRIMARY KEY,
    tool_id TEXT NOT NULL REFERENCES tools(id),
    attribute_path TEXT NOT NULL,
    operator TEXT NOT NULL,
    value TEXT NOT NULL,
    action TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS agent_trusted_data_policies (
    agent_id TEXT NOT NULL REFERENCES agents(id),
    policy_id TEXT NOT NULL REFERENCES trusted_data_policies(id),
    PRIMARY KEY (agent_id, policy_id)
);

CREATE INDEX IF NOT EXISTS idx_agent_trusted_policies
    ON agent_trusted_data_policies(agent_id);

CREATE TABLE IF NOT EXISTS tool_invocation_policies (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    tool_name TEXT NOT NULL,
    condition TEXT,
    action TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_invocation_policies
    ON tool_invocation_policies(agent_id, tool_name);

CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    chat_id TEXT,
    interaction_type TEXT NOT NULL,
    request TEXT,
    response TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    content TEXT,
    trusted INTEGER NOT NULL DEFAULT 0,
    blocked INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_chat ON interactions(chat_id, created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_agent ON interactions(agent_id, created_at DESC);

CREATE TABLE IF NOT EXISTS limits (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    limit_type TEXT NOT NULL DEFAULT 'token_cost',
    model TEXT,
    limit_value REAL NOT NULL,
    current_usage_tokens_in INTEGER NOT NULL DEFAULT 0,
    current_usage_tokens_out INTEGER NOT NULL DEFAULT 0,
    last_cleanup TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_limits_entity ON limits(entity_type, entity_id, limit_type);

CREATE TABLE IF NOT EXISTS token_prices (
    model TEXT PRIMARY KEY,
    price_per_million_input REAL NOT NULL,
    price_per_million_output REAL NOT NULL
);
"#;

pub const INSERT_INTERACTION: &str = r#"
INSERT INTO interactions
    (id, agent_id, chat_id, interaction_type, request, response,
     input_tokens, output_tokens, content, trusted, blocked, reason, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#;

pub const SELECT_INTERACTIONS: &str = r#"
SELECT id, agent_id, chat_id, interaction_type, request, response,
       input_tokens, output_tokens, content, trusted, blocked, reason, created_at
FROM interactions
WHERE 1=1
"#;

pub const COUNT_INTERACTIONS: &str = "SELECT COUNT(*) FROM interactions";

pub const SELECT_LIMITS: &str = r#"
SELECT id, entity_type, entity_id, limit_type, model, limit_value,
       current_usage_tokens_in, current_usage_tokens_out, last_cleanup, updated_at
FROM limits
"#;

pub const ADD_LIMIT_USAGE: &str = r#"
UPDATE limits
SET current_usage_tokens_in = current_usage_tokens_in + ?1,
    current_usage_tokens_out = current_usage_tokens_out + ?2,
    updated_at = ?3
WHERE entity_type = ?4 AND entity_id = ?5 AND limit_type = 'token_cost'
"#;

pub const RESET_LIMIT_USAGE: &str = r#"
UPDATE limits
SET current_usage_tokens_in = 0,
    current_usage_tokens_out = 0,
    last_cleanup = ?1,
    updated_at = ?1
WHERE id = ?2
"#;

pub const SELECT_TOOLS: &str = r#"
SELECT id, agent_id, name, description, parameters,
       allow_usage_when_untrusted, data_trusted_by_default
FROM tools
"#;

pub const SELECT_TRUST_POLICIES_FOR_AGENT_TOOL: &str = r#"
SELECT p.id, p.tool_id, p.attribute_path, p.operator, p.value, p.action, p.description
FROM trusted_data_policies p
JOIN agent_trusted_data_policies ap ON ap.policy_id = p.id
WHERE ap.agent_id = ?1 AND p.tool_id = ?2
"#;

pub const SELECT_PROMPTS: &str = r#"
SELECT id, org_id, name, prompt_type, content, version, parent_prompt_id,
       is_active, created_by, created_at, updated_at
FROM prompts
"#;
