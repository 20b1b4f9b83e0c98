//! Configuration for the archestrad daemon

use std::path::PathBuf;

use archestra_core::CleanupInterval;
use serde::{Deserialize, Serialize};

/// Expand `${VAR}` references against the process environment, so secrets
/// stay out of config files.
pub(crate) fn expand_env_vars(raw: &str) -> anyhow::Result<String> {
    let mut expanded = String::with_capacity(raw.len());
    let mut remainder = raw;

    loop {
        let Some(open) = remainder.find("${") else {
            expanded.push_str(remainder);
            return Ok(expanded);
        };

        expanded.push_str(&remainder[..open]);
        let body = &remainder[open + 2..];
        let Some(close) = body.find('}') else {
            anyhow::bail!("config value {raw:?} has an unterminated ${{...}} reference");
        };

        let var = &body[..close];
        if var.is_empty() {
            anyhow::bail!("config value {raw:?} references an unnamed environment variable");
        }
        let value = std::env::var(var).map_err(|_| {
            anyhow::anyhow!("environment variable {var} referenced by config is not set")
        })?;

        expanded.push_str(&value);
        remainder = &body[close + 1..];
    }
}

/// Upstream provider base URLs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_base_url: default_anthropic_base_url(),
            openai_base_url: default_openai_base_url(),
        }
    }
}

/// Request and upstream deadlines, in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadlinesConfig {
    /// Overall deadline for a non-streaming request.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    /// Deadline for a single upstream call.
    #[serde(default = "default_upstream_secs")]
    pub upstream_secs: u64,
}

fn default_request_secs() -> u64 {
    300
}

fn default_upstream_secs() -> u64 {
    120
}

impl Default for DeadlinesConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            upstream_secs: default_upstream_secs(),
        }
    }
}

/// Bootstrap admin identity handed to the (external) auth layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    pub email: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            email: "admin@localhost".to_string(),
            password: "change-me".to_string(),
        }
    }
}

/// Per-IP rate limiting for the admin surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

fn default_rps() -> u32 {
    100
}

fn default_burst() -> u32 {
    50
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: default_rps(),
            burst_size: default_burst(),
        }
    }
}

/// Daemon configuration, loaded from YAML with environment expansion for
/// secret-bearing values.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (HOST:PORT)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub deadlines: DeadlinesConfig,

    /// Model used for isolated dual-LLM evaluation
    #[serde(default = "default_secondary_model")]
    pub secondary_model: String,

    /// Cleanup interval applied to the default organization at bootstrap
    #[serde(default)]
    pub default_cleanup_interval: CleanupInterval,

    /// Base URL of the MCP tool-execution service
    #[serde(default = "default_mcp_base_url")]
    pub mcp_base_url: String,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Enable permissive CORS on the admin surface
    #[serde(default)]
    pub cors_enabled: bool,

    /// Size of the background quota update queue
    #[serde(default = "default_quota_queue_size")]
    pub quota_queue_size: usize,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "127.0.0.1:9800".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("archestra.db")
}

fn default_secondary_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_mcp_base_url() -> String {
    "http://127.0.0.1:9810".to_string()
}

fn default_quota_queue_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_path: default_database_path(),
            providers: ProvidersConfig::default(),
            deadlines: DeadlinesConfig::default(),
            secondary_model: default_secondary_model(),
            default_cleanup_interval: CleanupInterval::default(),
            mcp_base_url: default_mcp_base_url(),
            admin: AdminConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors_enabled: false,
            quota_queue_size: default_quota_queue_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path, e))?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.admin.password = expand_env_vars(&config.admin.password)?;
        config.admin.email = expand_env_vars(&config.admin.email)?;
        Ok(config)
    }

    /// Load the default config: `ARCHESTRA_CONFIG` if set, else
    /// `archestra.yaml` when present, else built-in defaults.
    pub fn load_default() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("ARCHESTRA_CONFIG") {
            return Self::from_file(&path);
        }
        if std::path::Path::new("archestra.yaml").exists() {
            return Self::from_file("archestra.yaml");
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow::anyhow!("Invalid listen address: {}", self.listen));
        }
        for (name, url) in [
            ("providers.anthropic_base_url", &self.providers.anthropic_base_url),
            ("providers.openai_base_url", &self.providers.openai_base_url),
            ("mcp_base_url", &self.mcp_base_url),
        ] {
            if reqwest::Url::parse(url).is_err() {
                return Err(anyhow::anyhow!("Invalid URL for {}: {}", name, url));
            }
        }
        if self.deadlines.request_secs == 0 || self.deadlines.upstream_secs == 0 {
            return Err(anyhow::anyhow!("Deadlines must be non-zero"));
        }
        if self.secondary_model.is_empty() {
            return Err(anyhow::anyhow!("secondary_model must be set"));
        }
        if self.admin.email.is_empty() || self.admin.password.is_empty() {
            return Err(anyhow::anyhow!("admin.email and admin.password must be set"));
        }
        Ok(())
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}
