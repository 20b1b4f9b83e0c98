//! Shared application state for the daemon

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use archestra_core::Repository;

use crate::config::Config;
use crate::mcp::McpClient;
use crate::quota_worker::{QuotaWorker, QuotaWorkerHandle};
use crate::rate_limit::RateLimitState;
use crate::store::SqliteRepository;
use crate::upstream::anthropic::AnthropicClient;
use crate::upstream::openai::OpenAiClient;

/// Event broadcast to SSE observers: classifications, refusals, dual-LLM
/// progress.
#[derive(Clone, Debug)]
pub struct GatewayEvent {
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Concrete store, for seeding and admin operations.
    pub store: Arc<SqliteRepository>,
    /// Repository handle consumed by the policy engines.
    pub repo: Repository,
    pub anthropic: Arc<AnthropicClient>,
    pub openai: Arc<OpenAiClient>,
    pub mcp: McpClient,
    /// Transparent reverse-proxy client for non-completion routes.
    pub passthrough: reqwest::Client,
    pub quota_worker: QuotaWorker,
    pub event_tx: broadcast::Sender<GatewayEvent>,
    pub rate_limit: RateLimitState,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Build state from configuration. Returns the worker handle separately
    /// so the caller controls shutdown draining.
    pub async fn new(config: Config) -> anyhow::Result<(Self, QuotaWorkerHandle)> {
        let store = Arc::new(SqliteRepository::new(&config.database_path)?);
        Self::with_store(config, store)
    }

    /// Build state over an existing store (tests use an in-memory one).
    pub fn with_store(
        config: Config,
        store: Arc<SqliteRepository>,
    ) -> anyhow::Result<(Self, QuotaWorkerHandle)> {
        let org = store.bootstrap_default_organization(config.default_cleanup_interval)?;
        tracing::info!(
            org_id = %org.id,
            cleanup_interval = org.limit_cleanup_interval.as_str(),
            admin = %config.admin.email,
            "default organization ready"
        );

        let repo = store.repository();
        let upstream_deadline = Duration::from_secs(config.deadlines.upstream_secs);

        let anthropic = Arc::new(AnthropicClient::new(
            &config.providers.anthropic_base_url,
            upstream_deadline,
        )?);
        let openai = Arc::new(OpenAiClient::new(
            &config.providers.openai_base_url,
            upstream_deadline,
        )?);
        let mcp = McpClient::new(&config.mcp_base_url, upstream_deadline)?;
        let passthrough = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.deadlines.request_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let (quota_worker, worker_handle) =
            QuotaWorker::spawn(repo.clone(), config.quota_queue_size);

        let (event_tx, _) = broadcast::channel(256);
        let rate_limit = RateLimitState::new(&config.rate_limit);

        Ok((
            Self {
                config: Arc::new(config),
                store,
                repo,
                anthropic,
                openai,
                mcp,
                passthrough,
                quota_worker,
                event_tx,
                rate_limit,
                started_at: chrono::Utc::now(),
            },
            worker_handle,
        ))
    }

    pub fn broadcast(&self, event: GatewayEvent) {
        // Only fails when no observer is subscribed.
        let _ = self.event_tx.send(event);
    }

    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.started_at).num_seconds()
    }
}
