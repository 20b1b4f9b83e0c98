//! Managed-tool execution over the MCP endpoint.

use std::time::Duration;

use serde_json::{json, Value};

/// Client for the external MCP tool-execution service. Each managed tool is
/// executed against its own endpoint under the configured base URL.
#[derive(Clone)]
pub struct McpClient {
    client: reqwest::Client,
    base_url: String,
}

impl McpClient {
    pub fn new(base_url: &str, deadline: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Execute a managed tool and return its raw result content.
    pub async fn execute(&self, tool_name: &str, arguments: &Value) -> anyhow::Result<String> {
        let url = format!("{}/tools/{}/execute", self.base_url, tool_name);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "arguments": arguments }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "tool execution failed: {tool_name}: {status} {body}"
            ));
        }

        let parsed: Value = response.json().await?;
        // Services return either {"content": ...} or a bare result value.
        let content = parsed.get("content").unwrap_or(&parsed);
        Ok(match content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}
