//! Isolated secondary-model client for dual-LLM evaluation.
//!
//! Built fresh per request: a dedicated HTTP client with no shared headers
//! and no caller conversation history. The only inputs that ever reach the
//! secondary model are the sanctioned instruction (candidate list) and the
//! isolated content.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use archestra_core::SecondaryModel;

pub struct SecondaryClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl SecondaryClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: &str,
        deadline: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl SecondaryModel for SecondaryClient {
    async fn complete(&self, instruction: &str, content: &str) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": 16,
            "system": instruction,
            "messages": [{"role": "user", "content": content}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header(
                "anthropic-version",
                crate::upstream::anthropic::ANTHROPIC_VERSION,
            )
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("secondary model call failed: {status} {body}"));
        }

        let parsed: serde_json::Value = response.json().await?;
        let text = parsed["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|block| block.get("text").and_then(|t| t.as_str()))
            })
            .unwrap_or_default();
        Ok(text.to_string())
    }
}
