//! Upstream provider clients and wire types.

pub mod anthropic;
pub mod openai;
pub mod sse;

use std::time::Duration;

use futures::StreamExt;

use sse::{SseDecoder, SseEvent};

/// Errors from upstream provider calls.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("upstream deadline exceeded")]
    Timeout,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// Build the client used for unary upstream calls.
pub fn unary_client(deadline: Duration) -> UpstreamResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(deadline)
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Build the client used for streaming calls: a total deadline would kill
/// long-lived streams, so only the connect phase is bounded.
pub fn streaming_client() -> UpstreamResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Pull-based reader over an upstream SSE response body.
pub struct EventSource {
    body: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    pending: std::collections::VecDeque<SseEvent>,
}

impl EventSource {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Next complete SSE event, or `None` at end of stream.
    pub async fn next_event(&mut self) -> UpstreamResult<Option<SseEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => {
                    self.pending.extend(self.decoder.push(&chunk));
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(None),
            }
        }
    }
}

/// Read an error body, capped so a hostile upstream cannot balloon memory.
pub(crate) async fn error_body(response: reqwest::Response) -> UpstreamError {
    let status = response.status().as_u16();
    let body = match response.text().await {
        Ok(text) => text.chars().take(16 * 1024).collect(),
        Err(_) => String::new(),
    };
    UpstreamError::Status { status, body }
}
