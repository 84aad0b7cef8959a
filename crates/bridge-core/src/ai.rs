use async_trait::async_trait;

use crate::session::Turn;

/// Failure talking to the hosted completion API. Always recoverable.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to {provider} failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("malformed {provider} response: {message}")]
    Malformed {
        provider: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait AiClient: Send + Sync {
    /// Sends `history` (already windowed) plus `message` and returns the raw
    /// reply text.
    async fn complete(&self, history: &[Turn], message: &str) -> Result<String, UpstreamError>;
}
