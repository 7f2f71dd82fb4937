use thiserror::Error;

/// Error types for chain client operations
#[derive(Debug, Error)]
pub(crate) enum ChainError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    BadResponse(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),
}
