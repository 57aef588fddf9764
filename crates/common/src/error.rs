use thiserror::Error;

/// Common error types used across the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Downstream rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Downstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// HTTP status of a downstream rejection, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Rejected { status, .. } => Some(*status),
            RelayError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
