use std::str::FromStr;

use crate::error::RelayError;

/// Opaque handle proving ownership of a delivered message.
///
/// Only the broker that issued it can interpret the token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered by the broker, locked to this consumer until it is
/// completed or the lock expires.
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned identifier, used to correlate logs
    pub message_id: String,
    /// Handle required to complete the message
    pub lock_token: LockToken,
    /// Raw payload as published by the producer
    pub body: Vec<u8>,
    /// Set when the message was reclaimed after an earlier lock expired
    pub redelivered: bool,
}

/// How payloads are mapped onto downstream requests.
///
/// Exactly one mode is active per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeMode {
    /// Payload posted verbatim to the base URL as `application/json`
    Raw,
    /// Payload is a JSON object whose `resource_id` is appended to the base URL
    ResourceId,
}

impl std::fmt::Display for EnvelopeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeMode::Raw => write!(f, "raw"),
            EnvelopeMode::ResourceId => write!(f, "resource_id"),
        }
    }
}

impl FromStr for EnvelopeMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(EnvelopeMode::Raw),
            "resource_id" => Ok(EnvelopeMode::ResourceId),
            other => Err(RelayError::Config(format!(
                "unknown envelope mode '{other}' (expected 'raw' or 'resource_id')"
            ))),
        }
    }
}
