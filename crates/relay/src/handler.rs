//! Per-delivery message handling.
//!
//! For each message:
//! 1. Decode the payload per the active envelope mode
//! 2. Resolve the downstream URL
//! 3. POST once to the downstream service
//! 4. Complete the message only if the response status is 2xx
//!
//! Every failure is absorbed here: the message is left locked and the broker
//! redelivers it after the lock timeout. There are no local retries.

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};

use relay_common::error::RelayError;
use relay_common::types::{EnvelopeMode, Message};

use crate::broker::{Broker, Completion};
use crate::envelope::{Envelope, TargetRequest};
use crate::fault::{FaultAction, FaultHandler};
use crate::stats::RelayStats;

/// What happened to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Downstream accepted the message and the broker removed it.
    Completed,
    /// The message was not completed; it will be redelivered after its lock
    /// expires. Carries the failure detail.
    LeftPending(String),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// Forwards one message to the downstream service.
pub struct MessageHandler {
    client: Client,
    base_url: Url,
    mode: EnvelopeMode,
    faults: FaultHandler,
    stats: Arc<RelayStats>,
}

impl MessageHandler {
    pub fn new(
        client: Client,
        base_url: Url,
        mode: EnvelopeMode,
        faults: FaultHandler,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            client,
            base_url,
            mode,
            faults,
            stats,
        }
    }

    /// Handle one delivery. Never fails: errors become [`Outcome::LeftPending`].
    pub async fn handle<B: Broker>(&self, broker: &mut B, message: Message) -> Outcome {
        tracing::info!(
            message_id = %message.message_id,
            redelivered = message.redelivered,
            "Message received"
        );
        self.stats.record_received();

        let started = Instant::now();

        let envelope = match Envelope::decode(self.mode, &message.body) {
            Ok(envelope) => envelope,
            Err(e) => return self.fail(&message, None, e),
        };
        let resource_id = envelope.resource_id().map(str::to_string);

        let request = match envelope.into_request(&self.base_url) {
            Ok(request) => request,
            Err(e) => return self.fail(&message, resource_id.as_deref(), e),
        };

        let status = match self.send(request).await {
            Ok(status) => status,
            Err(e) => return self.fail(&message, resource_id.as_deref(), e),
        };

        match broker.complete(&message.lock_token).await {
            Ok(Completion::Completed) => {
                tracing::info!(
                    message_id = %message.message_id,
                    resource_id = resource_id.as_deref(),
                    status = status.as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Message completed"
                );
                self.stats.record_completed();
                Outcome::Completed
            }
            Ok(Completion::NotLocked) => {
                // Already completed, or the lock expired while the downstream
                // call was running and the message went back to the queue.
                tracing::warn!(
                    message_id = %message.message_id,
                    resource_id = resource_id.as_deref(),
                    lock_token = %message.lock_token,
                    "Message lock no longer held, completion skipped"
                );
                self.stats.record_lost_lock();
                Outcome::LeftPending("message lock no longer held".to_string())
            }
            Err(e) => {
                self.faults.report(FaultAction::Complete, &e);
                self.fail(&message, resource_id.as_deref(), e)
            }
        }
    }

    /// Issue the downstream request. Only a 2xx status counts as success.
    async fn send(&self, request: TargetRequest) -> Result<StatusCode, RelayError> {
        let mut builder = self.client.post(request.url);
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(status);
        }

        let body = response.text().await.unwrap_or_default();
        Err(RelayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn fail(&self, message: &Message, resource_id: Option<&str>, error: RelayError) -> Outcome {
        tracing::error!(
            message_id = %message.message_id,
            resource_id,
            status = error.status(),
            error = %error,
            "Message failed"
        );
        self.stats.record_failed();
        Outcome::LeftPending(error.to_string())
    }
}
