//! Subscription loop.
//!
//! Holds exactly one subscription for the life of the process and dispatches
//! deliveries strictly one at a time: the next receive is not issued until
//! the previous handler invocation returned.

use std::time::Duration;

use tokio::sync::watch;

use relay_common::error::RelayError;
use relay_common::types::Message;

use crate::broker::Broker;
use crate::fault::{FaultAction, FaultHandler};
use crate::handler::MessageHandler;

/// A queue-to-HTTP relay bound to one broker subscription.
pub struct Relay<B: Broker> {
    broker: B,
    handler: MessageHandler,
    faults: FaultHandler,
    fault_pause: Duration,
}

impl<B: Broker> Relay<B> {
    pub fn new(
        broker: B,
        handler: MessageHandler,
        faults: FaultHandler,
        fault_pause: Duration,
    ) -> Self {
        Self {
            broker,
            handler,
            faults,
            fault_pause,
        }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Shutdown abandons a pending receive but never an in-flight handler: the
    /// current message is finished before the broker is closed. Only a failed
    /// initial subscribe returns an error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let queue = self.broker.entity_path().to_string();

        if let Err(e) = self.broker.subscribe().await {
            self.faults.report(FaultAction::Subscribe, &e);
            return Err(e.into());
        }

        tracing::info!(queue = %queue, "Queue relay starting listening");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = self.next_delivery() => next,
            };

            match next {
                Ok(Some(message)) => {
                    // Outside the select so shutdown cannot abort it.
                    self.handler.handle(&mut self.broker, message).await;
                }
                Ok(None) => {}
                Err((action, e)) => {
                    self.faults.report(action, &e);

                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.fault_pause) => {}
                    }
                }
            }
        }

        let Self { broker, faults, .. } = self;
        if let Err(e) = broker.close().await {
            faults.report(FaultAction::Close, &e);
        }

        tracing::info!(queue = %queue, "Queue relay shutting down");
        Ok(())
    }

    /// Prefer messages whose lock expired over new ones, so redeliveries are
    /// not starved by a busy queue.
    async fn next_delivery(&mut self) -> Result<Option<Message>, (FaultAction, RelayError)> {
        let reclaimed = self
            .broker
            .reclaim_expired()
            .await
            .map_err(|e| (FaultAction::Reclaim, e))?;

        let next = match reclaimed {
            Some(message) => Some(message),
            None => self
                .broker
                .receive()
                .await
                .map_err(|e| (FaultAction::Receive, e))?,
        };

        self.faults.clear();
        Ok(next)
    }
}
