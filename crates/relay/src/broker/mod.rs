//! Queue broker seam.
//!
//! A broker hands out one locked message at a time. The lock is held until the
//! message is completed or the broker's lock timeout expires, after which
//! [`Broker::reclaim_expired`] redelivers it.

pub mod memory;
pub mod redis_streams;

use std::future::Future;

use relay_common::error::RelayError;
use relay_common::types::{LockToken, Message};

pub use self::memory::InMemoryBroker;
pub use self::redis_streams::RedisBroker;

/// Result of completing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The message was acknowledged and removed from the queue.
    Completed,
    /// The lock token no longer refers to a locked message: it was already
    /// completed, or its lock expired and it was redelivered.
    NotLocked,
}

/// Trait implemented by queue broker bindings.
pub trait Broker: Send {
    /// Broker endpoint, safe to log.
    fn endpoint(&self) -> String;

    /// Queue (entity path) this broker consumes from.
    fn entity_path(&self) -> &str;

    /// Ensure the subscription exists. Must be idempotent.
    fn subscribe(&mut self) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Take over one message whose lock expired, if any.
    fn reclaim_expired(&mut self) -> impl Future<Output = Result<Option<Message>, RelayError>> + Send;

    /// Wait a bounded time for one new message.
    fn receive(&mut self) -> impl Future<Output = Result<Option<Message>, RelayError>> + Send;

    /// Complete the message identified by `lock_token`.
    fn complete(
        &mut self,
        lock_token: &LockToken,
    ) -> impl Future<Output = Result<Completion, RelayError>> + Send;

    /// Release the subscription. Messages still locked stay pending.
    fn close(self) -> impl Future<Output = Result<(), RelayError>> + Send;
}
