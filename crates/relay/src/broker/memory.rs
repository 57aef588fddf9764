//! In-memory broker with lock/lease semantics.
//!
//! Behaves like the Redis binding: a received message stays locked until it is
//! completed or its lock expires, every delivery gets a fresh lock token, and a
//! stale token cannot complete the message. Useful for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use relay_common::error::RelayError;
use relay_common::types::{LockToken, Message};

use super::{Broker, Completion};

const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct Locked {
    stored: Stored,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Stored>,
    locked: HashMap<LockToken, Locked>,
    completed: Vec<String>,
    delivery_counts: HashMap<String, u32>,
    next_id: u64,
    next_token: u64,
    injected_faults: u32,
    closed: bool,
}

impl State {
    fn lease(&mut self, mut stored: Stored, lock_timeout: Duration) -> Message {
        self.next_token += 1;
        let lock_token = LockToken::new(format!("lock-{}", self.next_token));

        stored.deliveries += 1;
        self.delivery_counts
            .insert(stored.message_id.clone(), stored.deliveries);

        let message = Message {
            message_id: stored.message_id.clone(),
            lock_token: lock_token.clone(),
            body: stored.body.clone(),
            redelivered: stored.deliveries > 1,
        };

        self.locked.insert(
            lock_token,
            Locked {
                stored,
                expires_at: Instant::now() + lock_timeout,
            },
        );

        message
    }

    fn take_fault(&mut self) -> Option<RelayError> {
        if self.injected_faults == 0 {
            return None;
        }
        self.injected_faults -= 1;
        Some(RelayError::Transport("connection reset by broker".to_string()))
    }
}

/// Shared in-memory queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    queue: String,
    lock_timeout: Duration,
    receive_wait: Duration,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new(queue: impl Into<String>, lock_timeout: Duration) -> Self {
        Self {
            queue: queue.into(),
            lock_timeout,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Set how long `receive` waits for a message before returning `None`.
    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }

    /// Publish a payload and return its generated message id.
    pub async fn publish(&self, body: impl Into<Vec<u8>>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let message_id = format!("msg-{}", state.next_id);
        state.ready.push_back(Stored {
            message_id: message_id.clone(),
            body: body.into(),
            deliveries: 0,
        });
        drop(state);

        self.notify.notify_one();
        message_id
    }

    /// Make the next `count` broker operations fail with a transport error,
    /// as if the connection dropped.
    pub async fn inject_faults(&self, count: u32) {
        self.state.lock().await.injected_faults += count;
        self.notify.notify_one();
    }

    /// Expire every held lock immediately.
    pub async fn expire_locks(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for locked in state.locked.values_mut() {
            locked.expires_at = now;
        }
    }

    /// Ids of completed messages, in completion order.
    pub async fn completed(&self) -> Vec<String> {
        self.state.lock().await.completed.clone()
    }

    /// Messages not yet completed (ready or locked).
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.locked.len()
    }

    /// How many times a message has been delivered.
    pub async fn delivery_count(&self, message_id: &str) -> u32 {
        let state = self.state.lock().await;
        state.delivery_counts.get(message_id).copied().unwrap_or(0)
    }

    /// Whether a consumer has closed its subscription.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

impl Broker for InMemoryBroker {
    fn endpoint(&self) -> String {
        "memory://local".to_string()
    }

    fn entity_path(&self) -> &str {
        &self.queue
    }

    async fn subscribe(&mut self) -> Result<(), RelayError> {
        self.state.lock().await.closed = false;
        Ok(())
    }

    async fn reclaim_expired(&mut self) -> Result<Option<Message>, RelayError> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }

        let now = Instant::now();
        let expired = state
            .locked
            .iter()
            .filter(|(_, locked)| locked.expires_at <= now)
            .min_by_key(|(_, locked)| locked.expires_at)
            .map(|(token, _)| token.clone());

        let Some(token) = expired else {
            return Ok(None);
        };
        let Some(locked) = state.locked.remove(&token) else {
            return Ok(None);
        };

        Ok(Some(state.lease(locked.stored, self.lock_timeout)))
    }

    async fn receive(&mut self) -> Result<Option<Message>, RelayError> {
        let deadline = Instant::now() + self.receive_wait;

        loop {
            // A publish racing the check below leaves a permit, so the wait
            // returns immediately instead of missing it.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().await;
                if let Some(fault) = state.take_fault() {
                    return Err(fault);
                }
                if let Some(stored) = state.ready.pop_front() {
                    return Ok(Some(state.lease(stored, self.lock_timeout)));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn complete(&mut self, lock_token: &LockToken) -> Result<Completion, RelayError> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }

        match state.locked.remove(lock_token) {
            Some(locked) => {
                state.completed.push(locked.stored.message_id);
                Ok(Completion::Completed)
            }
            None => Ok(Completion::NotLocked),
        }
    }

    async fn close(self) -> Result<(), RelayError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new("outbound", Duration::from_secs(60))
            .with_receive_wait(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_receive_returns_none_when_empty() {
        let mut broker = broker();
        assert!(broker.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_received_message_stays_pending_until_completed() {
        let mut broker = broker();
        let id = broker.publish(b"{}".to_vec()).await;

        let message = broker.receive().await.unwrap().unwrap();
        assert_eq!(message.message_id, id);
        assert!(!message.redelivered);
        assert_eq!(broker.pending().await, 1);

        let completion = broker.complete(&message.lock_token).await.unwrap();
        assert_eq!(completion, Completion::Completed);
        assert_eq!(broker.pending().await, 0);
        assert_eq!(broker.completed().await, vec![id]);
    }

    #[tokio::test]
    async fn test_double_completion_is_not_locked() {
        let mut broker = broker();
        broker.publish(b"{}".to_vec()).await;
        let message = broker.receive().await.unwrap().unwrap();

        broker.complete(&message.lock_token).await.unwrap();
        let second = broker.complete(&message.lock_token).await.unwrap();
        assert_eq!(second, Completion::NotLocked);
        assert_eq!(broker.completed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lock_is_redelivered_with_new_token() {
        let mut broker = broker();
        let id = broker.publish(b"{}".to_vec()).await;
        let first = broker.receive().await.unwrap().unwrap();

        assert!(broker.reclaim_expired().await.unwrap().is_none());
        broker.expire_locks().await;

        let second = broker.reclaim_expired().await.unwrap().unwrap();
        assert_eq!(second.message_id, id);
        assert!(second.redelivered);
        assert_ne!(second.lock_token, first.lock_token);
        assert_eq!(broker.delivery_count(&id).await, 2);

        // The stale token lost the lock
        assert_eq!(
            broker.complete(&first.lock_token).await.unwrap(),
            Completion::NotLocked
        );
        assert_eq!(
            broker.complete(&second.lock_token).await.unwrap(),
            Completion::Completed
        );
    }

    #[tokio::test]
    async fn test_injected_fault_fails_once() {
        let mut broker = broker();
        broker.inject_faults(1).await;
        assert!(matches!(
            broker.receive().await,
            Err(RelayError::Transport(_))
        ));
        assert!(broker.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let mut consumer = InMemoryBroker::new("outbound", Duration::from_secs(60))
            .with_receive_wait(Duration::from_secs(5));
        let producer = consumer.clone();

        let publish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(b"late".to_vec()).await
        });

        let message = consumer.receive().await.unwrap().unwrap();
        assert_eq!(message.body, b"late".to_vec());
        publish.await.unwrap();
    }
}
