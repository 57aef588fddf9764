//! Redis Streams broker binding.
//!
//! A consumer group provides the leased delivery the relay relies on:
//! - `XREADGROUP ... >` delivers a new entry and records it in the group's
//!   pending entries list (PEL). The entry is locked to this consumer.
//! - `XAUTOCLAIM` takes over entries idle longer than the lock timeout, which
//!   is how unacknowledged messages get redelivered. Each call scans a bounded
//!   slice of the PEL, so the scan resumes from the cursor the previous call
//!   returned and wraps to `0-0` once Redis reports the end.
//! - `XACK` + `XDEL` completes an entry and removes it from the stream.
//!
//! The lock token is the stream entry id. Producers add entries with a
//! `payload` field and optionally a `message_id` field:
//!
//! ```text
//! XADD <queue> * message_id <id> payload <bytes>
//! ```
//!
//! Requires Redis 7 or newer for the `XAUTOCLAIM` reply shape.

use std::time::Duration;

use redis::Value;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};

use relay_common::config::RelayConfig;
use relay_common::error::RelayError;
use relay_common::redis_pool::redact_endpoint;
use relay_common::types::{LockToken, Message};

use super::{Broker, Completion};

/// Stream field carrying the raw message body.
pub const PAYLOAD_FIELD: &str = "payload";

/// Optional stream field carrying a producer-assigned message id.
pub const MESSAGE_ID_FIELD: &str = "message_id";

/// `XAUTOCLAIM` cursor for the start of the pending entries list.
const PEL_START: &str = "0-0";

/// Broker backed by a Redis stream and consumer group.
pub struct RedisBroker {
    conn: ConnectionManager,
    endpoint: String,
    stream: String,
    group: String,
    consumer: String,
    lock_timeout: Duration,
    receive_wait: Duration,
    claim_cursor: String,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, config: &RelayConfig) -> Self {
        Self {
            conn,
            endpoint: redact_endpoint(&config.redis_url),
            stream: config.source_queue.clone(),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            lock_timeout: config.lock_timeout,
            receive_wait: config.receive_wait,
            claim_cursor: PEL_START.to_string(),
        }
    }
}

/// Split an `XAUTOCLAIM` reply into the next cursor and the claimed entry.
///
/// Reply: `[next-cursor, [[id, [field, value, ...]], ...], [deleted-id, ...]]`.
fn parse_autoclaim(reply: Value) -> Result<(String, Option<StreamId>), RelayError> {
    let Value::Array(items) = reply else {
        return Err(RelayError::Transport(
            "unexpected XAUTOCLAIM reply shape".to_string(),
        ));
    };

    let mut items = items.into_iter();
    let cursor: String = match items.next() {
        Some(cursor) => redis::from_owned_redis_value(cursor)?,
        None => PEL_START.to_string(),
    };
    let claimed = match items.next() {
        Some(entries) => redis::from_owned_redis_value::<StreamRangeReply>(entries)?
            .ids
            .into_iter()
            .next(),
        None => None,
    };

    Ok((cursor, claimed))
}

/// Convert a stream entry into a relay message.
fn message_from_entry(stream: &str, entry: StreamId, redelivered: bool) -> Message {
    let body: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_else(|| {
        tracing::warn!(
            entry_id = %entry.id,
            stream,
            "Stream entry has no payload field, relaying an empty body"
        );
        Vec::new()
    });
    let message_id: String = entry
        .get(MESSAGE_ID_FIELD)
        .unwrap_or_else(|| entry.id.clone());

    Message {
        message_id,
        lock_token: LockToken::new(entry.id),
        body,
        redelivered,
    }
}

impl Broker for RedisBroker {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn entity_path(&self) -> &str {
        &self.stream
    }

    async fn subscribe(&mut self) -> Result<(), RelayError> {
        // Start at 0 so entries published before the group existed are consumed.
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    stream = %self.stream,
                    group = %self.group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn reclaim_expired(&mut self) -> Result<Option<Message>, RelayError> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.lock_timeout.as_millis() as u64)
            .arg(&self.claim_cursor)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await?;

        let (cursor, claimed) = parse_autoclaim(reply)?;
        self.claim_cursor = cursor;

        Ok(claimed.map(|entry| message_from_entry(&self.stream, entry, true)))
    }

    async fn receive(&mut self) -> Result<Option<Message>, RelayError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.receive_wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next())
            .map(|entry| message_from_entry(&self.stream, entry, false)))
    }

    async fn complete(&mut self, lock_token: &LockToken) -> Result<Completion, RelayError> {
        let acked: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(lock_token.as_str())
            .query_async(&mut self.conn)
            .await?;

        if acked == 0 {
            return Ok(Completion::NotLocked);
        }

        let _: i64 = redis::cmd("XDEL")
            .arg(&self.stream)
            .arg(lock_token.as_str())
            .query_async(&mut self.conn)
            .await?;

        Ok(Completion::Completed)
    }

    async fn close(self) -> Result<(), RelayError> {
        // The consumer is left registered: deleting it would drop its pending
        // entries from the PEL and they would never be redelivered.
        tracing::debug!(
            stream = %self.stream,
            consumer = %self.consumer,
            "Releasing Redis connection"
        );
        drop(self.conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::BulkString(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn autoclaim_reply(cursor: &str, entries: &[(&str, &str)]) -> Value {
        let entries = entries
            .iter()
            .map(|(id, payload)| {
                Value::Array(vec![
                    bulk(id),
                    Value::Array(vec![bulk(PAYLOAD_FIELD), bulk(payload)]),
                ])
            })
            .collect();
        Value::Array(vec![bulk(cursor), Value::Array(entries), Value::Array(vec![])])
    }

    #[test]
    fn test_autoclaim_returns_cursor_and_claimed_entry() {
        let reply = autoclaim_reply("1700000000000-7", &[("1700000000000-3", "{}")]);
        let (cursor, claimed) = parse_autoclaim(reply).unwrap();

        assert_eq!(cursor, "1700000000000-7");
        let entry = claimed.unwrap();
        assert_eq!(entry.id, "1700000000000-3");
        let body: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap();
        assert_eq!(body, b"{}".to_vec());
    }

    #[test]
    fn test_autoclaim_keeps_scanning_past_live_entries() {
        // Redis stopped mid-PEL without finding an expired entry
        let (cursor, claimed) = parse_autoclaim(autoclaim_reply("1700000000000-9", &[])).unwrap();
        assert_eq!(cursor, "1700000000000-9");
        assert!(claimed.is_none());
    }

    #[test]
    fn test_autoclaim_wraps_to_start_at_end_of_pel() {
        let (cursor, claimed) = parse_autoclaim(autoclaim_reply(PEL_START, &[])).unwrap();
        assert_eq!(cursor, PEL_START);
        assert!(claimed.is_none());
    }

    #[test]
    fn test_autoclaim_rejects_unexpected_reply() {
        let err = parse_autoclaim(Value::Nil).unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[test]
    fn test_message_from_entry_uses_producer_message_id() {
        let e = entry(
            "1700000000000-0",
            &[
                (PAYLOAD_FIELD, r#"{"resource_id":"abc123"}"#),
                (MESSAGE_ID_FIELD, "m-1"),
            ],
        );
        let message = message_from_entry("outbound", e, false);
        assert_eq!(message.message_id, "m-1");
        assert_eq!(message.lock_token.as_str(), "1700000000000-0");
        assert_eq!(message.body, br#"{"resource_id":"abc123"}"#.to_vec());
        assert!(!message.redelivered);
    }

    #[test]
    fn test_message_from_entry_falls_back_to_entry_id() {
        let e = entry("1700000000000-1", &[(PAYLOAD_FIELD, "{}")]);
        let message = message_from_entry("outbound", e, true);
        assert_eq!(message.message_id, "1700000000000-1");
        assert!(message.redelivered);
    }

    #[test]
    fn test_message_from_entry_without_payload() {
        let e = entry("1700000000000-2", &[(MESSAGE_ID_FIELD, "m-2")]);
        let message = message_from_entry("outbound", e, false);
        assert!(message.body.is_empty());
    }
}
