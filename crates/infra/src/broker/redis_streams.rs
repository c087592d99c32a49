//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! Queue semantics are mapped onto stream primitives:
//! - **Queue**: one stream key per queue name
//! - **Subscription**: a consumer group (`ConsumerGroup=` in the connection
//!   string, `pullbridge` by default), created with `MKSTREAM` on demand
//! - **Receiver**: a named consumer within the group
//! - **Complete**: `XACK`
//! - **Abandon**: the entry stays pending and is re-claimed with `XCLAIM` on
//!   the next receive, which bumps its delivery count
//! - **Receive-and-delete**: `XREADGROUP ... NOACK`
//!
//! Entries left pending by a dead consumer are claimed once they have been
//! idle for longer than the pending timeout.
//!
//! ## Entry fields
//!
//! - `body` (required): payload bytes
//! - `message_id`: defaults to the stream entry id
//! - `session_id`
//! - `scheduled_enqueue_time`: RFC 3339
//!
//! The `redis` crate is synchronous here; every command runs on the blocking
//! pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use tracing::{debug, instrument, warn};

use pullbridge_core::{ConfigError, ConfigResult, QueueName, RawDelivery};
use pullbridge_ingest::{
    BrokerClient, BrokerError, DeliveryReceiver, LockToken, ReceiveMode, ReceivedMessage,
    ReceiverOptions,
};

use crate::connection::ConnectionConfig;

/// Default pending entry timeout (entries idle longer than this are re-claimed)
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    namespace: String,
    group: String,
    pending_timeout_ms: u64,
    closed: Arc<AtomicBool>,
}

impl RedisStreamsBroker {
    /// Create a broker client from a `redis://` / `rediss://` connection string.
    ///
    /// No connection is made until a receiver is created.
    pub fn connect(connection: &ConnectionConfig) -> ConfigResult<Self> {
        let client = redis::Client::open(connection.endpoint())
            .map_err(|e| ConfigError::invalid_connection_string(e.to_string()))?;

        let pending_timeout_ms = match connection.property("PendingTimeoutMs") {
            Some(v) => v.parse::<u64>().map_err(|e| {
                ConfigError::invalid_value("PendingTimeoutMs", format!("'{v}': {e}"))
            })?,
            None => DEFAULT_PENDING_TIMEOUT_MS,
        };

        Ok(Self {
            client: Arc::new(client),
            namespace: connection.namespace().to_string(),
            group: connection.consumer_group().to_string(),
            pending_timeout_ms,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn consumer_group(&self) -> &str {
        &self.group
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

#[async_trait]
impl BrokerClient for RedisStreamsBroker {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    #[instrument(skip(self, options), fields(namespace = %self.namespace, group = %self.group), err)]
    async fn create_receiver(
        &self,
        queue: &QueueName,
        options: &ReceiverOptions,
    ) -> Result<Arc<dyn DeliveryReceiver>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let cursor = StreamCursor {
            client: self.client.clone(),
            stream: queue.as_str().to_string(),
            group: self.group.clone(),
            consumer: format!("pullbridge-{}", options.receiver_id),
            pending_timeout_ms: self.pending_timeout_ms,
        };

        let c = cursor.clone();
        blocking(move || c.ensure_consumer_group()).await?;
        debug!(stream = %cursor.stream, consumer = %cursor.consumer, "consumer group ready");

        Ok(Arc::new(RedisStreamsReceiver {
            cursor,
            mode: options.receive_mode,
            locks: Mutex::new(LockTable::default()),
            closed: AtomicBool::new(false),
            broker_closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Run a synchronous Redis operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, BrokerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Command(format!("redis task failed: {e}")))?
}

fn map_redis_error(op: &str, e: redis::RedisError) -> BrokerError {
    let message = format!("{op} failed: {e}");
    if e.is_timeout() {
        BrokerError::Timeout(message)
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::Connection(message)
    } else if e.kind() == redis::ErrorKind::AuthenticationFailed {
        BrokerError::Unauthorized(message)
    } else if e.code() == Some("NOGROUP") {
        BrokerError::EntityNotFound(message)
    } else {
        BrokerError::Command(message)
    }
}

/// Stream entry as read from Redis, before conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    fn text(&self, field: &str) -> Result<Option<String>, String> {
        match self.fields.get(field) {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes.clone())
                .map(Some)
                .map_err(|_| format!("field '{field}' is not UTF-8")),
        }
    }

    fn into_delivery(self, delivery_count: u32) -> Result<RawDelivery, String> {
        let message_id = self.text("message_id")?.unwrap_or_else(|| self.id.clone());
        let session_id = self.text("session_id")?;
        let scheduled = match self.text("scheduled_enqueue_time")? {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| format!("invalid scheduled_enqueue_time '{s}': {e}"))?,
            ),
            None => None,
        };
        let body = self
            .fields
            .get("body")
            .cloned()
            .ok_or_else(|| "missing body field".to_string())?;

        let mut raw = RawDelivery::new(message_id, body).with_delivery_count(delivery_count);
        if let Some(session_id) = session_id {
            raw = raw.with_session_id(session_id);
        }
        if let Some(at) = scheduled {
            raw = raw.with_scheduled_enqueue_time(at);
        }
        Ok(raw)
    }
}

/// Parse one entry: `[id, [field1, value1, field2, value2, ...]]`.
fn parse_stream_entry(entry: &redis::Value) -> Result<StreamEntry, String> {
    let parts = match entry {
        redis::Value::Bulk(v) if v.len() >= 2 => v,
        _ => return Err("invalid entry format".to_string()),
    };

    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        redis::Value::Status(s) => s.clone(),
        _ => return Err("invalid entry id".to_string()),
    };

    let raw_fields = match &parts[1] {
        redis::Value::Bulk(v) => v,
        _ => return Err(format!("entry {id}: invalid fields format")),
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(String::from_utf8_lossy(key).to_string(), value.clone());
        }
    }

    Ok(StreamEntry { id, fields })
}

/// Entries of the single stream in an `XREADGROUP` reply (`nil` on timeout).
fn parse_read_reply(reply: redis::Value) -> Result<Vec<redis::Value>, BrokerError> {
    match reply {
        redis::Value::Nil => Ok(Vec::new()),
        redis::Value::Bulk(streams) => {
            for stream in streams {
                if let redis::Value::Bulk(mut pair) = stream {
                    if pair.len() == 2 {
                        return match pair.pop() {
                            Some(redis::Value::Bulk(entries)) => Ok(entries),
                            _ => Ok(Vec::new()),
                        };
                    }
                }
            }
            Ok(Vec::new())
        }
        other => Err(BrokerError::Command(format!(
            "unexpected XREADGROUP reply: {other:?}"
        ))),
    }
}

/// Everything a blocking Redis call needs; cheap to clone into the closure.
#[derive(Debug, Clone)]
struct StreamCursor {
    client: Arc<redis::Client>,
    stream: String,
    group: String,
    consumer: String,
    pending_timeout_ms: u64,
}

impl StreamCursor {
    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| map_redis_error("connect", e))
    }

    /// Ensure the consumer group exists (idempotent).
    fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;

        // "0" delivers entries already in the stream to a new group.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error("XGROUP CREATE", e)),
        }
    }

    /// Read entries never delivered to this group.
    fn read_new(
        &self,
        count: usize,
        block_ms: u64,
        noack: bool,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.connection()?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms.max(1));
        if noack {
            cmd.arg("NOACK");
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(">");

        let reply: redis::Value = cmd
            .query(&mut conn)
            .map_err(|e| map_redis_error("XREADGROUP", e))?;

        Ok(self.parse_entries(parse_read_reply(reply)?))
    }

    /// Claim specific pending entries for this consumer regardless of idle time.
    fn claim(&self, ids: &[String]) -> Result<Vec<StreamEntry>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        self.claim_with(&mut conn, ids, 0)
    }

    /// Claim entries other consumers left idle past the pending timeout.
    ///
    /// Returns each entry with the delivery count it will carry.
    fn reclaim_stale(&self, count: usize) -> Result<Vec<(StreamEntry, u32)>, BrokerError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.pending_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XPENDING", e))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let counts: HashMap<String, u64> = pending
            .iter()
            .map(|(id, _, _, delivered)| (id.clone(), *delivered))
            .collect();
        let ids: Vec<String> = pending.into_iter().map(|(id, _, _, _)| id).collect();

        let claimed = self.claim_with(&mut conn, &ids, self.pending_timeout_ms)?;
        Ok(claimed
            .into_iter()
            .map(|entry| {
                let delivered = counts.get(&entry.id).copied().unwrap_or(0);
                let count = u32::try_from(delivered + 1).unwrap_or(u32::MAX);
                (entry, count)
            })
            .collect())
    }

    fn claim_with(
        &self,
        conn: &mut redis::Connection,
        ids: &[String],
        min_idle_ms: u64,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(ids)
            .query(conn)
            .map_err(|e| map_redis_error("XCLAIM", e))?;

        Ok(self.parse_entries(claimed))
    }

    fn acknowledge(&self, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(ids)
            .query(&mut conn)
            .map_err(|e| map_redis_error("XACK", e))
    }

    fn parse_entries(&self, values: Vec<redis::Value>) -> Vec<StreamEntry> {
        values
            .iter()
            // Deleted entries come back as nil from XCLAIM.
            .filter(|v| !matches!(v, redis::Value::Nil))
            .filter_map(|v| match parse_stream_entry(v) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "skipping unreadable stream entry");
                    None
                }
            })
            .collect()
    }
}

/// Delivery counts of entries this receiver holds, and abandoned entries
/// awaiting redelivery.
#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<String, u32>,
    abandoned: VecDeque<(String, u32)>,
}

#[derive(Debug)]
struct RedisStreamsReceiver {
    cursor: StreamCursor,
    mode: ReceiveMode,
    locks: Mutex<LockTable>,
    closed: AtomicBool,
    broker_closed: Arc<AtomicBool>,
}

impl RedisStreamsReceiver {
    fn locks(&self) -> MutexGuard<'_, LockTable> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) || self.broker_closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    /// Convert entries, dropping (and acknowledging) the malformed ones.
    async fn to_messages(
        &self,
        entries: Vec<(StreamEntry, u32)>,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let mut out = Vec::with_capacity(entries.len());
        let mut malformed = Vec::new();

        for (entry, count) in entries {
            let id = entry.id.clone();
            match entry.into_delivery(count) {
                Ok(raw) => {
                    let lock_token = match self.mode {
                        ReceiveMode::PeekLock => {
                            self.locks().held.insert(id.clone(), count);
                            Some(LockToken::new(id))
                        }
                        ReceiveMode::ReceiveAndDelete => None,
                    };
                    out.push(ReceivedMessage { raw, lock_token });
                }
                Err(e) => {
                    warn!(stream = %self.cursor.stream, entry_id = %id, error = %e, "dropping malformed stream entry");
                    malformed.push(id);
                }
            }
        }

        if self.mode == ReceiveMode::PeekLock && !malformed.is_empty() {
            let cursor = self.cursor.clone();
            blocking(move || cursor.acknowledge(&malformed)).await?;
        }
        Ok(out)
    }
}

#[async_trait]
impl DeliveryReceiver for RedisStreamsReceiver {
    fn entity_path(&self) -> &str {
        &self.cursor.stream
    }

    fn receive_mode(&self) -> ReceiveMode {
        self.mode
    }

    #[instrument(skip(self), fields(stream = %self.cursor.stream, consumer = %self.cursor.consumer), err)]
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.ensure_open()?;
        let max_messages = max_messages.max(1);
        let block_ms = max_wait.as_millis() as u64;

        if self.mode == ReceiveMode::ReceiveAndDelete {
            let cursor = self.cursor.clone();
            let entries = blocking(move || cursor.read_new(max_messages, block_ms, true)).await?;
            return self
                .to_messages(entries.into_iter().map(|e| (e, 1)).collect())
                .await;
        }

        let redeliver: Vec<(String, u32)> = {
            let mut locks = self.locks();
            let n = max_messages.min(locks.abandoned.len());
            locks.abandoned.drain(..n).collect()
        };
        let redeliver_counts: HashMap<String, u32> = redeliver.iter().cloned().collect();
        let remaining = max_messages - redeliver.len();

        let cursor = self.cursor.clone();
        let entries = blocking(move || {
            let ids: Vec<String> = redeliver.into_iter().map(|(id, _)| id).collect();
            let mut entries: Vec<(StreamEntry, u32)> = cursor
                .claim(&ids)?
                .into_iter()
                .map(|e| {
                    let count = redeliver_counts.get(&e.id).copied().unwrap_or(1);
                    (e, count.saturating_add(1))
                })
                .collect();

            entries.extend(cursor.reclaim_stale(remaining)?);

            if entries.is_empty() {
                entries = cursor
                    .read_new(max_messages, block_ms, false)?
                    .into_iter()
                    .map(|e| (e, 1))
                    .collect();
            }
            Ok(entries)
        })
        .await?;

        self.to_messages(entries).await
    }

    #[instrument(skip(self), fields(stream = %self.cursor.stream), err)]
    async fn complete(&self, token: &LockToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let id = token.as_str().to_string();

        let cursor = self.cursor.clone();
        let acked = {
            let ids = vec![id.clone()];
            blocking(move || cursor.acknowledge(&ids)).await?
        };
        self.locks().held.remove(&id);

        if acked == 0 {
            return Err(BrokerError::LockLost(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %self.cursor.stream), err)]
    async fn abandon(&self, token: &LockToken) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut locks = self.locks();
        let count = locks
            .held
            .remove(token.as_str())
            .ok_or_else(|| BrokerError::LockLost(token.to_string()))?;
        locks.abandoned.push_back((token.as_str().to_string(), count));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        let locks = self.locks();
        if !locks.held.is_empty() || !locks.abandoned.is_empty() {
            debug!(
                stream = %self.cursor.stream,
                held = locks.held.len(),
                abandoned = locks.abandoned.len(),
                "receiver closed with pending entries; they will be re-claimed after the pending timeout"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use redis::Value;

    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let flat = fields
            .iter()
            .flat_map(|(k, v)| [data(k), data(v)])
            .collect();
        Value::Bulk(vec![data(id), Value::Bulk(flat)])
    }

    #[test]
    fn parses_entry_into_delivery() {
        let parsed = parse_stream_entry(&entry(
            "1700000000000-0",
            &[
                ("body", "hello"),
                ("session_id", "s1"),
                ("scheduled_enqueue_time", "2024-03-01T12:00:00+02:00"),
            ],
        ))
        .unwrap();
        assert_eq!(parsed.id, "1700000000000-0");

        let raw = parsed.into_delivery(1).unwrap();
        assert_eq!(raw.message_id(), "1700000000000-0");
        assert_eq!(raw.body(), b"hello");
        assert_eq!(raw.session_id(), Some("s1"));
        assert_eq!(
            raw.scheduled_enqueue_time().unwrap().to_rfc3339(),
            "2024-03-01T12:00:00+02:00"
        );
        assert_eq!(raw.delivery_count(), 1);
    }

    #[test]
    fn explicit_message_id_wins() {
        let raw = parse_stream_entry(&entry("1-0", &[("body", "x"), ("message_id", "order-7")]))
            .unwrap()
            .into_delivery(3)
            .unwrap();
        assert_eq!(raw.message_id(), "order-7");
        assert_eq!(raw.delivery_count(), 3);
        assert_eq!(raw.session_id(), None);
    }

    #[test]
    fn missing_body_is_malformed() {
        let parsed = parse_stream_entry(&entry("1-0", &[("session_id", "s1")])).unwrap();
        assert!(parsed.into_delivery(1).is_err());
    }

    #[test]
    fn bad_schedule_is_malformed() {
        let parsed =
            parse_stream_entry(&entry("1-0", &[("body", "x"), ("scheduled_enqueue_time", "soon")]))
                .unwrap();
        assert!(parsed.into_delivery(1).is_err());
    }

    #[test]
    fn rejects_non_entries() {
        assert!(parse_stream_entry(&Value::Nil).is_err());
        assert!(parse_stream_entry(&Value::Bulk(vec![data("1-0")])).is_err());
    }

    #[test]
    fn read_reply_shapes() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());

        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("myqueue"),
            Value::Bulk(vec![entry("1-0", &[("body", "a")]), entry("2-0", &[("body", "b")])]),
        ])]);
        assert_eq!(parse_read_reply(reply).unwrap().len(), 2);

        assert!(parse_read_reply(Value::Int(1)).is_err());
    }

    #[test]
    fn error_classification() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(map_redis_error("XREADGROUP", io), BrokerError::Connection(_)));

        let timeout =
            redis::RedisError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(map_redis_error("XREADGROUP", timeout), BrokerError::Timeout(_)));

        let auth = redis::RedisError::from((redis::ErrorKind::AuthenticationFailed, "denied"));
        assert!(matches!(map_redis_error("connect", auth), BrokerError::Unauthorized(_)));
    }

    #[test]
    fn connect_reads_group_and_timeout() {
        let connection = ConnectionConfig::parse(
            "Endpoint=redis://localhost:6379;ConsumerGroup=bridge;PendingTimeoutMs=5000",
        )
        .unwrap();
        let broker = RedisStreamsBroker::connect(&connection).unwrap();
        assert_eq!(broker.namespace(), "localhost");
        assert_eq!(broker.consumer_group(), "bridge");
        assert_eq!(broker.pending_timeout_ms, 5000);
    }
}
