//! Redis-backed [`DelayedQueue`].
//!
//! Two stages, like a TTL queue dead-lettering into a work queue:
//!
//! ```text
//! publish ──ZADD──► {prefix}:waiting (zset, score = due ms)
//!                        │  promote script, when score <= now
//!                        ▼
//!                   {prefix}:ready (list)
//!                        │  LMOVE
//!                        ▼
//!                   {prefix}:processing:{consumer} (list)
//!                        ├─ ack ──────────► LREM
//!                        ├─ nack(true) ───► back to waiting, now + redelivery delay
//!                        └─ nack(false) ──► {prefix}:dead
//! ```
//!
//! Each consumer has its own processing list, so `recover` only moves back
//! messages this consumer abandoned.

use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{Acknowledger, DelayedQueue, Delivery, Envelope};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::redis_client::RedisClient;

// Переносим созревшие сообщения из zset в список готовых одним атомарным шагом
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('RPUSH', KEYS[2], member)
end
return #due
"#;

const RECOVER_SCRIPT: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT') do
    moved = moved + 1
end
return moved
"#;

const PROMOTE_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueKeys {
    pub waiting: String,
    pub ready: String,
    pub processing: String,
    pub dead: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, consumer: &str) -> Self {
        Self {
            waiting: format!("{prefix}:waiting"),
            ready: format!("{prefix}:ready"),
            processing: format!("{prefix}:processing:{consumer}"),
            dead: format!("{prefix}:dead"),
        }
    }
}

fn due_score(delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(delay_ms)
}

#[derive(Clone)]
pub struct RedisDelayedQueue {
    conn: ConnectionManager,
    keys: Arc<QueueKeys>,
    redelivery_delay: Duration,
    promote: Arc<Script>,
    recover: Arc<Script>,
}

impl RedisDelayedQueue {
    pub fn new(redis: &RedisClient, config: &QueueConfig) -> Self {
        Self {
            conn: redis.conn.clone(),
            keys: Arc::new(QueueKeys::new(&config.prefix, &config.consumer)),
            redelivery_delay: config.redelivery_delay(),
            promote: Arc::new(Script::new(PROMOTE_SCRIPT)),
            recover: Arc::new(Script::new(RECOVER_SCRIPT)),
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn promote_due(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let promoted: usize = self
            .promote
            .key(&self.keys.waiting)
            .key(&self.keys.ready)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "Promoted due messages to ready list");
        }
        Ok(promoted)
    }

    async fn dead_letter_raw(&self, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .lrem(&self.keys.processing, 1, raw)
            .ignore()
            .rpush(&self.keys.dead, raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DelayedQueue for RedisDelayedQueue {
    async fn publish(&self, payload: &str, delay: Duration) -> Result<()> {
        let raw = serde_json::to_string(&Envelope::new(payload))?;
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("ZADD")
            .arg(&self.keys.waiting)
            .arg(due_score(delay))
            .arg(&raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>> {
        self.promote_due().await?;

        let mut conn = self.conn.clone();
        let mut batch = Vec::new();
        while batch.len() < max {
            let raw: Option<String> = ::redis::cmd("LMOVE")
                .arg(&self.keys.ready)
                .arg(&self.keys.processing)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else {
                break;
            };

            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    let acker = Arc::new(RedisAcker {
                        conn: self.conn.clone(),
                        keys: self.keys.clone(),
                        raw,
                        redelivery_delay: self.redelivery_delay,
                    });
                    batch.push(Delivery::new(envelope, acker));
                }
                Err(e) => {
                    // Конверт не читается: повторная доставка не поможет
                    error!(error = %e, "Dropping unreadable envelope to dead-letter list");
                    self.dead_letter_raw(&raw).await?;
                }
            }
        }
        Ok(batch)
    }

    async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .recover
            .key(&self.keys.processing)
            .key(&self.keys.ready)
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            info!(moved, consumer_list = %self.keys.processing, "Recovered unacknowledged messages");
        }
        Ok(moved)
    }
}

/// Settles one delivery. Keeps the exact raw member so `LREM` matches it.
struct RedisAcker {
    conn: ConnectionManager,
    keys: Arc<QueueKeys>,
    raw: String,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, _envelope: &Envelope) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(&self.raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, envelope: &Envelope, requeue: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = ::redis::pipe();
        pipe.atomic().lrem(&self.keys.processing, 1, &self.raw).ignore();

        if requeue {
            let again = serde_json::to_string(&envelope.redelivered())?;
            pipe.zadd(&self.keys.waiting, again, due_score(self.redelivery_delay))
                .ignore();
        } else {
            pipe.rpush(&self.keys.dead, &self.raw).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
