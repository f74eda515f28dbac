use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ehub_utils::{bytes_to_u64, Tomb};

use crate::Result;

pub use ehub_storage::{BUCKET_RETAINED, BUCKET_SUBSCRIPTION, BUCKET_WILL};

/// Rule fanning QoS0 ingress out to every sink
pub const RULE_MSGQOS0: &str = "$rule/msgqos0";
/// Rule forwarding configured subscriptions back into the broker
pub const RULE_TOPIC: &str = "$rule/topic";
/// Rule id prefix of a durable session
pub const PREFIX_SESSION: &str = "$session/";
/// Rule id prefix of a clean session
pub const PREFIX_TMP_SESSION: &str = "$session/tmp/";

pub const DB_MSGQOS1: &str = "msgqos1.db";
pub const DB_OFFSET: &str = "offset.db";
pub const DB_SESSION: &str = "session.db";

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Hands a message to the downstream consumer. Must not block.
pub type PublishFn = Arc<dyn Fn(Message) + Send + Sync>;
/// Called with the publisher's packet id once the message is durable.
pub type PidCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Called with the sequence id once the offset may advance past it.
pub type SidCallback = Arc<dyn Fn(u64) -> BoxFuture<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = anyhow::Error;

    #[inline]
    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(anyhow!("unsupported qos: {}", v)),
        }
    }
}

/// Reference counted completion signal.
///
/// Starts at the given count and releases `done` exactly once, when the count
/// reaches zero. Acks past zero change nothing.
pub struct Acknowledge {
    count: AtomicI64,
    done: CancellationToken,
}

impl Default for Acknowledge {
    fn default() -> Self {
        Self::with_count(1)
    }
}

impl Acknowledge {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_count(count: i64) -> Self {
        let done = CancellationToken::new();
        if count <= 0 {
            done.cancel();
        }
        Self { count: AtomicI64::new(count), done }
    }

    #[inline]
    pub fn ack(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.cancel();
        }
    }

    #[inline]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    #[inline]
    pub async fn done(&self) {
        self.done.cancelled().await
    }
}

/// An application message in flight.
///
/// `qos`, `topic`, `payload` and `client_id` are what gets persisted; the rest is
/// routing state owned by whichever rule currently holds the message.
#[derive(Clone, Default)]
pub struct Message {
    pub qos: QoS,
    pub topic: String,
    pub payload: Bytes,
    pub client_id: String,

    pub target_qos: QoS,
    pub target_topic: String,
    pub retain: bool,
    pub barrier: bool,
    pub packet_id: u32,
    pub sequence_id: u64,

    callback_pid: Option<PidCallback>,
    callback_sid: Option<SidCallback>,
    acknowledge: Option<Arc<Acknowledge>>,
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    qos: QoS,
    topic: &'a str,
    payload: &'a Bytes,
    client_id: &'a str,
}

#[derive(Deserialize)]
struct Persisted {
    qos: QoS,
    topic: String,
    payload: Bytes,
    client_id: String,
}

impl Message {
    #[inline]
    pub fn new<T: Into<String>, C: Into<String>>(qos: QoS, topic: T, payload: Bytes, client_id: C) -> Self {
        Self { qos, topic: topic.into(), payload, client_id: client_id.into(), ..Default::default() }
    }

    /// Serializes the persisted part of the message.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let p = PersistedRef {
            qos: self.qos,
            topic: &self.topic,
            payload: &self.payload,
            client_id: &self.client_id,
        };
        Ok(bincode::serialize(&p)?)
    }

    /// Rebuilds a message from a log entry; the sequence id is the first 8 key bytes.
    pub fn decode(key: &[u8], value: &[u8]) -> Result<Self> {
        let p: Persisted = bincode::deserialize(value)?;
        let mut msg = Message::new(p.qos, p.topic, p.payload, p.client_id);
        msg.sequence_id = bytes_to_u64(key);
        Ok(msg)
    }

    #[inline]
    pub fn set_callback_pid(&mut self, pid: u32, callback: PidCallback) {
        self.packet_id = pid;
        self.callback_pid = Some(callback);
    }

    #[inline]
    pub fn callback_pid(&self) {
        if let Some(cb) = self.callback_pid.as_ref() {
            cb(self.packet_id)
        }
    }

    #[inline]
    pub fn set_callback_sid(&mut self, callback: Option<SidCallback>) {
        self.callback_sid = callback;
    }

    #[inline]
    pub fn has_callback_sid(&self) -> bool {
        self.callback_sid.is_some()
    }

    #[inline]
    pub async fn callback_sid(&self) {
        if let Some(cb) = self.callback_sid.as_ref() {
            cb(self.sequence_id).await
        }
    }

    #[inline]
    pub fn set_acknowledge(&mut self) {
        self.acknowledge = Some(Arc::new(Acknowledge::new()));
    }

    #[inline]
    pub fn acknowledge(&self) -> Option<Arc<Acknowledge>> {
        self.acknowledge.clone()
    }

    /// Acknowledges delivery to the downstream consumer.
    #[inline]
    pub fn ack(&self) {
        if let Some(ack) = self.acknowledge.as_ref() {
            ack.ack()
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ qos: {}, topic: {:?}, payload: {}B, client_id: {:?}, target: ({}, {:?}), sid: {}, pid: {}, barrier: {}, retain: {} }}",
            self.qos.value(),
            self.topic,
            self.payload.len(),
            self.client_id,
            self.target_qos.value(),
            self.target_topic,
            self.sequence_id,
            self.packet_id,
            self.barrier,
            self.retain
        )
    }
}

/// A delivered message waiting for its acknowledgement.
#[derive(Debug)]
pub struct MsgAck {
    pub msg: Message,
    pub first_sent: Instant,
}

impl MsgAck {
    #[inline]
    pub fn new(msg: Message) -> Self {
        Self { msg, first_sent: Instant::now() }
    }

    /// Waits until the message is acknowledged, republishing with exponential
    /// backoff meanwhile, then fires the sequence id callback. Returns early,
    /// without the callback, once `cancel` is dying.
    pub async fn wait(self, retry_max: Duration, republish: Option<&PublishFn>, cancel: &Tomb) {
        let ack = match self.msg.acknowledge() {
            None => {
                self.msg.callback_sid().await;
                return;
            }
            Some(ack) => ack,
        };
        let mut backoff = republish_backoff(retry_max);
        loop {
            let delay = backoff.next_backoff().unwrap_or(retry_max);
            tokio::select! {
                biased;
                _ = ack.done() => {
                    self.msg.callback_sid().await;
                    return;
                }
                _ = cancel.dying() => return,
                _ = tokio::time::sleep(delay) => {
                    if let Some(republish) = republish {
                        log::debug!(
                            "republish message, sid: {}, waited: {:?}",
                            self.msg.sequence_id,
                            self.first_sent.elapsed()
                        );
                        republish(self.msg.clone());
                    }
                }
            }
        }
    }
}

/// Backoff between republishes: starts at 100ms, doubles, capped at `max`.
pub fn republish_backoff(max: Duration) -> ExponentialBackoff {
    let initial = Duration::from_millis(100);
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial.min(max))
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(max)
        .with_max_elapsed_time(None)
        .build()
}
