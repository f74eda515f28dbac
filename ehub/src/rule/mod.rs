//! Routing rules.
//!
//! A [`Rule`] binds a [`Sink`] (subscription table plus routing task) to a
//! [`MsgChan`] (forward pipe plus acknowledgement tracking). The three kinds of
//! rule share this engine and differ only in their [`Publisher`], whether their
//! offsets are persisted, and where their sink reads from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::broker::Broker;
use crate::router::Trie;
use crate::settings::Settings;
use crate::types::{PublishFn, QoS, SidCallback};
use crate::Result;

pub use self::manager::RuleManager;
pub use self::msgchan::{MsgChan, Publisher};
pub use self::offset::OffsetTracker;
pub use self::sink::{Sink, SinkSub};

mod manager;
mod msgchan;
mod offset;
mod sink;

/// Point-in-time status of a rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleInfo {
    pub id: String,
    pub persisted_offset: Option<u64>,
    pub committed_offset: Option<u64>,
    pub buffered_offset: u64,
    pub buffered_message_qos0: usize,
    pub buffered_message_qos1: usize,
    pub buffered_message_ack: usize,
}

pub struct Rule {
    id: String,
    broker: Broker,
    sink: Arc<Sink>,
    msgchan: Arc<MsgChan>,
    started: AtomicBool,
}

impl Rule {
    pub fn new(
        id: &str,
        persistent: bool,
        broker: Broker,
        trieq0: Arc<Trie<SinkSub>>,
        publisher: Publisher,
        republish: Option<PublishFn>,
        settings: &Settings,
    ) -> Self {
        let persist = if persistent { Some(Self::persist_callback(id, broker.clone())) } else { None };
        let msgchan = Arc::new(MsgChan::new(id, settings, publisher, republish, persist));
        let sink = Arc::new(Sink::new(id, broker.clone(), trieq0, msgchan.clone()));
        Self { id: id.to_owned(), broker, sink, msgchan, started: AtomicBool::new(false) }
    }

    fn persist_callback(id: &str, broker: Broker) -> SidCallback {
        let id: Arc<str> = Arc::from(id);
        Arc::new(move |sid| {
            let id = id.clone();
            let broker = broker.clone();
            Box::pin(async move {
                if let Err(e) = broker.persist_offset(&id, sid).await {
                    log::error!("rule ({}) failed to persist offset {}, {:?}", id, sid, e);
                }
            })
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    /// Starts the channel and then the sink. Only the first call has any effect.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.msgchan.start() {
            self.msgchan.close(true).await;
            return Err(e);
        }
        if let Err(e) = self.sink.start().await {
            self.stop();
            self.wait(true).await;
            return Err(e);
        }
        log::debug!("rule ({}) started", self.id);
        Ok(())
    }

    #[inline]
    pub fn stop(&self) {
        log::debug!("rule ({}) closing", self.id);
        self.sink.stop();
    }

    /// Waits for the sink to stop, then closes the channel.
    pub async fn wait(&self, force: bool) {
        self.sink.wait().await;
        self.msgchan.close(force).await;
        log::debug!("rule ({}) closed", self.id);
    }

    pub fn register(&self, id: &str, qos: QoS, topic: &str, target_qos: QoS, target_topic: &str) {
        self.sink.register(SinkSub::new(id, qos, topic, target_qos, target_topic, self.msgchan.clone()));
    }

    #[inline]
    pub fn remove(&self, id: &str, topic: &str) {
        self.sink.remove(id, topic);
    }

    pub fn info(&self) -> RuleInfo {
        let persisted_offset = match self.broker.offset_persisted(&self.id) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("rule ({}) failed to read persisted offset, {:?}", self.id, e);
                None
            }
        };
        RuleInfo {
            id: self.id.clone(),
            persisted_offset,
            committed_offset: self.msgchan.committed_offset(),
            buffered_offset: self.sink.offset(),
            buffered_message_qos0: self.msgchan.msgq0_len(),
            buffered_message_qos1: self.msgchan.msgq1_len(),
            buffered_message_ack: self.msgchan.msgack_len(),
        }
    }
}
