use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use ehub_utils::Tomb;

use crate::broker::Broker;
use crate::router::{SinkSubscription, Trie};
use crate::types::{Message, QoS, RULE_MSGQOS0};
use crate::Result;

use super::msgchan::MsgChan;

const FETCH_IDLE: Duration = Duration::from_millis(10);
const FETCH_RETRY: Duration = Duration::from_secs(1);

/// One subscription of a sink, stored in the routing tries.
pub struct SinkSub {
    id: String,
    qos: QoS,
    topic: String,
    target_qos: QoS,
    target_topic: String,
    channel: Arc<MsgChan>,
}

impl SinkSub {
    pub fn new(
        id: &str,
        qos: QoS,
        topic: &str,
        target_qos: QoS,
        target_topic: &str,
        channel: Arc<MsgChan>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            qos,
            topic: topic.to_owned(),
            target_qos,
            target_topic: target_topic.to_owned(),
            channel,
        }
    }

    /// Routes `msg` into the owning rule's channel. The lane is QoS1 only when
    /// both the message and this subscription are QoS1.
    pub async fn flow(&self, mut msg: Message) {
        msg.target_topic = if self.target_topic.is_empty() { msg.topic.clone() } else { self.target_topic.clone() };
        if msg.qos == QoS::AtMostOnce || self.qos == QoS::AtMostOnce {
            msg.target_qos = QoS::AtMostOnce;
            self.channel.put_q0(msg).await;
        } else {
            msg.target_qos = self.target_qos;
            self.channel.put_q1(msg).await;
        }
    }
}

impl SinkSubscription for SinkSub {
    #[inline]
    fn id(&self) -> &str {
        &self.id
    }
    #[inline]
    fn topic(&self) -> &str {
        &self.topic
    }
    #[inline]
    fn qos(&self) -> QoS {
        self.qos
    }
    #[inline]
    fn target_qos(&self) -> QoS {
        self.target_qos
    }
    #[inline]
    fn target_topic(&self) -> &str {
        &self.target_topic
    }
}

/// Subscription table of a rule and the task feeding it.
///
/// QoS0 ingress is fanned out by the `$rule/msgqos0` sink through the trie shared
/// by all rules. Every other sink replays the QoS1 log through its own trie,
/// starting at its initial offset.
pub struct Sink {
    id: String,
    offset: AtomicU64,
    broker: Broker,
    msgchan: Arc<MsgChan>,
    trieq0: Arc<Trie<SinkSub>>,
    trieq1: Trie<SinkSub>,
    tomb: Tomb,
}

impl Sink {
    pub fn new(id: &str, broker: Broker, trieq0: Arc<Trie<SinkSub>>, msgchan: Arc<MsgChan>) -> Self {
        Self {
            id: id.to_owned(),
            offset: AtomicU64::new(0),
            broker,
            msgchan,
            trieq0,
            trieq1: Trie::new(),
            tomb: Tomb::new(),
        }
    }

    /// Next sequence id to fetch.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_offset(&self, v: u64) {
        self.offset.store(v, Ordering::SeqCst)
    }

    #[inline]
    pub fn msgchan(&self) -> &Arc<MsgChan> {
        &self.msgchan
    }

    pub fn register(&self, sub: SinkSub) {
        let sub = Arc::new(sub);
        self.trieq0.add(sub.clone());
        self.trieq1.add(sub);
    }

    pub fn remove(&self, id: &str, topic: &str) {
        self.trieq0.remove(id, topic);
        self.trieq1.remove(id, topic);
    }

    /// Topic filters currently registered on this sink.
    pub fn topics(&self) -> Vec<String> {
        self.trieq1.values().iter().map(|s| s.topic().to_owned()).collect()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.id == RULE_MSGQOS0 {
            return self.tomb.go(self.clone().routing_q0());
        }
        let offset = self.broker.init_offset(&self.id, self.msgchan.persistent()).await?;
        self.set_offset(offset);
        self.msgchan.reset_offset(offset);
        self.tomb.go(self.clone().routing_q1())
    }

    /// Withdraws this sink from the shared trie and stops routing.
    pub fn stop(&self) {
        log::debug!("sink ({}) stopping", self.id);
        for sub in self.trieq1.values() {
            self.trieq0.remove(sub.id(), sub.topic());
        }
        self.tomb.kill();
    }

    pub async fn wait(&self) {
        match self.tomb.wait().await {
            Ok(()) => log::debug!("sink ({}) stopped", self.id),
            Err(e) => log::debug!("sink ({}) stopped, {:?}", self.id, e),
        }
    }

    async fn routing_q0(self: Arc<Self>) -> Result<()> {
        log::debug!("sink ({}) task of routing messages (Q0) begins", self.id);
        let mut rx = tokio::select! {
            rx = self.broker.msgq0_chan().lock() => rx,
            _ = self.tomb.dying() => return Ok(()),
        };
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        for sub in self.trieq0.match_unique(&msg.topic).into_values() {
                            sub.flow(msg.clone()).await;
                        }
                    }
                    None => break,
                },
            }
        }
        log::debug!("sink ({}) task of routing messages (Q0) stopped", self.id);
        Ok(())
    }

    async fn routing_q1(self: Arc<Self>) -> Result<()> {
        log::debug!("sink ({}) task of routing messages (Q1) begins with offset={}", self.id, self.offset());
        let batch = self.broker.settings().message.egress.qos1.batch.max;
        let mut ticker = interval(FETCH_IDLE);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.tomb.alive() {
            let msgs = match self.broker.fetch_q1(self.offset(), batch) {
                Ok(msgs) => msgs,
                Err(e) => {
                    log::error!("sink ({}) failed to fetch messages, {:?}", self.id, e);
                    tokio::select! {
                        _ = self.tomb.dying() => break,
                        _ = tokio::time::sleep(FETCH_RETRY) => continue,
                    }
                }
            };
            let last_sid = match msgs.last() {
                Some(msg) => msg.sequence_id,
                None => {
                    tokio::select! {
                        _ = self.tomb.dying() => break,
                        _ = ticker.tick() => continue,
                    }
                }
            };
            log::debug!("sink ({}) {} message(s) fetched", self.id, msgs.len());
            for mut msg in msgs {
                let matches = self.trieq1.match_unique(&msg.topic);
                if matches.is_empty() {
                    // the last message still has to reach the ack queue so the offset gets committed
                    if msg.sequence_id == last_sid {
                        msg.barrier = true;
                        self.msgchan.track(msg.sequence_id, 1);
                        self.msgchan.put_q0(msg).await;
                    }
                    continue;
                }
                self.msgchan.track(msg.sequence_id, matches.len());
                for sub in matches.into_values() {
                    sub.flow(msg.clone()).await;
                }
            }
            self.set_offset(last_sid + 1);
        }
        log::debug!("sink ({}) task of routing messages (Q1) stopped", self.id);
        Ok(())
    }
}
