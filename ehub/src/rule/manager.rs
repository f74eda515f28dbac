use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::time::{interval_at, Instant};

use ehub_utils::Tomb;

use crate::broker::Broker;
use crate::error::HubError;
use crate::router::Trie;
use crate::types::{DashMap, PublishFn, QoS, RULE_MSGQOS0, RULE_TOPIC};
use crate::Result;

use super::{Publisher, Rule, RuleInfo, SinkSub};

const INITIAL: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

/// Registry of every rule.
///
/// Lifecycle is `initial -> started -> closed`; repeated `start` or `close`
/// calls are no-ops. Closing an unstarted manager goes straight to `closed`.
#[derive(Clone)]
pub struct RuleManager(Arc<ManagerInner>);

pub struct ManagerInner {
    status: AtomicU8,
    broker: Broker,
    trieq0: Arc<Trie<SinkSub>>,
    rules: DashMap<String, Arc<Rule>>,
    tomb: Tomb,
}

impl std::ops::Deref for RuleManager {
    type Target = ManagerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl RuleManager {
    /// Creates the built-in rules and registers the configured subscriptions on
    /// the topic rule.
    pub fn new(broker: Broker) -> Result<Self> {
        let settings = broker.settings().clone();
        let trieq0 = Arc::new(Trie::new());
        let rules = DashMap::default();
        rules.insert(
            RULE_MSGQOS0.to_owned(),
            Arc::new(Rule::new(RULE_MSGQOS0, false, broker.clone(), trieq0.clone(), Publisher::Nop, None, &settings)),
        );
        rules.insert(
            RULE_TOPIC.to_owned(),
            Arc::new(Rule::new(
                RULE_TOPIC,
                true,
                broker.clone(),
                trieq0.clone(),
                Publisher::Forward(broker.clone()),
                None,
                &settings,
            )),
        );
        let m = RuleManager(Arc::new(ManagerInner {
            status: AtomicU8::new(INITIAL),
            broker,
            trieq0,
            rules,
            tomb: Tomb::new(),
        }));
        for sub in settings.subscriptions.iter() {
            m.add_sink_sub(
                RULE_TOPIC,
                &sub.target.topic,
                QoS::try_from(sub.source.qos)?,
                &sub.source.topic,
                QoS::try_from(sub.target.qos)?,
                &sub.target.topic,
            )?;
        }
        if settings.status.logging.enable {
            m.tomb.go(m.clone().logging())?;
        }
        Ok(m)
    }

    #[inline]
    fn status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status() == CLOSED
    }

    #[inline]
    fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.get(id).map(|r| r.value().clone())
    }

    #[inline]
    fn all(&self) -> Vec<Arc<Rule>> {
        self.rules.iter().map(|r| r.value().clone()).collect()
    }

    /// Starts every registered rule. A rule failing to start is logged and skipped.
    pub async fn start(&self) {
        if self.status.compare_exchange(INITIAL, STARTED, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        for r in self.all() {
            if let Err(e) = r.start().await {
                log::info!("failed to start rule ({}), {:?}", r.id(), e);
            }
        }
    }

    /// Stops all rules, lets them finish in-flight deliveries and waits for the
    /// broker to commit every pending offset.
    pub async fn close(&self) {
        let prev = self.status.swap(CLOSED, Ordering::SeqCst);
        if prev == CLOSED {
            return;
        }
        log::info!("rule manager closing, started: {}", prev == STARTED);
        self.tomb.kill();
        let rules = self.all();
        for r in rules.iter() {
            r.stop();
        }
        futures::future::join_all(rules.iter().map(|r| r.wait(false))).await;
        self.broker.wait_offset_persisted().await;
        if let Err(e) = self.tomb.wait().await {
            log::debug!("rule manager tasks stopped, {:?}", e);
        }
        log::info!("rule manager closed, remaining offsets: {}", self.broker.offset_pending());
    }

    /// Adds the rule of a session. Start it with [`RuleManager::start_rule`].
    pub fn add_rule_sess(
        &self,
        id: &str,
        persistent: bool,
        publish: PublishFn,
        republish: Option<PublishFn>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::RuleManagerClosed.into());
        }
        match self.rules.entry(id.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(HubError::RuleExists(id.into()).into()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let settings = self.broker.settings().clone();
                e.insert(Arc::new(Rule::new(
                    id,
                    persistent,
                    self.broker.clone(),
                    self.trieq0.clone(),
                    Publisher::Callback(publish),
                    republish,
                    &settings,
                )));
                Ok(())
            }
        }
    }

    /// Starts one rule. Does nothing before the manager itself has started,
    /// [`RuleManager::start`] picks the rule up then.
    pub async fn start_rule(&self, id: &str) -> Result<()> {
        match self.status() {
            CLOSED => return Err(HubError::RuleManagerClosed.into()),
            INITIAL => return Ok(()),
            _ => {}
        }
        let r = self.get(id).ok_or_else(|| HubError::RuleNotFound(id.into()))?;
        r.start().await
    }

    /// Removes a rule, abandoning its unacknowledged deliveries.
    pub async fn remove_rule(&self, id: &str) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::RuleManagerClosed.into());
        }
        if let Some((_, r)) = self.rules.remove(id) {
            r.stop();
            r.wait(true).await;
        }
        Ok(())
    }

    pub fn add_sink_sub(
        &self,
        rule_id: &str,
        sub_id: &str,
        sub_qos: QoS,
        sub_topic: &str,
        pub_qos: QoS,
        pub_topic: &str,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::RuleManagerClosed.into());
        }
        let r = self.get(rule_id).ok_or_else(|| HubError::RuleNotFound(rule_id.into()))?;
        r.register(sub_id, sub_qos, sub_topic, pub_qos, pub_topic);
        Ok(())
    }

    pub fn remove_sink_sub(&self, id: &str, topic: &str) -> Result<()> {
        if self.is_closed() {
            return Err(HubError::RuleManagerClosed.into());
        }
        let r = self.get(id).ok_or_else(|| HubError::RuleNotFound(id.into()))?;
        r.remove(id, topic);
        Ok(())
    }

    #[inline]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Topic filters registered on the sink of rule `id`.
    pub fn topics(&self, id: &str) -> Result<Vec<String>> {
        let r = self.get(id).ok_or_else(|| HubError::RuleNotFound(id.into()))?;
        Ok(r.sink().topics())
    }

    pub fn info(&self) -> Vec<RuleInfo> {
        let mut infos: Vec<RuleInfo> = self.all().iter().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    async fn logging(self) -> Result<()> {
        let period = self.broker.settings().status.logging.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                _ = ticker.tick() => {
                    log::info!("rule status, rule count: {}", self.rule_count());
                    for info in self.info() {
                        match serde_json::to_string(&info) {
                            Ok(s) => log::info!("  {}", s),
                            Err(e) => log::warn!("failed to serialize rule status, {:?}", e),
                        }
                    }
                }
            }
        }
        log::debug!("rule status logging task stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use ehub_storage::StorageFactory;

    use crate::settings::{Inner, Settings, Subscription, SubscriptionPoint};
    use crate::types::Message;

    use super::*;

    fn settings(subs: Vec<(&str, u8, &str, u8)>) -> Settings {
        let mut inner = Inner::default();
        inner.shutdown.timeout = Duration::from_secs(3);
        inner.message.egress.qos1.retry.interval = Duration::from_millis(200);
        inner.subscriptions = subs
            .into_iter()
            .map(|(src, sq, dst, dq)| Subscription {
                source: SubscriptionPoint { topic: src.into(), qos: sq },
                target: SubscriptionPoint { topic: dst.into(), qos: dq },
            })
            .collect();
        Settings::from_inner(inner)
    }

    fn sender(tx: mpsc::UnboundedSender<Message>) -> PublishFn {
        Arc::new(move |msg| {
            let _ = tx.send(msg);
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    fn publish(qos: QoS, topic: &str, payload: &'static str) -> Message {
        Message::new(qos, topic, Bytes::from_static(payload.as_bytes()), "pub")
    }

    async fn wait_offset(broker: &Broker, id: &str, v: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.offset_persisted(id).unwrap() != Some(v) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let broker = Broker::new(settings(vec![]), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();
        assert_eq!(m.rule_count(), 2);
        assert!(m.contains(RULE_MSGQOS0));
        assert!(m.contains(RULE_TOPIC));

        let (tx, _rx) = mpsc::unbounded_channel();
        m.add_rule_sess("$session/a", false, sender(tx.clone()), None).unwrap();
        let e = m.add_rule_sess("$session/a", false, sender(tx.clone()), None).unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleExists("$session/a".into())));

        // not started yet, so starting a rule is a no-op even if it is unknown
        m.start_rule("$session/unknown").await.unwrap();
        m.start().await;
        m.start().await;
        let e = m.start_rule("$session/unknown").await.unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleNotFound("$session/unknown".into())));
        m.start_rule("$session/a").await.unwrap();

        let e = m.add_sink_sub("$session/none", "x", QoS::AtMostOnce, "t", QoS::AtMostOnce, "").unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleNotFound("$session/none".into())));
        assert!(m.remove_sink_sub("$session/none", "t").is_err());

        m.remove_rule("$session/a").await.unwrap();
        m.remove_rule("$session/a").await.unwrap();
        assert_eq!(m.rule_count(), 2);

        m.close().await;
        m.close().await;
        assert!(m.is_closed());
        let e = m.add_rule_sess("$session/b", false, sender(tx), None).unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleManagerClosed));
        assert!(m.start_rule(RULE_TOPIC).await.is_err());
        assert!(m.remove_rule(RULE_TOPIC).await.is_err());
        assert!(m.add_sink_sub(RULE_TOPIC, "x", QoS::AtMostOnce, "t", QoS::AtMostOnce, "").is_err());
        broker.close().await;
    }

    #[tokio::test]
    async fn close_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let mut inner = Inner::default();
        inner.status.logging.enable = true;
        let broker = Broker::new(Settings::from_inner(inner), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), m.close()).await.unwrap();
        assert!(m.is_closed());
        assert!(!m.tomb.alive());
        m.start().await;
        assert!(m.is_closed());

        let (tx, _rx) = mpsc::unbounded_channel();
        let e = m.add_rule_sess("$session/a", false, sender(tx), None).unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleManagerClosed));
        let e = m.add_sink_sub(RULE_TOPIC, "x", QoS::AtMostOnce, "t", QoS::AtMostOnce, "").unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::RuleManagerClosed));
        broker.close().await;
    }

    #[tokio::test]
    async fn forward_qos0_through_topic_rule() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let broker = Broker::new(settings(vec![("head", 0, "next", 0)]), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_rule_sess("$session/sub", false, sender(tx), None).unwrap();
        m.add_sink_sub("$session/sub", "$session/sub", QoS::AtMostOnce, "next", QoS::AtMostOnce, "").unwrap();
        m.start().await;

        broker.flow(publish(QoS::AtMostOnce, "head", "pld:3")).await.unwrap();
        let msg = recv(&mut rx).await;
        assert_eq!(msg.topic, "next");
        assert_eq!(msg.qos, QoS::AtMostOnce);
        assert_eq!(msg.payload, Bytes::from_static(b"pld:3"));
        assert_eq!(msg.sequence_id, 0);

        m.close().await;
        broker.close().await;
    }

    #[tokio::test]
    async fn qos1_delivery_commits_offset() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let broker = Broker::new(settings(vec![]), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();
        m.start().await;

        let sid = "$session/durable";
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_rule_sess(sid, true, sender(tx), None).unwrap();
        m.add_sink_sub(sid, sid, QoS::AtLeastOnce, "a/+", QoS::AtLeastOnce, "").unwrap();
        m.start_rule(sid).await.unwrap();
        assert_eq!(m.topics(sid).unwrap(), vec!["a/+".to_string()]);

        for p in ["1", "2", "3"] {
            broker.flow(publish(QoS::AtLeastOnce, "a/b", p)).await.unwrap();
        }
        broker.flow(publish(QoS::AtLeastOnce, "ignored", "4")).await.unwrap();
        let mut last = 0;
        for p in ["1", "2", "3"] {
            let msg = recv(&mut rx).await;
            assert_eq!(msg.payload, Bytes::from(p));
            assert_eq!(msg.qos, QoS::AtLeastOnce);
            assert_eq!(msg.target_qos, QoS::AtLeastOnce);
            assert_eq!(msg.target_topic, "a/b");
            msg.ack();
            last = msg.sequence_id;
        }
        assert_eq!(last, 3);

        // the unmatched tail is committed through a barrier
        wait_offset(&broker, sid, 4).await;

        let info = m.info();
        assert_eq!(info.len(), 3);
        let durable = info.iter().find(|i| i.id == sid).unwrap();
        assert_eq!(durable.buffered_offset, 5);

        m.close().await;
        broker.close().await;
    }

    #[tokio::test]
    async fn replay_unacked_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let sid = "$session/replay";
        let factory = StorageFactory::new(dir.path()).unwrap();
        {
            let broker = Broker::new(settings(vec![]), &factory).unwrap();
            let m = RuleManager::new(broker.clone()).unwrap();
            m.start().await;
            let (tx, mut rx) = mpsc::unbounded_channel();
            m.add_rule_sess(sid, true, sender(tx), None).unwrap();
            m.add_sink_sub(sid, sid, QoS::AtLeastOnce, "t", QoS::AtLeastOnce, "").unwrap();
            m.start_rule(sid).await.unwrap();
            for p in ["1", "2", "3"] {
                broker.flow(publish(QoS::AtLeastOnce, "t", p)).await.unwrap();
            }
            let first = recv(&mut rx).await;
            first.ack();
            for _ in 0..2 {
                recv(&mut rx).await;
            }
            wait_offset(&broker, sid, 1).await;
            m.remove_rule(sid).await.unwrap();
            broker.wait_offset_persisted().await;
            assert_eq!(broker.offset_persisted(sid).unwrap(), Some(1));
            m.close().await;
            broker.close().await;
        }

        // a new broker on the same stores resumes after the committed offset
        let broker = Broker::new(settings(vec![]), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();
        m.start().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_rule_sess(sid, true, sender(tx), None).unwrap();
        m.add_sink_sub(sid, sid, QoS::AtLeastOnce, "t", QoS::AtLeastOnce, "").unwrap();
        m.start_rule(sid).await.unwrap();
        let again: Vec<Message> = vec![recv(&mut rx).await, recv(&mut rx).await];
        assert_eq!(again.iter().map(|m| m.sequence_id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(again[0].payload, Bytes::from_static(b"2"));
        for msg in again.iter() {
            msg.ack();
        }
        wait_offset(&broker, sid, 3).await;
        m.close().await;
        broker.close().await;
    }

    #[tokio::test]
    async fn unacked_delivery_survives_qos0_lane_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let sid = "$session/mixed";
        let factory = StorageFactory::new(dir.path()).unwrap();
        let small = || {
            let mut inner = Inner::default();
            inner.shutdown.timeout = Duration::from_secs(3);
            inner.message.egress.qos0.buffer.size = 1;
            Settings::from_inner(inner)
        };
        let subscribe = |m: &RuleManager| {
            m.add_sink_sub(sid, sid, QoS::AtLeastOnce, "a", QoS::AtLeastOnce, "").unwrap();
            m.add_sink_sub(sid, sid, QoS::AtMostOnce, "b", QoS::AtMostOnce, "").unwrap();
        };
        {
            let broker = Broker::new(small(), &factory).unwrap();
            let m = RuleManager::new(broker.clone()).unwrap();
            m.start().await;
            let (tx, mut rx) = mpsc::unbounded_channel();
            m.add_rule_sess(sid, true, sender(tx), None).unwrap();
            subscribe(&m);
            m.start_rule(sid).await.unwrap();

            broker.flow(publish(QoS::AtLeastOnce, "a", "keep")).await.unwrap();
            let first = recv(&mut rx).await;
            assert_eq!(first.sequence_id, 1);
            // QoS1 log messages demoted to the QoS0 lane, some of them discarded
            for p in ["1", "2", "3", "4", "5"] {
                broker.flow(publish(QoS::AtLeastOnce, "b", p)).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            broker.wait_offset_persisted().await;
            assert_eq!(broker.offset_persisted(sid).unwrap(), Some(0));

            m.remove_rule(sid).await.unwrap();
            m.close().await;
            assert_eq!(broker.offset_persisted(sid).unwrap(), Some(0));
            broker.close().await;
        }

        let broker = Broker::new(small(), &factory).unwrap();
        let m = RuleManager::new(broker.clone()).unwrap();
        m.start().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        m.add_rule_sess(sid, true, sender(tx), None).unwrap();
        subscribe(&m);
        m.start_rule(sid).await.unwrap();
        let again = loop {
            let msg = recv(&mut rx).await;
            if msg.topic == "a" {
                break msg;
            }
        };
        assert_eq!(again.sequence_id, 1);
        assert_eq!(again.payload, Bytes::from_static(b"keep"));
        again.ack();
        wait_offset(&broker, sid, 6).await;
        m.close().await;
        broker.close().await;
    }
}
