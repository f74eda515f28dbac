//! Session boundary of the routing core.
//!
//! The protocol layer owns connections and packets. It calls into
//! [`SessionManager`] on connect, subscribe, unsubscribe, publish and disconnect,
//! and receives routed messages through the `publish`/`republish` functions it
//! supplied on [`SessionManager::register`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::Broker;
use crate::error::HubError;
use crate::rule::RuleManager;
use crate::topic::{check_pub_topic, check_sub_topic, is_match, sub_topic_validate};
use crate::types::{DashMap, HashMap, Message, PublishFn, QoS, PREFIX_SESSION, PREFIX_TMP_SESSION};
use crate::Result;

pub use self::recorder::{Recorder, StoredMessage, Subscription};

mod recorder;

/// A connected client as seen by the core.
pub struct Session {
    id: String,
    client_id: String,
    clean: bool,
    publish: PublishFn,
    subs: Mutex<HashMap<String, QoS>>,
}

impl Session {
    /// Rule id of this session.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    pub fn clean(&self) -> bool {
        self.clean
    }

    /// Current subscriptions, topic filter to QoS.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let mut subs: Vec<(String, QoS)> = self.subs.lock().iter().map(|(t, q)| (t.clone(), *q)).collect();
        subs.sort();
        subs
    }
}

#[derive(Clone)]
pub struct SessionManager(Arc<SessionManagerInner>);

pub struct SessionManagerInner {
    broker: Broker,
    rules: RuleManager,
    recorder: Recorder,
    sessions: DashMap<String, Arc<Session>>,
}

impl std::ops::Deref for SessionManager {
    type Target = SessionManagerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl SessionManager {
    pub fn new(broker: Broker, rules: RuleManager, recorder: Recorder) -> Self {
        Self(Arc::new(SessionManagerInner { broker, rules, recorder, sessions: DashMap::default() }))
    }

    #[inline]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.get(id).ok_or_else(|| HubError::SessionNotFound(id.into()).into())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registers a connected client and starts its rule.
    ///
    /// Durable sessions are identified by `$session/<client_id>` and resume their
    /// recorded subscriptions. Clean sessions, and clients without an id, get a
    /// `$session/tmp/` id and start from scratch. A session already registered
    /// under the same id is closed first, publishing its will.
    pub async fn register(
        &self,
        client_id: &str,
        clean: bool,
        will: Option<StoredMessage>,
        publish: PublishFn,
        republish: Option<PublishFn>,
    ) -> Result<Arc<Session>> {
        if let Some(will) = will.as_ref() {
            check_pub_topic(&will.topic)?;
        }
        let durable_id = format!("{}{}", PREFIX_SESSION, client_id);
        let (id, clean) = if client_id.is_empty() {
            (format!("{}{}", PREFIX_TMP_SESSION, uuid::Uuid::new_v4()), true)
        } else if clean {
            (format!("{}{}", PREFIX_TMP_SESSION, client_id), true)
        } else {
            (durable_id.clone(), false)
        };

        if self.sessions.contains_key(&id) {
            self.close(&id, true).await;
        }

        self.rules.add_rule_sess(&id, !clean, publish.clone(), republish)?;
        let sess = Arc::new(Session {
            id: id.clone(),
            client_id: client_id.to_owned(),
            clean,
            publish,
            subs: Mutex::new(HashMap::default()),
        });
        self.sessions.insert(id.clone(), sess.clone());

        if let Err(e) = self.resume(&sess, &durable_id, will.as_ref()).await {
            self.close(&id, false).await;
            return Err(e);
        }
        log::info!("session ({}) connected, client id: {:?}, clean: {}", id, client_id, clean);
        Ok(sess)
    }

    async fn resume(&self, sess: &Session, durable_id: &str, will: Option<&StoredMessage>) -> Result<()> {
        if sess.clean {
            if !sess.client_id.is_empty() {
                self.recorder.clear_subs(durable_id)?;
            }
        } else {
            for sub in self.recorder.get_subs(&sess.id)? {
                if !sub_topic_validate(&sub.topic) {
                    log::error!("session ({}) failed to resubscribe topic ({})", sess.id, sub.topic);
                    self.recorder.remove_sub(&sess.id, &sub.topic)?;
                    continue;
                }
                self.rules.add_sink_sub(&sess.id, &sess.id, sub.qos, &sub.topic, sub.qos, "")?;
                sess.subs.lock().insert(sub.topic.clone(), sub.qos);
                log::info!("session ({}) topic ({}) resubscribed", sess.id, sub.topic);
            }
        }
        if let Some(will) = will {
            self.recorder.set_will(&sess.id, will)?;
        }
        self.rules.start_rule(&sess.id).await
    }

    /// Subscribes session `id` to `topic`, then replays matching retained
    /// messages to it. Returns the number of retained messages replayed.
    pub fn subscribe(&self, id: &str, topic: &str, qos: QoS) -> Result<usize> {
        check_sub_topic(topic)?;
        let sess = self.session(id)?;
        let old = sess.subs.lock().get(topic).copied();
        if old != Some(qos) {
            self.rules.add_sink_sub(id, id, qos, topic, qos, "")?;
            sess.subs.lock().insert(topic.to_owned(), qos);
            if !sess.clean {
                self.recorder.add_sub(id, Subscription { topic: topic.to_owned(), qos })?;
            }
            log::info!("session ({}) topic ({}) subscribed", id, topic);
        }
        self.send_retained(&sess, topic, qos)
    }

    fn send_retained(&self, sess: &Session, filter: &str, qos: QoS) -> Result<usize> {
        let mut count = 0;
        for retained in self.recorder.get_retained()? {
            if !is_match(&retained.topic, filter) {
                continue;
            }
            let mut msg = retained.to_message(&sess.client_id);
            msg.target_qos = retained.qos.min(qos);
            msg.target_topic = retained.topic.clone();
            msg.retain = true;
            (sess.publish)(msg);
            count += 1;
        }
        Ok(count)
    }

    pub fn unsubscribe(&self, id: &str, topic: &str) -> Result<()> {
        let sess = self.session(id)?;
        if sess.subs.lock().remove(topic).is_none() {
            log::warn!("session ({}) topic ({}) is not subscribed yet", id, topic);
            return Ok(());
        }
        if let Err(e) = self.rules.remove_sink_sub(id, topic) {
            log::error!("session ({}) failed to remove sink of topic ({}), {:?}", id, topic, e);
        }
        if !sess.clean {
            self.recorder.remove_sub(id, topic)?;
        }
        log::info!("session ({}) topic ({}) unsubscribed", id, topic);
        Ok(())
    }

    /// Publishes `msg` on behalf of session `id`. The publisher's packet id
    /// callback, if any, fires once a QoS1 message is durable.
    pub async fn publish(&self, id: &str, msg: Message) -> Result<()> {
        check_pub_topic(&msg.topic)?;
        let sess = self.session(id)?;
        if msg.client_id != sess.client_id {
            log::debug!("session ({}) publishes for client {:?}", id, msg.client_id);
        }
        if msg.retain {
            self.recorder.set_retained(&StoredMessage::from(&msg))?;
        }
        self.broker.flow(msg).await
    }

    /// Removes session `id` and its rule. With `will` its will message, if any,
    /// is published. The stored will is dropped either way.
    pub async fn close(&self, id: &str, will: bool) {
        let sess = match self.sessions.remove(id) {
            Some((_, sess)) => sess,
            None => return,
        };
        log::info!("session ({}) closing", id);
        if let Err(e) = self.rules.remove_rule(id).await {
            log::debug!("session ({}) failed to remove rule, {:?}", id, e);
        }
        if will {
            self.send_will(&sess).await;
        }
        if let Err(e) = self.recorder.remove_will(id) {
            log::error!("session ({}) failed to remove will message, {:?}", id, e);
        }
        log::info!("session ({}) closed", id);
    }

    async fn send_will(&self, sess: &Session) {
        let will = match self.recorder.get_will(&sess.id) {
            Ok(Some(will)) => will,
            Ok(None) => return,
            Err(e) => {
                log::error!("session ({}) failed to get will message, {:?}", sess.id, e);
                return;
            }
        };
        if will.retain {
            if let Err(e) = self.recorder.set_retained(&will) {
                log::error!("session ({}) failed to retain will message, {:?}", sess.id, e);
            }
        }
        if let Err(e) = self.broker.flow(will.to_message(&sess.client_id)).await {
            log::error!("session ({}) failed to publish will message, {:?}", sess.id, e);
        }
    }

    /// Closes every session without publishing wills.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        log::info!("session manager closing, {} session(s)", ids.len());
        for id in ids {
            self.close(&id, false).await;
        }
        log::info!("session manager closed");
    }
}
