use std::collections::BTreeMap;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ehub_storage::StorageDB;

use crate::types::{Message, QoS, BUCKET_RETAINED, BUCKET_SUBSCRIPTION, BUCKET_WILL};
use crate::Result;

/// A subscription as recorded for a durable session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// A retained or will message as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    #[serde(default)]
    pub retain: bool,
}

impl StoredMessage {
    #[inline]
    pub fn to_message(&self, client_id: &str) -> Message {
        let mut msg = Message::new(self.qos, self.topic.as_str(), self.payload.clone(), client_id);
        msg.retain = self.retain;
        msg
    }
}

impl From<&Message> for StoredMessage {
    fn from(msg: &Message) -> Self {
        Self { topic: msg.topic.clone(), qos: msg.qos, payload: msg.payload.clone(), retain: msg.retain }
    }
}

/// Session metadata kept in the session store.
pub struct Recorder {
    db: StorageDB,
    lock: Mutex<()>,
}

impl Recorder {
    pub fn new(db: StorageDB) -> Self {
        Self { db, lock: Mutex::new(()) }
    }

    fn subs(&self, id: &str) -> Result<BTreeMap<String, Subscription>> {
        match self.db.bucket_get(BUCKET_SUBSCRIPTION, id.as_bytes())? {
            Some(v) => {
                serde_json::from_slice(&v).map_err(|e| anyhow!("failed to unmarshal subscriptions of {}, {}", id, e))
            }
            None => Ok(BTreeMap::new()),
        }
    }

    fn put_subs(&self, id: &str, subs: &BTreeMap<String, Subscription>) -> Result<()> {
        if subs.is_empty() {
            return self.db.bucket_delete(BUCKET_SUBSCRIPTION, id.as_bytes());
        }
        let v = serde_json::to_vec(subs)?;
        self.db.bucket_put(BUCKET_SUBSCRIPTION, id.as_bytes(), &v)
    }

    pub fn add_sub(&self, id: &str, sub: Subscription) -> Result<()> {
        let _guard = self.lock.lock();
        let mut subs = self.subs(id)?;
        log::debug!("subscription persisted: qos={}, topic={}, id={}", sub.qos.value(), sub.topic, id);
        subs.insert(sub.topic.clone(), sub);
        self.put_subs(id, &subs)
    }

    pub fn remove_sub(&self, id: &str, topic: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut subs = self.subs(id)?;
        if subs.remove(topic).is_some() {
            self.put_subs(id, &subs)?;
            log::debug!("subscription removed: topic={}, id={}", topic, id);
        }
        Ok(())
    }

    pub fn get_subs(&self, id: &str) -> Result<Vec<Subscription>> {
        let _guard = self.lock.lock();
        Ok(self.subs(id)?.into_values().collect())
    }

    pub fn clear_subs(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        self.db.bucket_delete(BUCKET_SUBSCRIPTION, id.as_bytes())
    }

    /// Stores `msg` as the retained message of its topic. An empty payload
    /// clears it instead.
    pub fn set_retained(&self, msg: &StoredMessage) -> Result<()> {
        if msg.payload.is_empty() {
            return self.remove_retained(&msg.topic);
        }
        let v = serde_json::to_vec(msg)?;
        self.db.bucket_put(BUCKET_RETAINED, msg.topic.as_bytes(), &v)?;
        log::debug!("retained message persisted: topic={}", msg.topic);
        Ok(())
    }

    pub fn remove_retained(&self, topic: &str) -> Result<()> {
        self.db.bucket_delete(BUCKET_RETAINED, topic.as_bytes())?;
        log::debug!("retained message removed: topic={}", topic);
        Ok(())
    }

    /// Every retained message. Entries that fail to decode are skipped.
    pub fn get_retained(&self) -> Result<Vec<StoredMessage>> {
        let mut msgs = Vec::new();
        for (topic, v) in self.db.bucket_list(BUCKET_RETAINED)? {
            match serde_json::from_slice::<StoredMessage>(&v) {
                Ok(msg) => msgs.push(msg),
                Err(e) => log::warn!("failed to unmarshal retained message of {}, {}", topic, e),
            }
        }
        Ok(msgs)
    }

    pub fn set_will(&self, id: &str, msg: &StoredMessage) -> Result<()> {
        let v = serde_json::to_vec(msg)?;
        self.db.bucket_put(BUCKET_WILL, id.as_bytes(), &v)?;
        log::debug!("will message persisted: topic={}, id={}", msg.topic, id);
        Ok(())
    }

    pub fn get_will(&self, id: &str) -> Result<Option<StoredMessage>> {
        match self.db.bucket_get(BUCKET_WILL, id.as_bytes())? {
            Some(v) if !v.is_empty() => Ok(Some(
                serde_json::from_slice(&v).map_err(|e| anyhow!("failed to unmarshal will message of {}, {}", id, e))?,
            )),
            _ => Ok(None),
        }
    }

    pub fn remove_will(&self, id: &str) -> Result<()> {
        self.db.bucket_delete(BUCKET_WILL, id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (tempfile::TempDir, Recorder) {
        let dir = tempfile::tempdir().unwrap();
        let db = StorageDB::open(dir.path().join("session.db")).unwrap();
        (dir, Recorder::new(db))
    }

    fn stored(topic: &str, payload: &'static str) -> StoredMessage {
        StoredMessage {
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            payload: Bytes::from_static(payload.as_bytes()),
            retain: true,
        }
    }

    #[test]
    fn subscriptions() {
        let (_dir, r) = recorder();
        assert!(r.get_subs("a").unwrap().is_empty());
        r.add_sub("a", Subscription { topic: "t/1".into(), qos: QoS::AtMostOnce }).unwrap();
        r.add_sub("a", Subscription { topic: "t/2".into(), qos: QoS::AtLeastOnce }).unwrap();
        r.add_sub("a", Subscription { topic: "t/1".into(), qos: QoS::AtLeastOnce }).unwrap();
        r.add_sub("b", Subscription { topic: "t/#".into(), qos: QoS::AtMostOnce }).unwrap();

        let subs = r.get_subs("a").unwrap();
        assert_eq!(
            subs,
            vec![
                Subscription { topic: "t/1".into(), qos: QoS::AtLeastOnce },
                Subscription { topic: "t/2".into(), qos: QoS::AtLeastOnce },
            ]
        );

        r.remove_sub("a", "t/1").unwrap();
        r.remove_sub("a", "t/unknown").unwrap();
        assert_eq!(r.get_subs("a").unwrap().len(), 1);
        r.clear_subs("a").unwrap();
        assert!(r.get_subs("a").unwrap().is_empty());
        assert_eq!(r.get_subs("b").unwrap().len(), 1);
    }

    #[test]
    fn retained() {
        let (_dir, r) = recorder();
        r.set_retained(&stored("a", "1")).unwrap();
        r.set_retained(&stored("b", "2")).unwrap();
        r.set_retained(&stored("a", "3")).unwrap();
        let mut msgs = r.get_retained().unwrap();
        msgs.sort_by(|x, y| x.topic.cmp(&y.topic));
        assert_eq!(msgs, vec![stored("a", "3"), stored("b", "2")]);

        r.set_retained(&stored("a", "")).unwrap();
        assert_eq!(r.get_retained().unwrap(), vec![stored("b", "2")]);
    }

    #[test]
    fn will() {
        let (_dir, r) = recorder();
        assert_eq!(r.get_will("c").unwrap(), None);
        r.set_will("c", &stored("w", "bye")).unwrap();
        let will = r.get_will("c").unwrap().unwrap();
        assert_eq!(will.payload, Bytes::from_static(b"bye"));
        let msg = will.to_message("client");
        assert_eq!(msg.topic, "w");
        assert_eq!(msg.client_id, "client");
        assert!(msg.retain);
        r.remove_will("c").unwrap();
        assert_eq!(r.get_will("c").unwrap(), None);
    }
}
