//! Ingress side of the hub.
//!
//! QoS0 messages are queued for the `$rule/msgqos0` fan-out. QoS1 messages are
//! appended to the durable log in batches and acknowledged to their publisher once
//! the batch has committed. Rules replay the log with [`Broker::fetch_q1`] and commit
//! their progress through [`Broker::persist_offset`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use ehub_storage::{StorageDB, StorageFactory};
use ehub_utils::{bytes_to_u64, u64_to_bytes, Tomb};

use crate::error::HubError;
use crate::settings::Settings;
use crate::types::{Message, QoS, DB_MSGQOS1, DB_OFFSET};
use crate::Result;

mod background;

/// A sink offset waiting to be committed.
#[derive(Debug, Clone)]
pub struct Offset {
    pub id: String,
    pub value: u64,
}

#[derive(Clone)]
pub struct Broker(Arc<BrokerInner>);

pub struct BrokerInner {
    settings: Settings,
    msgq0_tx: mpsc::Sender<Message>,
    msgq0_rx: Mutex<mpsc::Receiver<Message>>,
    msgq1_tx: mpsc::Sender<Message>,
    offset_tx: mpsc::Sender<Offset>,
    offset_pending: AtomicUsize,
    msgq1_db: StorageDB,
    offset_db: StorageDB,
    tomb: Tomb,
}

impl std::ops::Deref for Broker {
    type Target = BrokerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Broker {
    /// Opens the message and offset logs and starts the background tasks.
    /// Must be called within a tokio runtime.
    pub fn new(settings: Settings, factory: &StorageFactory) -> Result<Self> {
        let msgq1_db = factory.new_db(DB_MSGQOS1)?;
        let offset_db = factory.new_db(DB_OFFSET)?;
        let m = &settings.message;
        let (msgq0_tx, msgq0_rx) = mpsc::channel(m.ingress.qos0.buffer.size);
        let (msgq1_tx, msgq1_rx) = mpsc::channel(m.ingress.qos1.buffer.size);
        let (offset_tx, offset_rx) = mpsc::channel(m.offset.buffer.size);
        let status_logging = settings.status.logging.enable;
        let b = Broker(Arc::new(BrokerInner {
            settings,
            msgq0_tx,
            msgq0_rx: Mutex::new(msgq0_rx),
            msgq1_tx,
            offset_tx,
            offset_pending: AtomicUsize::new(0),
            msgq1_db,
            offset_db,
            tomb: Tomb::new(),
        }));
        b.tomb.go(b.clone().persisting_msg_qos1(msgq1_rx))?;
        b.tomb.go(b.clone().persisting_offset(offset_rx))?;
        b.tomb.go(b.clone().cleaning_msg_qos1())?;
        if status_logging {
            b.tomb.go(b.clone().logging())?;
        }
        Ok(b)
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Receiving end of the QoS0 ingress queue.
    #[inline]
    pub fn msgq0_chan(&self) -> &Mutex<mpsc::Receiver<Message>> {
        &self.msgq0_rx
    }

    /// Queues a message for routing. Waits for room in the matching queue, or
    /// fails with [`HubError::BrokerClosed`] as soon as the broker is closing.
    pub async fn flow(&self, msg: Message) -> Result<()> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        log::debug!("flow message: {:?}", msg);
        let (tx, qos) = if msg.qos == QoS::AtLeastOnce {
            (&self.msgq1_tx, QoS::AtLeastOnce)
        } else {
            (&self.msgq0_tx, QoS::AtMostOnce)
        };
        let pid = msg.packet_id;
        tokio::select! {
            biased;
            _ = self.tomb.dying() => {
                log::debug!("flow message (qos={}, pid={}) failed since broker closed", qos.value(), pid);
                Err(HubError::BrokerClosed.into())
            }
            res = tx.send(msg) => {
                if res.is_err() {
                    log::debug!("flow message (qos={}, pid={}) failed since queue closed", qos.value(), pid);
                    return Err(HubError::BrokerClosed.into());
                }
                Ok(())
            }
        }
    }

    /// Reads up to `batch_size` QoS1 messages with sequence id `offset` or later.
    pub fn fetch_q1(&self, offset: u64, batch_size: usize) -> Result<Vec<Message>> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        self.msgq1_db
            .batch_fetch(&u64_to_bytes(offset), batch_size)?
            .into_iter()
            .map(|kv| Message::decode(&kv.key, &kv.value))
            .collect()
    }

    /// Reads the committed offset of sink `id`.
    pub fn offset_persisted(&self, id: &str) -> Result<Option<u64>> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        Ok(self.offset_db.get(id.as_bytes())?.map(|v| bytes_to_u64(&v)))
    }

    /// Queues an offset commit for sink `id`.
    pub async fn persist_offset(&self, id: &str, value: u64) -> Result<()> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        self.offset_pending.fetch_add(1, Ordering::SeqCst);
        let offset = Offset { id: id.to_owned(), value };
        let sent = tokio::select! {
            res = self.offset_tx.send(offset) => res.is_ok(),
            _ = self.tomb.dying() => false,
        };
        if !sent {
            self.offset_pending.fetch_sub(1, Ordering::SeqCst);
            return Err(HubError::BrokerClosed.into());
        }
        Ok(())
    }

    /// Waits until every queued offset has been committed, giving up after the
    /// shutdown timeout.
    pub async fn wait_offset_persisted(&self) {
        let timeout = self.settings.shutdown.timeout;
        let wait = async {
            while self.offset_pending.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            log::warn!(
                "timed out waiting for offsets to be persisted, remaining: {}",
                self.offset_pending.load(Ordering::SeqCst)
            );
        }
    }

    /// Number of offsets queued but not yet committed.
    #[inline]
    pub fn offset_pending(&self) -> usize {
        self.offset_pending.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn offset_chan_len(&self) -> usize {
        self.offset_tx.max_capacity() - self.offset_tx.capacity()
    }

    #[inline]
    pub fn msgq0_chan_len(&self) -> usize {
        self.msgq0_tx.max_capacity() - self.msgq0_tx.capacity()
    }

    #[inline]
    pub fn msgq1_chan_len(&self) -> usize {
        self.msgq1_tx.max_capacity() - self.msgq1_tx.capacity()
    }

    fn delete_offset(&self, id: &str) -> Result<()> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        self.offset_db.delete(id.as_bytes())
    }

    fn sequence(&self) -> Result<u64> {
        if !self.tomb.alive() {
            return Err(HubError::BrokerClosed.into());
        }
        self.msgq1_db.sequence()
    }

    /// Returns the sequence id sink `id` should start reading from.
    ///
    /// A persistent sink resumes after its committed offset; on first use it commits
    /// the current log sequence, so it starts with messages appended from now on.
    /// Any stale offset of a non-persistent sink is deleted.
    pub async fn init_offset(&self, id: &str, persistent: bool) -> Result<u64> {
        let mut offset = self.sequence()?;
        if persistent {
            match self.offset_persisted(id)? {
                Some(v) => offset = v,
                None => self.persist_offset(id, offset).await?,
            }
        } else {
            self.delete_offset(id)?;
        }
        Ok(offset + 1)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        !self.tomb.alive()
    }

    /// Stops the background tasks after they flush what is still buffered.
    pub async fn close(&self) {
        log::info!("broker closing");
        self.tomb.kill();
        match self.tomb.wait().await {
            Ok(()) => log::info!("broker closed"),
            Err(e) => log::info!("broker closed, {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Inner;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    fn settings() -> Settings {
        let mut inner = Inner::default();
        inner.shutdown.timeout = Duration::from_secs(3);
        inner.message.egress.qos1.retry.interval = Duration::from_millis(200);
        Settings::from_inner(inner)
    }

    fn msg(qos: QoS, topic: &str, payload: &'static str) -> Message {
        Message::new(qos, topic, Bytes::from_static(payload.as_bytes()), "client-1")
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn persist_and_fetch_qos1() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(settings(), &factory).unwrap();

        let acked = Arc::new(AtomicU32::new(0));
        for i in 0..3 {
            let mut m = msg(QoS::AtLeastOnce, "t", ["a", "b", "c"][i]);
            let acked = acked.clone();
            m.set_callback_pid(i as u32 + 1, Arc::new(move |pid| {
                acked.fetch_add(pid, Ordering::SeqCst);
            }));
            b.flow(m).await.unwrap();
        }
        wait_until(|| acked.load(Ordering::SeqCst) == 6).await;

        let msgs = b.fetch_q1(1, 10).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].sequence_id, 1);
        assert_eq!(msgs[0].payload, Bytes::from_static(b"a"));
        assert_eq!(msgs[2].sequence_id, 3);
        assert_eq!(msgs[2].qos, QoS::AtLeastOnce);
        assert_eq!(b.fetch_q1(3, 10).unwrap().len(), 1);
        assert_eq!(b.fetch_q1(2, 1).unwrap().len(), 1);
        assert!(b.fetch_q1(4, 10).unwrap().is_empty());

        b.close().await;
        let e = b.fetch_q1(1, 10).unwrap_err();
        assert_eq!(HubError::of(&e), Some(&HubError::BrokerClosed));
    }

    #[tokio::test]
    async fn qos0_goes_to_queue() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(settings(), &factory).unwrap();
        b.flow(msg(QoS::AtMostOnce, "t", "pld")).await.unwrap();
        assert_eq!(b.msgq0_chan_len(), 1);
        let m = b.msgq0_chan().lock().await.recv().await.unwrap();
        assert_eq!(m.topic, "t");
        assert!(b.fetch_q1(0, 10).unwrap().is_empty());
        b.close().await;
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce] {
            let res = tokio::time::timeout(Duration::from_secs(1), b.flow(msg(qos, "t", "x"))).await.unwrap();
            let e = res.unwrap_err();
            assert_eq!(HubError::of(&e), Some(&HubError::BrokerClosed));
        }
    }

    #[tokio::test]
    async fn offsets() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(settings(), &factory).unwrap();

        assert_eq!(b.init_offset("durable", true).await.unwrap(), 1);
        b.wait_offset_persisted().await;
        assert_eq!(b.offset_persisted("durable").unwrap(), Some(0));

        b.persist_offset("durable", 5).await.unwrap();
        b.persist_offset("durable", 9).await.unwrap();
        b.wait_offset_persisted().await;
        assert_eq!(b.offset_pending(), 0);
        assert_eq!(b.offset_persisted("durable").unwrap(), Some(9));
        assert_eq!(b.init_offset("durable", true).await.unwrap(), 10);

        b.persist_offset("ephemeral", 3).await.unwrap();
        b.wait_offset_persisted().await;
        assert_eq!(b.init_offset("ephemeral", false).await.unwrap(), 1);
        assert_eq!(b.offset_persisted("ephemeral").unwrap(), None);

        b.close().await;
        assert!(b.persist_offset("durable", 10).await.is_err());
        assert!(b.init_offset("durable", true).await.is_err());
    }

    #[tokio::test]
    async fn init_offset_starts_from_now() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(settings(), &factory).unwrap();
        let acked = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let mut m = msg(QoS::AtLeastOnce, "t", "old");
            let acked = acked.clone();
            m.set_callback_pid(1, Arc::new(move |_| {
                acked.fetch_add(1, Ordering::SeqCst);
            }));
            b.flow(m).await.unwrap();
        }
        wait_until(|| acked.load(Ordering::SeqCst) == 2).await;
        assert_eq!(b.init_offset("late", true).await.unwrap(), 3);
        assert_eq!(b.init_offset("late-tmp", false).await.unwrap(), 3);
        b.close().await;
    }

    #[tokio::test]
    async fn flush_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(settings(), &factory).unwrap();
        b.flow(msg(QoS::AtLeastOnce, "t", "last")).await.unwrap();
        b.persist_offset("s", 1).await.unwrap();
        b.close().await;

        let db = factory.new_db(DB_MSGQOS1).unwrap();
        assert_eq!(db.sequence().unwrap(), 1);
        let db = factory.new_db(DB_OFFSET).unwrap();
        assert_eq!(db.get(b"s").unwrap().map(|v| bytes_to_u64(&v)), Some(1));
    }
}
