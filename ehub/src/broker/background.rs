use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use ehub_storage::KV;
use ehub_utils::{timestamp_secs, u64_to_bytes};

use super::{Broker, Offset};
use crate::types::{HashMap, Message};
use crate::Result;

const PERSIST_TICK: Duration = Duration::from_millis(10);
const OFFSET_TICK: Duration = Duration::from_millis(100);

impl Broker {
    /// Appends QoS1 ingress to the message log in batches.
    pub(super) async fn persisting_msg_qos1(self, mut rx: mpsc::Receiver<Message>) -> Result<()> {
        let qos1 = &self.settings.message.ingress.qos1;
        let max = qos1.batch.max;
        let limit = qos1.buffer.size.max(max);
        let mut buf: Vec<Message> = Vec::with_capacity(max);
        let mut ticker = interval(PERSIST_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                msg = rx.recv(), if buf.len() < limit => match msg {
                    Some(msg) => {
                        buf.push(msg);
                        if buf.len() >= max {
                            self.persist_msgs(&mut buf);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buf.is_empty() {
                        self.persist_msgs(&mut buf);
                    }
                }
            }
        }

        rx.close();
        while let Ok(msg) = rx.try_recv() {
            buf.push(msg);
            if buf.len() >= max {
                self.persist_msgs(&mut buf);
            }
        }
        if !buf.is_empty() {
            self.persist_msgs(&mut buf);
        }
        if !buf.is_empty() {
            log::error!("{} qos1 messages not persisted on close", buf.len());
        }
        log::debug!("task of persisting qos1 messages exited");
        Ok(())
    }

    /// Writes `buf` as one batch. On success every publisher is acknowledged and the
    /// buffer is cleared; on failure the buffer is kept for the next attempt.
    fn persist_msgs(&self, buf: &mut Vec<Message>) {
        let mut values = Vec::with_capacity(buf.len());
        buf.retain(|msg| match msg.encode() {
            Ok(v) => {
                values.push(v);
                true
            }
            Err(e) => {
                log::error!("failed to encode message {:?}, {:?}", msg, e);
                false
            }
        });
        if values.is_empty() {
            return;
        }
        match self.msgq1_db.batch_put_v(&values) {
            Ok(sid) => {
                log::debug!("{} messages persisted, last sequence id: {}", buf.len(), sid);
                for msg in buf.drain(..) {
                    msg.callback_pid();
                }
            }
            Err(e) => {
                log::error!("failed to persist {} messages, {:?}", buf.len(), e);
            }
        }
    }

    /// Commits sink offsets, keeping only the highest value per sink within a batch.
    pub(super) async fn persisting_offset(self, mut rx: mpsc::Receiver<Offset>) -> Result<()> {
        let max = self.settings.message.offset.batch.max;
        let mut buf: HashMap<String, u64> = HashMap::default();
        let mut count = 0usize;
        let mut ticker = interval(OFFSET_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                offset = rx.recv() => match offset {
                    Some(Offset { id, value }) => {
                        keep_highest(&mut buf, id, value);
                        count += 1;
                        if count >= max {
                            self.persist_offsets(&mut buf, &mut count);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if count > 0 {
                        self.persist_offsets(&mut buf, &mut count);
                    }
                }
            }
        }

        rx.close();
        while let Ok(Offset { id, value }) = rx.try_recv() {
            keep_highest(&mut buf, id, value);
            count += 1;
        }
        if count > 0 {
            self.persist_offsets(&mut buf, &mut count);
        }
        log::debug!("task of persisting offsets exited");
        Ok(())
    }

    fn persist_offsets(&self, buf: &mut HashMap<String, u64>, count: &mut usize) {
        let kvs: Vec<KV> = buf
            .iter()
            .map(|(id, v)| KV { key: id.as_bytes().to_vec(), value: u64_to_bytes(*v).to_vec() })
            .collect();
        match self.offset_db.batch_put(kvs) {
            Ok(()) => {
                log::debug!("{} offsets persisted", buf.len());
                self.offset_pending.fetch_sub(*count, Ordering::SeqCst);
                buf.clear();
                *count = 0;
            }
            Err(e) => {
                log::error!("failed to persist {} offsets, {:?}", buf.len(), e);
            }
        }
    }

    /// Periodically deletes log entries older than the retention period.
    pub(super) async fn cleaning_msg_qos1(self) -> Result<()> {
        let cleanup = &self.settings.message.ingress.qos1.cleanup;
        let retention = cleanup.retention.as_secs();
        let mut ticker = interval_at(Instant::now() + cleanup.interval, cleanup.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                _ = ticker.tick() => {
                    let before = timestamp_secs().saturating_sub(retention);
                    match self.msgq1_db.clean(before) {
                        Ok(0) => {}
                        Ok(n) => log::info!("{} expired messages cleaned", n),
                        Err(e) => log::error!("failed to clean expired messages, {:?}", e),
                    }
                }
            }
        }
        log::debug!("task of cleaning expired messages exited");
        Ok(())
    }

    pub(super) async fn logging(self) -> Result<()> {
        let period = self.settings.status.logging.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.tomb.dying() => break,
                _ = ticker.tick() => {
                    log::info!(
                        "broker status, msgq0: {}, msgq1: {}, offset queue: {}, offset pending: {}",
                        self.msgq0_chan_len(),
                        self.msgq1_chan_len(),
                        self.offset_chan_len(),
                        self.offset_pending()
                    );
                }
            }
        }
        Ok(())
    }
}

#[inline]
fn keep_highest(buf: &mut HashMap<String, u64>, id: String, value: u64) {
    let v = buf.entry(id).or_insert(value);
    *v = (*v).max(value);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use bytes::Bytes;

    use ehub_storage::StorageFactory;

    use crate::settings::{Inner, Settings};
    use crate::types::QoS;

    use super::*;

    #[tokio::test]
    async fn cleanup_expired() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let mut inner = Inner::default();
        inner.message.ingress.qos1.cleanup.retention = Duration::from_secs(0);
        inner.message.ingress.qos1.cleanup.interval = Duration::from_millis(100);
        let b = Broker::new(Settings::from_inner(inner), &factory).unwrap();

        let acked = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let mut msg = Message::new(QoS::AtLeastOnce, "t", Bytes::from_static(b"x"), "c");
            let acked = acked.clone();
            msg.set_callback_pid(1, Arc::new(move |_| {
                acked.fetch_add(1, Ordering::SeqCst);
            }));
            b.flow(msg).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while acked.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(b.fetch_q1(1, 10).unwrap().len(), 5);

        // entries are only removed once their timestamp is strictly in the past
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(b.fetch_q1(1, 10).unwrap().is_empty());
        assert_eq!(b.msgq1_db.sequence().unwrap(), 5);
        b.close().await;
    }

    #[test]
    fn batch_keeps_highest_offset() {
        let mut buf: HashMap<String, u64> = HashMap::default();
        keep_highest(&mut buf, "a".into(), 5);
        keep_highest(&mut buf, "a".into(), 3);
        keep_highest(&mut buf, "b".into(), 1);
        keep_highest(&mut buf, "a".into(), 9);
        assert_eq!(buf.get("a"), Some(&9));
        assert_eq!(buf.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn offsets_keep_highest() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StorageFactory::new(dir.path()).unwrap();
        let b = Broker::new(Settings::default(), &factory).unwrap();
        for v in 1..=50 {
            b.persist_offset("a", v).await.unwrap();
            b.persist_offset("b", v * 2).await.unwrap();
        }
        b.wait_offset_persisted().await;
        assert_eq!(b.offset_pending(), 0);
        assert_eq!(b.offset_persisted("a").unwrap(), Some(50));
        assert_eq!(b.offset_persisted("b").unwrap(), Some(100));
        b.close().await;
    }
}
