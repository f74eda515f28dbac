use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ehub_utils::Tomb;

use crate::broker::Broker;
use crate::error::HubError;
use crate::settings::Settings;
use crate::types::{BoxFuture, Message, MsgAck, PublishFn, QoS, SidCallback};
use crate::Result;

use super::offset::OffsetTracker;

/// Where a rule hands the messages it routes.
#[derive(Clone)]
pub enum Publisher {
    /// Re-flow into the broker under the sink's target topic and QoS.
    Forward(Broker),
    /// Deliver to a downstream consumer, e.g. a session.
    Callback(PublishFn),
    /// Drop. Used by rules that only fan out into other rules' channels.
    Nop,
}

impl Publisher {
    async fn publish(&self, msg: Message) -> Result<()> {
        match self {
            Publisher::Forward(broker) => {
                let mut fwd =
                    Message::new(msg.target_qos, msg.target_topic.as_str(), msg.payload.clone(), msg.client_id.as_str());
                fwd.retain = msg.retain;
                if fwd.qos == QoS::AtLeastOnce {
                    if let Some(ack) = msg.acknowledge() {
                        fwd.set_callback_pid(0, Arc::new(move |_| ack.ack()));
                    }
                }
                broker.flow(fwd).await
            }
            Publisher::Callback(f) => {
                f(msg);
                Ok(())
            }
            Publisher::Nop => Ok(()),
        }
    }
}

struct Receivers {
    msgq0: mpsc::Receiver<Message>,
    msgq1: mpsc::Receiver<Message>,
    msgack: mpsc::Receiver<MsgAck>,
}

/// Forward pipe of a rule: a QoS0 lane, a QoS1 lane and the queue of deliveries
/// waiting for acknowledgement.
///
/// Completed deliveries are committed through an [`OffsetTracker`], so an
/// offset only advances once every earlier tracked sequence id is done,
/// whichever lane or path carried it.
pub struct MsgChan {
    id: String,
    msgq0_tx: mpsc::Sender<Message>,
    msgq1_tx: mpsc::Sender<Message>,
    msgack_tx: mpsc::Sender<MsgAck>,
    receivers: Mutex<Option<Receivers>>,
    tracker: Option<Arc<OffsetTracker>>,
    commit: Option<SidCallback>,
    publisher: Publisher,
    republish: Option<PublishFn>,
    msgtomb: Tomb,
    acktomb: Tomb,
    quit_timeout: Duration,
    retry_max: Duration,
}

impl MsgChan {
    pub fn new(
        id: &str,
        settings: &Settings,
        publisher: Publisher,
        republish: Option<PublishFn>,
        persist: Option<SidCallback>,
    ) -> Self {
        let egress = &settings.message.egress;
        let (msgq0_tx, msgq0) = mpsc::channel(egress.qos0.buffer.size);
        let (msgq1_tx, msgq1) = mpsc::channel(egress.qos1.buffer.size);
        let (msgack_tx, msgack) = mpsc::channel(egress.qos1.buffer.size);
        let (tracker, commit) = match persist {
            Some(persist) => {
                let tracker = Arc::new(OffsetTracker::default());
                (Some(tracker.clone()), Some(Self::commit_callback(tracker, persist)))
            }
            None => (None, None),
        };
        Self {
            id: id.to_owned(),
            msgq0_tx,
            msgq1_tx,
            msgack_tx,
            receivers: Mutex::new(Some(Receivers { msgq0, msgq1, msgack })),
            tracker,
            commit,
            publisher,
            republish,
            msgtomb: Tomb::new(),
            acktomb: Tomb::new(),
            quit_timeout: settings.shutdown.timeout,
            retry_max: egress.qos1.retry.interval,
        }
    }

    fn commit_callback(tracker: Arc<OffsetTracker>, persist: SidCallback) -> SidCallback {
        Arc::new(move |sid| {
            let fut: BoxFuture<()> = match tracker.complete(sid) {
                Some(offset) => persist(offset),
                None => Box::pin(async {}),
            };
            fut
        })
    }

    /// Whether delivered sequence ids are committed as offsets.
    #[inline]
    pub fn persistent(&self) -> bool {
        self.tracker.is_some()
    }

    /// Restarts offset tracking from `next`, the first sequence id to be routed.
    pub fn reset_offset(&self, next: u64) {
        if let Some(tracker) = self.tracker.as_ref() {
            tracker.reset(next.saturating_sub(1));
        }
    }

    /// Registers `deliveries` pending deliveries of log message `sid`. Must be
    /// called in fetch order, before the message is put into a lane.
    #[inline]
    pub fn track(&self, sid: u64, deliveries: usize) {
        if let Some(tracker) = self.tracker.as_ref() {
            tracker.track(sid, deliveries);
        }
    }

    /// Last offset handed to the persist callback.
    #[inline]
    pub fn committed_offset(&self) -> Option<u64> {
        self.tracker.as_ref().map(|t| t.committed())
    }

    #[inline]
    pub fn msgq0_len(&self) -> usize {
        self.msgq0_tx.max_capacity() - self.msgq0_tx.capacity()
    }

    #[inline]
    pub fn msgq1_len(&self) -> usize {
        self.msgq1_tx.max_capacity() - self.msgq1_tx.capacity()
    }

    #[inline]
    pub fn msgack_len(&self) -> usize {
        self.msgack_tx.max_capacity() - self.msgack_tx.capacity()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Receivers { msgq0, msgq1, msgack } =
            self.receivers.lock().take().ok_or_else(|| anyhow::anyhow!("msgchan ({}) already started", self.id))?;
        self.acktomb.go(self.clone().waiting_ack(msgack))?;
        self.msgtomb.go(self.clone().processing(msgq0, QoS::AtMostOnce))?;
        self.msgtomb.go(self.clone().processing(msgq1, QoS::AtLeastOnce))?;
        Ok(())
    }

    /// Stops intake, then drains both lanes within the shutdown timeout. With
    /// `force` the drain and every pending acknowledgement are abandoned at once.
    pub async fn close(&self, force: bool) {
        log::debug!("msgchan ({}) closing", self.id);
        self.msgtomb.kill();
        if force {
            self.acktomb.kill();
        }
        if let Err(e) = self.msgtomb.wait().await {
            log::debug!("msgchan ({}) closed, {:?}", self.id, e);
        }
        if !force {
            self.acktomb.kill();
        }
        if let Err(e) = self.acktomb.wait().await {
            log::debug!("msgchan ({}) closed, {:?}", self.id, e);
        }
    }

    /// Never blocks. A full lane discards the message.
    pub async fn put_q0(&self, msg: Message) {
        if !self.msgtomb.alive() {
            log::error!("failed to put message (qos=0) into msgchan ({}), {}", self.id, HubError::MsgChanClosed);
            return;
        }
        match self.msgq0_tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => self.discard(msg).await,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("failed to put message (qos=0) into msgchan ({}), {}", self.id, HubError::MsgChanClosed);
            }
        }
    }

    /// Blocks until there is room or the channel is closing.
    pub async fn put_q1(&self, msg: Message) {
        tokio::select! {
            res = self.msgq1_tx.send(msg) => {
                if res.is_err() {
                    log::error!("failed to put message (qos=1) into msgchan ({}), {}", self.id, HubError::MsgChanClosed);
                }
            }
            _ = self.msgtomb.dying() => {
                log::error!("failed to put message (qos=1) into msgchan ({}), {}", self.id, HubError::MsgChanClosed);
            }
        }
    }

    // Messages read from the log still have to commit their offset.
    async fn discard(&self, mut msg: Message) {
        log::debug!("msgchan ({}): {}", self.id, HubError::MessageDiscarded);
        if msg.qos == QoS::AtMostOnce {
            return;
        }
        msg.set_callback_sid(self.commit.clone());
        self.push_ack(MsgAck::new(msg)).await;
    }

    async fn process(&self, mut msg: Message) {
        if msg.qos == QoS::AtMostOnce {
            self.publish(msg).await;
            return;
        }
        msg.set_callback_sid(self.commit.clone());
        if !msg.barrier {
            if msg.target_qos == QoS::AtLeastOnce {
                msg.set_acknowledge();
            }
            self.publish(msg.clone()).await;
        }
        self.push_ack(MsgAck::new(msg)).await;
    }

    async fn publish(&self, msg: Message) {
        let sid = msg.sequence_id;
        if let Err(e) = self.publisher.publish(msg).await {
            log::error!("msgchan ({}) failed to publish message (sid={}), {:?}", self.id, sid, e);
        }
    }

    async fn push_ack(&self, ack: MsgAck) {
        tokio::select! {
            _ = self.msgack_tx.send(ack) => {}
            _ = self.acktomb.dying() => {}
        }
    }

    async fn processing(self: Arc<Self>, mut rx: mpsc::Receiver<Message>, lane: QoS) -> Result<()> {
        log::debug!("msgchan ({}) task of processing messages (Q{}) begins", self.id, lane.value());
        loop {
            tokio::select! {
                _ = self.msgtomb.dying() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.process(msg).await,
                    None => break,
                },
            }
        }

        let drain = async {
            while let Ok(msg) = rx.try_recv() {
                self.process(msg).await;
            }
        };
        tokio::select! {
            biased;
            _ = self.acktomb.dying() => {
                log::debug!("msgchan ({}) interrupted processing inflight messages (Q{})", self.id, lane.value());
            }
            _ = drain => {
                log::debug!("msgchan ({}) finished processing inflight messages (Q{})", self.id, lane.value());
            }
            _ = tokio::time::sleep(self.quit_timeout) => {
                log::warn!("msgchan ({}) timed out processing inflight messages (Q{})", self.id, lane.value());
            }
        }
        Ok(())
    }

    async fn waiting_ack(self: Arc<Self>, mut rx: mpsc::Receiver<MsgAck>) -> Result<()> {
        log::debug!("msgchan ({}) task of waiting acknowledge begins", self.id);
        loop {
            tokio::select! {
                biased;
                _ = self.acktomb.dying() => break,
                ack = rx.recv() => match ack {
                    Some(ack) => ack.wait(self.retry_max, self.republish.as_ref(), &self.acktomb).await,
                    None => break,
                },
            }
        }
        log::debug!("msgchan ({}) task of waiting acknowledge stopped", self.id);
        Ok(())
    }
}
