use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File, FileFormat};
use serde::Deserialize;

use ehub_utils::{deserialize_duration, to_duration};

use crate::error::HubError;
use crate::topic::{pub_topic_validate, sub_topic_validate};
use crate::types::QoS;
use crate::Result;

use self::log::Log;
pub use self::options::Options;

pub mod log;
pub mod options;

/// Hub configuration, shared by reference.
#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub shutdown: Shutdown,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    /// Loads settings from the default locations, the file given in `opts`,
    /// and `EHUB_*` environment variables, later sources overriding earlier ones.
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/ehub/ehub").required(false))
            .add_source(File::with_name("ehub").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("ehub").separator("__").try_parsing(true));

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        //Command line configuration overriding file configuration
        if let Some(dir) = opts.storage_dir.as_ref() {
            inner.storage.dir.clone_from(dir);
        }
        inner.opts = opts;

        let s = Self(Arc::new(inner));
        s.validate()?;
        Ok(s)
    }

    /// Parses settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let inner: Inner =
            Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()?;
        let s = Self(Arc::new(inner));
        s.validate()?;
        Ok(s)
    }

    #[inline]
    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { HubError::InvalidConfig(msg).into() };
        let m = &self.message;
        let sizes = [
            ("message.ingress.qos0.buffer.size", m.ingress.qos0.buffer.size),
            ("message.ingress.qos1.buffer.size", m.ingress.qos1.buffer.size),
            ("message.ingress.qos1.batch.max", m.ingress.qos1.batch.max),
            ("message.egress.qos0.buffer.size", m.egress.qos0.buffer.size),
            ("message.egress.qos1.buffer.size", m.egress.qos1.buffer.size),
            ("message.egress.qos1.batch.max", m.egress.qos1.batch.max),
            ("message.offset.buffer.size", m.offset.buffer.size),
            ("message.offset.batch.max", m.offset.batch.max),
        ];
        for (name, v) in sizes {
            if v < 1 {
                return Err(invalid(format!("{} must be at least 1", name)));
            }
        }
        if m.egress.qos1.buffer.size > 65535 {
            return Err(invalid("message.egress.qos1.buffer.size must not exceed 65535".into()));
        }
        if m.egress.qos1.batch.max > 10000 {
            return Err(invalid("message.egress.qos1.batch.max must not exceed 10000".into()));
        }
        if m.egress.qos1.retry.interval.is_zero() {
            return Err(invalid("message.egress.qos1.retry.interval must be positive".into()));
        }
        if m.ingress.qos1.cleanup.interval.is_zero() {
            return Err(invalid("message.ingress.qos1.cleanup.interval must be positive".into()));
        }
        if self.status.logging.enable && self.status.logging.interval.is_zero() {
            return Err(invalid("status.logging.interval must be positive".into()));
        }
        for sub in self.subscriptions.iter() {
            if !sub_topic_validate(&sub.source.topic) {
                return Err(invalid(format!("subscription source topic ({}) invalid", sub.source.topic)));
            }
            if !pub_topic_validate(&sub.target.topic) {
                return Err(invalid(format!("subscription target topic ({}) invalid", sub.target.topic)));
            }
            QoS::try_from(sub.source.qos).map_err(|e| invalid(e.to_string()))?;
            QoS::try_from(sub.target.qos).map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn logs(&self) {
        ::log::debug!("Config info is {:?}", self.0);
        ::log::info!("storage dir is {}", self.storage.dir);
        ::log::info!("message config is {:?}", self.message);
        ::log::info!("shutdown timeout is {:?}", self.shutdown.timeout);
        ::log::info!("subscriptions count is {}", self.subscriptions.len());
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default = "Storage::dir_default")]
    pub dir: String,
}

impl Default for Storage {
    fn default() -> Self {
        Self { dir: Self::dir_default() }
    }
}

impl Storage {
    fn dir_default() -> String {
        "var/db/ehub".into()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Buffer {
    pub size: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Batch {
    pub max: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub ingress: Ingress,
    #[serde(default)]
    pub egress: Egress,
    #[serde(default)]
    pub offset: Offset,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ingress {
    #[serde(default)]
    pub qos0: IngressQos0,
    #[serde(default)]
    pub qos1: IngressQos1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressQos0 {
    #[serde(default = "IngressQos0::buffer_default")]
    pub buffer: Buffer,
}

impl Default for IngressQos0 {
    fn default() -> Self {
        Self { buffer: Self::buffer_default() }
    }
}

impl IngressQos0 {
    fn buffer_default() -> Buffer {
        Buffer { size: 10000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressQos1 {
    #[serde(default = "IngressQos1::buffer_default")]
    pub buffer: Buffer,
    #[serde(default = "IngressQos1::batch_default")]
    pub batch: Batch,
    #[serde(default)]
    pub cleanup: Cleanup,
}

impl Default for IngressQos1 {
    fn default() -> Self {
        Self { buffer: Self::buffer_default(), batch: Self::batch_default(), cleanup: Cleanup::default() }
    }
}

impl IngressQos1 {
    fn buffer_default() -> Buffer {
        Buffer { size: 100 }
    }
    fn batch_default() -> Batch {
        Batch { max: 50 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cleanup {
    #[serde(default = "Cleanup::retention_default", deserialize_with = "deserialize_duration")]
    pub retention: Duration,
    #[serde(default = "Cleanup::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self { retention: Self::retention_default(), interval: Self::interval_default() }
    }
}

impl Cleanup {
    fn retention_default() -> Duration {
        to_duration("48h")
    }
    fn interval_default() -> Duration {
        to_duration("1m")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Egress {
    #[serde(default)]
    pub qos0: EgressQos0,
    #[serde(default)]
    pub qos1: EgressQos1,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressQos0 {
    #[serde(default = "EgressQos0::buffer_default")]
    pub buffer: Buffer,
}

impl Default for EgressQos0 {
    fn default() -> Self {
        Self { buffer: Self::buffer_default() }
    }
}

impl EgressQos0 {
    fn buffer_default() -> Buffer {
        Buffer { size: 10000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressQos1 {
    #[serde(default = "EgressQos1::buffer_default")]
    pub buffer: Buffer,
    #[serde(default = "EgressQos1::batch_default")]
    pub batch: Batch,
    #[serde(default)]
    pub retry: Retry,
}

impl Default for EgressQos1 {
    fn default() -> Self {
        Self { buffer: Self::buffer_default(), batch: Self::batch_default(), retry: Retry::default() }
    }
}

impl EgressQos1 {
    fn buffer_default() -> Buffer {
        Buffer { size: 100 }
    }
    fn batch_default() -> Batch {
        Batch { max: 50 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retry {
    #[serde(default = "Retry::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self { interval: Self::interval_default() }
    }
}

impl Retry {
    fn interval_default() -> Duration {
        to_duration("20s")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Offset {
    #[serde(default = "Offset::buffer_default")]
    pub buffer: Buffer,
    #[serde(default = "Offset::batch_default")]
    pub batch: Batch,
}

impl Default for Offset {
    fn default() -> Self {
        Self { buffer: Self::buffer_default(), batch: Self::batch_default() }
    }
}

impl Offset {
    fn buffer_default() -> Buffer {
        Buffer { size: 10000 }
    }
    fn batch_default() -> Batch {
        Batch { max: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Shutdown {
    //Grace period for draining queues and flushing offsets on close
    #[serde(default = "Shutdown::timeout_default", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self { timeout: Self::timeout_default() }
    }
}

impl Shutdown {
    fn timeout_default() -> Duration {
        to_duration("10m")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub logging: StatusLogging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusLogging {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "StatusLogging::interval_default", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for StatusLogging {
    fn default() -> Self {
        Self { enable: false, interval: Self::interval_default() }
    }
}

impl StatusLogging {
    fn interval_default() -> Duration {
        to_duration("1m")
    }
}

/// Static routing: messages matching `source` are forwarded to `target`.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscription {
    pub source: SubscriptionPoint,
    pub target: SubscriptionPoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPoint {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.message.ingress.qos0.buffer.size, 10000);
        assert_eq!(s.message.ingress.qos1.buffer.size, 100);
        assert_eq!(s.message.ingress.qos1.batch.max, 50);
        assert_eq!(s.message.ingress.qos1.cleanup.retention, Duration::from_secs(48 * 3600));
        assert_eq!(s.message.ingress.qos1.cleanup.interval, Duration::from_secs(60));
        assert_eq!(s.message.egress.qos0.buffer.size, 10000);
        assert_eq!(s.message.egress.qos1.buffer.size, 100);
        assert_eq!(s.message.egress.qos1.batch.max, 50);
        assert_eq!(s.message.egress.qos1.retry.interval, Duration::from_secs(20));
        assert_eq!(s.message.offset.buffer.size, 10000);
        assert_eq!(s.message.offset.batch.max, 100);
        assert_eq!(s.shutdown.timeout, Duration::from_secs(600));
        assert!(!s.status.logging.enable);
        assert!(s.subscriptions.is_empty());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn from_toml() {
        let s = Settings::from_toml(
            r#"
            [storage]
            dir = "/tmp/ehub"

            [message.ingress.qos1.cleanup]
            retention = "1h"

            [message.egress.qos1.retry]
            interval = "5s"

            [shutdown]
            timeout = "3s"

            [[subscriptions]]
            source = { topic = "head", qos = 1 }
            target = { topic = "next" }
            "#,
        )
        .unwrap();
        assert_eq!(s.storage.dir, "/tmp/ehub");
        assert_eq!(s.message.ingress.qos1.cleanup.retention, Duration::from_secs(3600));
        assert_eq!(s.message.ingress.qos1.cleanup.interval, Duration::from_secs(60));
        assert_eq!(s.message.egress.qos1.retry.interval, Duration::from_secs(5));
        assert_eq!(s.shutdown.timeout, Duration::from_secs(3));
        assert_eq!(s.subscriptions.len(), 1);
        assert_eq!(s.subscriptions[0].source.qos, 1);
        assert_eq!(s.subscriptions[0].target.topic, "next");
        assert_eq!(s.subscriptions[0].target.qos, 0);
    }

    #[test]
    fn invalid() {
        let bad_topic = r#"
            [[subscriptions]]
            source = { topic = "a/#/b" }
            target = { topic = "next" }
        "#;
        let e = Settings::from_toml(bad_topic).unwrap_err();
        assert!(matches!(HubError::of(&e), Some(HubError::InvalidConfig(_))));

        let bad_qos = r#"
            [[subscriptions]]
            source = { topic = "a", qos = 2 }
            target = { topic = "next" }
        "#;
        assert!(Settings::from_toml(bad_qos).is_err());

        let bad_size = r#"
            [message.egress.qos1.buffer]
            size = 70000
        "#;
        assert!(Settings::from_toml(bad_size).is_err());
    }
}
