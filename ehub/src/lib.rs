//! Routing and durability core of an embedded MQTT broker.
//!
//! Messages enter through [`broker::Broker::flow`], QoS1 messages are appended to a
//! durable log, and [`rule::RuleManager`] routes them to sinks through topic tries.
//! Each rule tracks unacknowledged deliveries and commits per-sink offsets once the
//! downstream side has acknowledged them.

#![deny(unsafe_code)]
#![recursion_limit = "256"]

pub mod broker;
pub mod context;
pub mod error;
pub mod logger;
pub mod router;
pub mod rule;
pub mod session;
pub mod settings;
pub mod topic;
pub mod types;

pub use crate::context::HubContext;
pub use crate::error::HubError;
pub use crate::settings::Settings;
pub use crate::types::*;

pub use ehub_storage as storage;
pub use ehub_utils as utils;
pub use structopt;

pub type Result<T> = anyhow::Result<T>;
