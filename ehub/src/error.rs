use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("broker already closed")]
    BrokerClosed,

    #[error("rule manager already closed")]
    RuleManagerClosed,

    #[error("message channel is closed")]
    MsgChanClosed,

    #[error("message is discarded since channel is full")]
    MessageDiscarded,

    #[error("rule ({0}) not found")]
    RuleNotFound(String),

    #[error("rule ({0}) exists")]
    RuleExists(String),

    #[error("session ({0}) not found")]
    SessionNotFound(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl HubError {
    /// Returns the `HubError` carried by `e`, if any.
    #[inline]
    pub fn of(e: &anyhow::Error) -> Option<&HubError> {
        e.downcast_ref::<HubError>()
    }
}
