use crate::state_machine::{ChannelEvent, ChannelStatus};

/// Core domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid channel transition: {event:?} not allowed from {from}")]
    InvalidStateTransition {
        from: ChannelStatus,
        event: ChannelEvent,
    },

    #[error("unknown state intent: {0}")]
    InvalidIntent(u8),

    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
