/// Storage-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The contract event was stored by an earlier delivery.
    #[error("event already processed: {0}")]
    AlreadyProcessed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unsupported state schema version {found}, expected {expected}")]
    Schema { found: u16, expected: u16 },

    #[error("state version {offered} is older than stored version {stored}")]
    StaleVersion { stored: u64, offered: u64 },

    #[error("balance overflow on {0}")]
    Overflow(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl StoreError {
    pub fn is_already_processed(&self) -> bool {
        matches!(self, Self::AlreadyProcessed(_))
    }
}
