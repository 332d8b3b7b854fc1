use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation on `(aggregate_id, aggregate_version)` or
    /// on the idempotency key. The caller must reload and retry.
    #[error("concurrent modification")]
    ConcurrentModification,
    #[error("aggregate not found")]
    AggregateNotFound,
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("consumer '{0}' evicted: queue overflow")]
    ConsumerOverflow(String),
    /// A sinker rejected a delivery. Fatal to the feed iteration: the
    /// caller decides whether to restart.
    #[error("sink error: {0}")]
    Sink(String),
    /// Network, pool, or timeout failure. Pollers back off, feeds reconnect.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Transient failures are retried with backoff; everything else stops the
    /// current iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(code) = err.code() {
            if *code == tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return Self::ConcurrentModification;
            }
        }
        Self::Backend(err.to_string())
    }
}

impl From<mysql_async::Error> for StoreError {
    fn from(err: mysql_async::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Backend(err.to_string())
    }
}
