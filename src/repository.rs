use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    event::{Event, ForgetRequest, Snapshot},
    eventid::EventId,
    filter::Filter,
};

/// Narrow read surface every backend exposes to the poll engine.
///
/// `trailing_lag` is the safety window: only events with
/// `created_at <= now - trailing_lag` are visible, which keeps the returned
/// prefix of the stream stable despite transactions committing in a different
/// order than they allocated ids.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Largest qualifying id, or `None` when no event matches.
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Option<EventId>>;

    /// Events strictly greater than `after`, ordered by id ascending.
    /// `limit == 0` means the implementation default batch.
    async fn get_events(
        &self,
        after: Option<EventId>,
        limit: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Vec<Event>>;
}

/// One event payload inside an append batch. The save path assigns ids,
/// versions, and timestamps; the body codec is the caller's concern.
#[derive(Debug, Clone)]
pub struct EventBody {
    pub kind: String,
    pub body: Vec<u8>,
}

impl EventBody {
    pub fn new(kind: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            body,
        }
    }

    pub fn encode<T: serde::Serialize>(kind: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.into(),
            body: serde_json::to_vec(value)?,
        })
    }
}

/// A batch of events for one aggregate, persisted atomically.
#[derive(Debug, Clone)]
pub struct AppendBatch {
    pub aggregate_id: String,
    pub aggregate_id_hash: u32,
    pub aggregate_type: String,
    /// Version assigned to the first event of the batch; subsequent events
    /// increment from there.
    pub first_version: u32,
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub events: Vec<EventBody>,
}

/// Write surface used by the aggregate save path.
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Atomically appends the batch. Returns the id and version of the last
    /// event written. A unique violation on `(aggregate_id, version)` or on
    /// the idempotency key surfaces as
    /// [`StoreError::ConcurrentModification`](crate::StoreError::ConcurrentModification).
    async fn save_events(&self, batch: AppendBatch) -> Result<(EventId, u32)>;

    async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> Result<bool>;

    /// Latest snapshot for the aggregate, if any.
    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>>;

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// All events of one aggregate with `aggregate_version > after_version`,
    /// in version order. `None` returns the full history.
    async fn get_aggregate_events(
        &self,
        aggregate_id: &str,
        after_version: Option<u32>,
    ) -> Result<Vec<Event>>;

    /// Erases the requested fields from matching event bodies and from the
    /// aggregate's snapshot bodies. Idempotent; not transactional across
    /// event kinds.
    async fn forget(&self, request: &ForgetRequest) -> Result<()>;
}
