use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::eventid::EventId;

/// Opaque backend-specific bookmark letting a feed restart without replaying
/// delivered events. Binlog feeds store `file:position`, change streams the
/// driver cursor, channel feeds the event id string.
pub type ResumeToken = Vec<u8>;

/// The immutable unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub aggregate_id: String,
    /// Stable hash of `aggregate_id`, precomputed at write time so partition
    /// filtering never re-hashes on the read or CDC path.
    pub aggregate_id_hash: u32,
    /// Per-aggregate monotonic counter, starts at 1.
    pub aggregate_version: u32,
    pub aggregate_type: String,
    pub kind: String,
    pub body: Vec<u8>,
    /// Unique per `aggregate_type` when non-empty.
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Assigned per delivery by the feed layer; never stored.
    pub resume_token: Option<ResumeToken>,
}

/// Materialised aggregate state at a known version. Advisory only: losing a
/// snapshot costs rehydration time, never correctness.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub aggregate_version: u32,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Field-erasure directive for a single aggregate: scrub the named fields
/// from the bodies of the listed event kinds and from snapshot bodies.
#[derive(Debug, Clone, Default)]
pub struct ForgetRequest {
    pub aggregate_id: String,
    /// Fields to erase from snapshot bodies.
    pub aggregate_fields: Vec<String>,
    pub events: Vec<ForgetEventKind>,
}

#[derive(Debug, Clone)]
pub struct ForgetEventKind {
    pub kind: String,
    pub fields: Vec<String>,
}

impl ForgetRequest {
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            ..Self::default()
        }
    }

    pub fn with_aggregate_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_event_kind<I, S>(mut self, kind: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.push(ForgetEventKind {
            kind: kind.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }
}
