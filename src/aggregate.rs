use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{
    error::{Result, StoreError},
    event::{Event, ForgetRequest, Snapshot},
    partition::hash32,
    repository::{AppendBatch, EventBody, EventWriter},
};

pub const DEFAULT_SNAPSHOT_THRESHOLD: u32 = 100;

/// A cluster of domain objects whose state is the fold of its events.
///
/// The implementing type is the aggregate's state; it is snapshotted via
/// serde and rebuilt by replaying events through [`Aggregate::apply`].
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync {
    const AGGREGATE_TYPE: &'static str;

    fn id(&self) -> &str;

    fn version(&self) -> u32;

    fn set_version(&mut self, version: u32);

    /// Timestamp of the newest applied event, used to guard against clock
    /// regression between saves.
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Drains the buffered uncommitted events.
    fn take_events(&mut self) -> Vec<EventBody>;

    /// Folds one historical event into the state. The version is tracked by
    /// the store; implementations only interpret `kind` and `body`.
    fn apply(&mut self, event: &Event) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Unique per aggregate type when non-empty; a duplicate save surfaces
    /// as [`StoreError::ConcurrentModification`].
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
}

impl SaveOptions {
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Aggregate persistence over any [`EventWriter`] backend: transactional
/// append with optimistic versioning, snapshot-accelerated rehydration, and
/// field-level erasure.
pub struct EventStore<W> {
    writer: Arc<W>,
    snapshot_threshold: u32,
}

impl<W: EventWriter + 'static> EventStore<W> {
    pub fn new(writer: Arc<W>) -> Self {
        Self {
            writer,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }

    /// `0` disables snapshots.
    pub fn with_snapshot_threshold(mut self, threshold: u32) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn writer(&self) -> Arc<W> {
        Arc::clone(&self.writer)
    }

    /// Appends the aggregate's buffered events in one backend transaction.
    ///
    /// On success the aggregate's version advances past the batch and, when
    /// the version crosses a snapshot-threshold multiple, a snapshot is
    /// written asynchronously (its failure is logged, never surfaced).
    pub async fn save<A: Aggregate>(&self, aggregate: &mut A, options: SaveOptions) -> Result<()> {
        let events = aggregate.take_events();
        if events.is_empty() {
            return Ok(());
        }

        // Millisecond precision, and never behind the aggregate's own clock:
        // a regressed wall clock must not produce out-of-order created_at.
        let mut now = Utc::now()
            .duration_trunc(TimeDelta::milliseconds(1))
            .unwrap_or_else(|_| Utc::now());
        if let Some(updated_at) = aggregate.updated_at() {
            now = now.max(updated_at);
        }

        let old_version = aggregate.version();
        let batch = AppendBatch {
            aggregate_id: aggregate.id().to_string(),
            aggregate_id_hash: hash32(aggregate.id()),
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            first_version: old_version + 1,
            idempotency_key: options.idempotency_key,
            labels: options.labels,
            created_at: now,
            events,
        };

        let (_, last_version) = self.writer.save_events(batch).await?;
        aggregate.set_version(last_version);

        if self.crossed_snapshot_threshold(old_version, last_version) {
            match serde_json::to_vec(aggregate) {
                Ok(body) => {
                    let snapshot = Snapshot {
                        aggregate_id: aggregate.id().to_string(),
                        aggregate_version: last_version,
                        body,
                        created_at: now,
                    };
                    let writer = Arc::clone(&self.writer);
                    tokio::spawn(async move {
                        if let Err(err) = writer.save_snapshot(snapshot).await {
                            warn!(error = %err, "failed to save snapshot");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to serialize snapshot"),
            }
        }

        Ok(())
    }

    fn crossed_snapshot_threshold(&self, old_version: u32, new_version: u32) -> bool {
        let threshold = self.snapshot_threshold;
        threshold > 0
            && new_version >= threshold
            && new_version / threshold > old_version / threshold
    }

    /// Rehydrates an aggregate: latest snapshot first, then replay of every
    /// event past the snapshot version.
    pub async fn get_by_id<A: Aggregate>(&self, aggregate_id: &str) -> Result<A> {
        let snapshot = self.writer.get_snapshot(aggregate_id).await?;

        let (mut aggregate, snapshot_version) = match snapshot {
            Some(snapshot) => {
                let aggregate: A = serde_json::from_slice(&snapshot.body)
                    .map_err(|err| StoreError::Decode(err.to_string()))?;
                (aggregate, Some(snapshot.aggregate_version))
            }
            None => (A::default(), None),
        };

        let events = self
            .writer
            .get_aggregate_events(aggregate_id, snapshot_version)
            .await?;
        if events.is_empty() && snapshot_version.is_none() {
            return Err(StoreError::AggregateNotFound);
        }

        if let Some(version) = snapshot_version {
            aggregate.set_version(version);
        }
        for event in &events {
            aggregate.apply(event)?;
            aggregate.set_version(event.aggregate_version);
        }
        Ok(aggregate)
    }

    pub async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> Result<bool> {
        self.writer.has_idempotency_key(aggregate_type, key).await
    }

    /// Erases the requested fields from stored event bodies and snapshot
    /// bodies. Idempotent, so re-running after a partial failure is safe.
    pub async fn forget(&self, request: ForgetRequest) -> Result<()> {
        self.writer.forget(&request).await
    }
}

/// Removes the named top-level fields from a JSON object body, leaving
/// everything else byte-for-byte re-encodable. Shared by backends that store
/// bodies as JSON.
pub fn scrub_fields(body: &[u8], fields: &[String]) -> Result<Vec<u8>> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| StoreError::Decode(err.to_string()))?;
    if let Some(object) = value.as_object_mut() {
        for field in fields {
            object.remove(field);
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_removes_only_named_fields() {
        let body = br#"{"owner":"alice","balance":10}"#;
        let scrubbed = scrub_fields(body, &["owner".to_string()]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&scrubbed).unwrap();
        assert!(value.get("owner").is_none());
        assert_eq!(value["balance"], 10);
    }

    #[test]
    fn scrub_is_idempotent() {
        let body = br#"{"owner":"alice"}"#;
        let once = scrub_fields(body, &["owner".to_string()]).unwrap();
        let twice = scrub_fields(&once, &["owner".to_string()]).unwrap();
        assert_eq!(once, twice);
    }
}
