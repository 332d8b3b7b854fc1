use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::{
    aggregate::scrub_fields,
    error::{Result, StoreError},
    event::{Event, ForgetRequest, Snapshot},
    eventid::EventId,
    filter::Filter,
    repository::{AppendBatch, EventWriter, Repository},
};

const DEFAULT_BATCH: usize = 100;

/// In-process backend. Useful for tests and for embedding the store without
/// an external database; it honours the full repository contract, including
/// the trailing-lag window against each event's `created_at`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Ordered by id: ids are allocated monotonically at append time.
    events: Vec<Event>,
    /// Latest-first is not assumed; lookups scan for the max version.
    snapshots: BTreeMap<String, Vec<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// All snapshots currently stored for an aggregate, version order.
    pub fn snapshots_for(&self, aggregate_id: &str) -> Vec<Snapshot> {
        let mut snapshots = self
            .inner
            .lock()
            .snapshots
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default();
        snapshots.sort_by_key(|s| s.aggregate_version);
        snapshots
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Option<EventId>> {
        let visible_until = Utc::now() - trailing_lag;
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.created_at <= visible_until && filter.matches(e))
            .map(|e| e.id)
            .max())
    }

    async fn get_events(
        &self,
        after: Option<EventId>,
        limit: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Vec<Event>> {
        let visible_until = Utc::now() - trailing_lag;
        let limit = if limit == 0 { DEFAULT_BATCH } else { limit };
        let inner = self.inner.lock();

        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| after.is_none_or(|a| e.id > a))
            .filter(|e| e.created_at <= visible_until && filter.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl EventWriter for MemoryStore {
    async fn save_events(&self, batch: AppendBatch) -> Result<(EventId, u32)> {
        if batch.events.is_empty() {
            return Err(StoreError::Config("empty append batch".into()));
        }
        let mut inner = self.inner.lock();

        let last_version = batch.first_version + batch.events.len() as u32 - 1;
        let conflict = inner.events.iter().any(|e| {
            e.aggregate_id == batch.aggregate_id
                && e.aggregate_version >= batch.first_version
                && e.aggregate_version <= last_version
        });
        if conflict {
            return Err(StoreError::ConcurrentModification);
        }
        if !batch.idempotency_key.is_empty() {
            let duplicate = inner.events.iter().any(|e| {
                e.aggregate_type == batch.aggregate_type
                    && e.idempotency_key == batch.idempotency_key
            });
            if duplicate {
                return Err(StoreError::ConcurrentModification);
            }
        }

        let mut last_id = EventId::default();
        for (index, body) in batch.events.into_iter().enumerate() {
            let id = EventId::new();
            inner.events.push(Event {
                id,
                aggregate_id: batch.aggregate_id.clone(),
                aggregate_id_hash: batch.aggregate_id_hash,
                aggregate_version: batch.first_version + index as u32,
                aggregate_type: batch.aggregate_type.clone(),
                kind: body.kind,
                body: body.body,
                idempotency_key: batch.idempotency_key.clone(),
                labels: batch.labels.clone(),
                created_at: batch.created_at,
                resume_token: None,
            });
            last_id = id;
        }
        Ok((last_id, last_version))
    }

    async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .any(|e| e.aggregate_type == aggregate_type && e.idempotency_key == key))
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock();
        Ok(inner
            .snapshots
            .get(aggregate_id)
            .and_then(|snapshots| snapshots.iter().max_by_key(|s| s.aggregate_version))
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        let snapshots = inner
            .snapshots
            .entry(snapshot.aggregate_id.clone())
            .or_default();
        // Re-offered snapshots are idempotent per (aggregate, version).
        if !snapshots
            .iter()
            .any(|s| s.aggregate_version == snapshot.aggregate_version)
        {
            snapshots.push(snapshot);
        }
        Ok(())
    }

    async fn get_aggregate_events(
        &self,
        aggregate_id: &str,
        after_version: Option<u32>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.lock();
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .filter(|e| after_version.is_none_or(|v| e.aggregate_version > v))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.aggregate_version);
        Ok(events)
    }

    async fn forget(&self, request: &ForgetRequest) -> Result<()> {
        let mut inner = self.inner.lock();

        for directive in &request.events {
            for event in inner
                .events
                .iter_mut()
                .filter(|e| e.aggregate_id == request.aggregate_id && e.kind == directive.kind)
            {
                event.body = scrub_fields(&event.body, &directive.fields)?;
            }
        }

        if let Some(snapshots) = inner.snapshots.get_mut(&request.aggregate_id) {
            for snapshot in snapshots.iter_mut() {
                snapshot.body = scrub_fields(&snapshot.body, &request.aggregate_fields)?;
            }
        }
        Ok(())
    }
}
