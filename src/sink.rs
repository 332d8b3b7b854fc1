use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::Result,
    event::{Event, ResumeToken},
    eventid::EventId,
};

/// Forward target for [`Poller::forward`](crate::poller::Poller::forward):
/// an external destination (queue, search index) that owns its own resume
/// position keyed by event id.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Greatest event id the destination has durably accepted, or `None`
    /// when it has seen nothing yet.
    async fn last_event_id(&self) -> Result<Option<EventId>>;

    async fn send(&self, event: &Event) -> Result<()>;
}

/// Delivery target of a CDC feed. Unlike [`Sink`], resume state is an opaque
/// backend-specific token, tracked per partition so a feed can be restarted
/// for any contiguous partition range.
#[async_trait]
pub trait Sinker: Send + Sync {
    /// Delivers one event. An error is fatal to the feed iteration; the
    /// caller decides whether to restart.
    async fn sink(&self, event: &Event) -> Result<()>;

    /// Greatest resume token durably persisted for `partition`.
    async fn last_resume_token(&self, partition: u32) -> Result<Option<ResumeToken>>;
}

/// In-memory sinker that records deliveries and tracks the latest resume
/// token per partition. Used by tests and as the reference implementation of
/// the resume contract.
#[derive(Default)]
pub struct MemSinker {
    partitions: u32,
    inner: Mutex<MemSinkerInner>,
}

#[derive(Default)]
struct MemSinkerInner {
    events: Vec<Event>,
    tokens: std::collections::BTreeMap<u32, ResumeToken>,
}

impl MemSinker {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            inner: Mutex::new(MemSinkerInner::default()),
        }
    }

    /// Pre-seeds the resume token of a partition, as a restarted sinker
    /// would after reloading its durable state.
    pub fn set_resume_token(&self, partition: u32, token: ResumeToken) {
        self.inner.lock().tokens.insert(partition, token);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.inner.lock().events.iter().map(|e| e.id).collect()
    }
}

#[async_trait]
impl Sinker for MemSinker {
    async fn sink(&self, event: &Event) -> Result<()> {
        let partition =
            crate::partition::which_partition(event.aggregate_id_hash, self.partitions);
        let mut inner = self.inner.lock();
        if let Some(token) = &event.resume_token {
            inner.tokens.insert(partition, token.clone());
        }
        inner.events.push(event.clone());
        Ok(())
    }

    async fn last_resume_token(&self, partition: u32) -> Result<Option<ResumeToken>> {
        Ok(self.inner.lock().tokens.get(&partition).cloned())
    }
}
