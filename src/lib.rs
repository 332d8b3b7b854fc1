//! Event-sourcing store with a change propagation layer.
//!
//! Aggregate state is persisted as an append-only, id-ordered sequence of
//! events; snapshots shortcut rehydration; downstream consumers read the
//! global stream through one of three mechanisms:
//!
//! - the [`poller::Poller`] pulls ordered batches behind a trailing-lag
//!   window, which makes the visible prefix of the stream stable even though
//!   concurrent transactions can commit in a different order than they
//!   allocated ids;
//! - the [`cache::ConsumerCache`] multiplexes a single upstream poll across
//!   many in-process consumers with independent cursors, late join, and
//!   pause/resume;
//! - the [`feed`] implementations tail a backend's change mechanism (binlog,
//!   change stream, LISTEN/NOTIFY) and push into a [`sink::Sinker`] with
//!   durable resume tokens.
//!
//! Writers go through [`aggregate::EventStore`], which appends with
//! optimistic versioning and idempotency keys and snapshots asynchronously.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod eventid;
pub mod feed;
pub mod filter;
pub mod grpc;
pub mod logging;
pub mod partition;
pub mod poller;
pub mod repository;
pub mod sink;
pub mod store;

pub use aggregate::{Aggregate, EventStore, SaveOptions};
pub use cache::{Consumer, ConsumerCache, ConsumerStatus};
pub use error::{Result, StoreError};
pub use event::{Event, ForgetRequest, ResumeToken, Snapshot};
pub use eventid::EventId;
pub use filter::Filter;
pub use poller::{EventHandler, Poller, Start};
pub use repository::{AppendBatch, EventBody, EventWriter, Repository};
pub use sink::{Sink, Sinker};
