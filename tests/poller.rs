use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use eventail::{
    filter::Filter,
    partition::which_partition,
    repository::{AppendBatch, EventBody, EventWriter, Repository},
    store::MemoryStore,
    Event, EventId, Poller, Result, Sink, Start, StoreError,
};

const NO_LAG: Duration = Duration::ZERO;

/// Appends `kinds` as one batch for `aggregate_id`, visible immediately
/// (created_at one second in the past beats any trailing lag used here).
async fn append(store: &MemoryStore, aggregate_id: &str, first_version: u32, kinds: &[&str]) {
    let batch = AppendBatch {
        aggregate_id: aggregate_id.to_string(),
        aggregate_id_hash: eventail::partition::hash32(aggregate_id),
        aggregate_type: "Account".to_string(),
        first_version,
        idempotency_key: String::new(),
        labels: BTreeMap::new(),
        created_at: Utc::now() - TimeDelta::seconds(1),
        events: kinds
            .iter()
            .map(|kind| EventBody::new(*kind, b"{}".to_vec()))
            .collect(),
    };
    store.save_events(batch).await.unwrap();
}

async fn all_ids(store: &MemoryStore) -> Vec<EventId> {
    store
        .get_events(None, 0, NO_LAG, &Filter::default())
        .await
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect()
}

fn collector() -> (Arc<Mutex<Vec<EventId>>>, impl FnMut(Event) -> Result<()>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: Event| {
        sink.lock().push(event.id);
        Ok(())
    })
}

#[tokio::test]
async fn replay_delivers_everything_in_id_order() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", 1, &["Created", "Updated"]).await;
    append(&store, "acc-2", 1, &["Created"]).await;
    append(&store, "acc-1", 3, &["Updated", "Updated"]).await;

    let poller = Poller::new(Arc::clone(&store))
        .with_trailing_lag(NO_LAG)
        .with_limit(2);
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let last = poller.replay(&ctx, &mut handler).await.unwrap();

    let expected = all_ids(&store).await;
    assert_eq!(*seen.lock(), expected);
    assert_eq!(last, expected.last().copied());
}

#[tokio::test]
async fn replay_until_stops_at_the_target_id() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", 1, &["Created", "Updated", "Updated", "Updated"]).await;
    let ids = all_ids(&store).await;

    let poller = Poller::new(Arc::clone(&store)).with_trailing_lag(NO_LAG);
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let last = poller
        .replay_until(&ctx, &mut handler, ids[1])
        .await
        .unwrap();

    assert_eq!(last, Some(ids[1]));
    assert_eq!(*seen.lock(), ids[..2].to_vec());
}

#[tokio::test]
async fn replay_from_until_drains_the_window() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", 1, &["A", "B", "C", "D", "E"]).await;
    let ids = all_ids(&store).await;

    let poller = Poller::new(Arc::clone(&store))
        .with_trailing_lag(NO_LAG)
        .with_limit(2);
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let last = poller
        .replay_from_until(&ctx, &mut handler, Some(ids[0]), Some(ids[3]))
        .await
        .unwrap();

    assert_eq!(last, Some(ids[3]));
    assert_eq!(*seen.lock(), ids[1..4].to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_from_end_sees_only_new_events() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", 1, &["Created", "Updated", "Updated"]).await;

    let poller = Poller::new(Arc::clone(&store))
        .with_trailing_lag(NO_LAG)
        .with_poll_interval(Duration::from_millis(20));
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let loop_ctx = ctx.clone();
    let loop_poller = poller.clone();
    let task = tokio::spawn(async move {
        loop_poller
            .handle(&loop_ctx, Start::End, &mut handler)
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    append(&store, "acc-2", 1, &["Created", "Updated"]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    ctx.cancel();
    task.await.unwrap().unwrap();

    let ids = all_ids(&store).await;
    assert_eq!(*seen.lock(), ids[3..].to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn trailing_lag_hides_fresh_events_until_the_window_passes() {
    let store = Arc::new(MemoryStore::new());
    let lag = Duration::from_millis(300);

    let poller = Poller::new(Arc::clone(&store))
        .with_trailing_lag(lag)
        .with_poll_interval(Duration::from_millis(20));
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let loop_ctx = ctx.clone();
    let loop_poller = poller.clone();
    let task = tokio::spawn(async move {
        loop_poller
            .handle(&loop_ctx, Start::Beginning, &mut handler)
            .await
    });

    // Two "transactions" commit just now: both sit inside the lag window.
    let batch = AppendBatch {
        aggregate_id: "acc-1".to_string(),
        aggregate_id_hash: eventail::partition::hash32("acc-1"),
        aggregate_type: "Account".to_string(),
        first_version: 1,
        idempotency_key: String::new(),
        labels: BTreeMap::new(),
        created_at: Utc::now(),
        events: vec![EventBody::new("Created", b"{}".to_vec())],
    };
    store.save_events(batch.clone()).await.unwrap();
    let batch2 = AppendBatch {
        aggregate_id: "acc-2".to_string(),
        aggregate_id_hash: eventail::partition::hash32("acc-2"),
        ..batch
    };
    store.save_events(batch2).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().is_empty(), "events inside the window leaked out");

    tokio::time::sleep(Duration::from_millis(400)).await;
    ctx.cancel();
    task.await.unwrap().unwrap();

    let ids = all_ids(&store).await;
    assert_eq!(*seen.lock(), ids, "both commits delivered exactly once, in id order");
}

/// Repository that fails its first calls, then delegates.
struct Flaky {
    store: Arc<MemoryStore>,
    failures_left: AtomicUsize,
    failures_seen: AtomicUsize,
}

#[async_trait]
impl Repository for Flaky {
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Option<EventId>> {
        self.store.get_last_event_id(trailing_lag, filter).await
    }

    async fn get_events(
        &self,
        after: Option<EventId>,
        limit: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Vec<Event>> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.failures_seen.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.store.get_events(after, limit, trailing_lag, filter).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_backs_off_on_errors_and_recovers_without_skipping() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", 1, &["Created", "Updated", "Updated"]).await;
    let flaky = Arc::new(Flaky {
        store: Arc::clone(&store),
        failures_left: AtomicUsize::new(2),
        failures_seen: AtomicUsize::new(0),
    });

    let poller = Poller::new(Arc::clone(&flaky))
        .with_trailing_lag(NO_LAG)
        .with_poll_interval(Duration::from_millis(10));
    let (seen, mut handler) = collector();
    let ctx = CancellationToken::new();
    let loop_ctx = ctx.clone();
    let task = tokio::spawn(async move {
        poller.handle(&loop_ctx, Start::Beginning, &mut handler).await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    ctx.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(flaky.failures_seen.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock(), all_ids(&store).await);
}

/// Sink whose resume position is preloaded, as after a restart.
struct RecordingSink {
    resume_from: Option<EventId>,
    received: Mutex<Vec<EventId>>,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn last_event_id(&self) -> Result<Option<EventId>> {
        Ok(self.resume_from)
    }

    async fn send(&self, event: &Event) -> Result<()> {
        self.received.lock().push(event.id);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forward_resumes_from_the_sinks_last_event_id() {
    let store = Arc::new(MemoryStore::new());
    for version in 1..=10 {
        append(&store, "acc-1", version, &["Updated"]).await;
    }
    let ids = all_ids(&store).await;

    // The sink durably absorbed the first seven events before crashing.
    let sink = Arc::new(RecordingSink {
        resume_from: Some(ids[6]),
        received: Mutex::new(Vec::new()),
    });

    let poller = Poller::new(Arc::clone(&store))
        .with_trailing_lag(NO_LAG)
        .with_poll_interval(Duration::from_millis(20));
    let ctx = CancellationToken::new();
    let loop_ctx = ctx.clone();
    let loop_sink = Arc::clone(&sink);
    let task = tokio::spawn(async move { poller.forward(&loop_ctx, &*loop_sink).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(*sink.received.lock(), ids[7..].to_vec());
}

#[tokio::test]
async fn partition_ranges_split_the_stream_without_overlap() {
    let store = Arc::new(MemoryStore::new());
    for index in 0..8 {
        append(&store, &format!("acc-{index}"), 1, &["Created"]).await;
    }

    let ctx = CancellationToken::new();
    let mut union = Vec::new();
    for partition in 0..2 {
        let poller = Poller::new(Arc::clone(&store))
            .with_trailing_lag(NO_LAG)
            .with_filter(Filter::new().with_partitions(2, partition, partition));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut handler = move |event: Event| -> Result<()> {
            assert_eq!(which_partition(event.aggregate_id_hash, 2), partition);
            sink.lock().push(event.id);
            Ok(())
        };
        poller.replay(&ctx, &mut handler).await.unwrap();
        union.extend(seen.lock().iter().copied());
    }

    union.sort();
    assert_eq!(union, all_ids(&store).await);
}
