use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{Result, StoreError},
    event::Event,
    eventid::EventId,
    poller::{EventHandler, Poller, Start},
    repository::Repository,
};

pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Multiplexes one upstream poll across many in-process consumers moving at
/// different speeds.
///
/// Upstream deliveries land in a bounded ring buffer and fan out to a
/// per-consumer queue; each consumer drains its queue in its own task, so a
/// slow handler never stalls the poll or its peers. A consumer whose start
/// position has already been evicted from the ring catches up with its own
/// repository reads and attaches to the ring once converged.
pub struct ConsumerCache<R> {
    poller: Poller<R>,
    shared: Arc<Shared>,
}

struct Shared {
    ring_capacity: usize,
    /// Bound of each per-consumer queue. Never below the ring capacity, so
    /// an attach backfill always fits.
    queue_capacity: usize,
    shutdown: CancellationToken,
    state: Mutex<CacheState>,
}

struct CacheState {
    ring: VecDeque<Event>,
    consumers: Vec<Arc<ConsumerShared>>,
}

struct ConsumerShared {
    name: String,
    handler: tokio::sync::Mutex<Box<dyn EventHandler + 'static>>,
    state: Mutex<ConsumerState>,
}

struct ConsumerState {
    /// Bumped on every lifecycle transition; a drain or catch-up task whose
    /// epoch no longer matches must exit without touching the cursor.
    epoch: u64,
    mode: Mode,
}

/// Externally observable consumer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Idle,
    Held,
    Running,
    Failed,
}

enum Mode {
    Idle,
    Failed {
        reason: String,
    },
    Held {
        tx: mpsc::Sender<Event>,
        rx: Option<mpsc::Receiver<Event>>,
        last_delivered: Option<EventId>,
    },
    Running {
        tx: mpsc::Sender<Event>,
        last_delivered: Option<EventId>,
    },
}

impl<R: Repository + 'static> ConsumerCache<R> {
    pub fn new(poller: Poller<R>) -> Self {
        Self::with_capacity(poller, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(poller: Poller<R>, capacity: usize) -> Self {
        Self::with_capacities(poller, capacity, capacity)
    }

    pub fn with_capacities(
        poller: Poller<R>,
        ring_capacity: usize,
        queue_capacity: usize,
    ) -> Self {
        let ring_capacity = ring_capacity.max(1);
        Self {
            poller,
            shared: Arc::new(Shared {
                ring_capacity,
                queue_capacity: queue_capacity.max(ring_capacity),
                shutdown: CancellationToken::new(),
                state: Mutex::new(CacheState {
                    ring: VecDeque::new(),
                    consumers: Vec::new(),
                }),
            }),
        }
    }

    /// Registers a consumer. It delivers nothing until
    /// [`Consumer::start_at`] or [`Consumer::hold_at`] is called.
    pub fn new_consumer(
        &self,
        name: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Consumer<R> {
        let inner = Arc::new(ConsumerShared {
            name: name.into(),
            handler: tokio::sync::Mutex::new(Box::new(handler)),
            state: Mutex::new(ConsumerState {
                epoch: 0,
                mode: Mode::Idle,
            }),
        });
        self.shared.state.lock().consumers.push(Arc::clone(&inner));
        Consumer {
            inner,
            shared: Arc::clone(&self.shared),
            poller: self.poller.clone(),
        }
    }

    /// Boots the shared upstream poll and blocks until `ctx` is cancelled.
    /// `after == None` starts from the beginning of the stream.
    pub async fn start(&self, ctx: &CancellationToken, after: Option<EventId>) -> Result<()> {
        let start = match after {
            Some(id) => Start::At(id),
            None => Start::Beginning,
        };
        let mut handler = FanOut {
            shared: Arc::clone(&self.shared),
        };
        let result = self.poller.handle(ctx, start, &mut handler).await;
        // Upstream is gone; release every consumer task.
        self.shared.shutdown.cancel();
        result
    }
}

/// Upstream handler: append to the ring, evict the oldest past capacity, and
/// push into every attached consumer whose cursor is behind.
struct FanOut {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl EventHandler for FanOut {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ring.push_back(event.clone());
        while state.ring.len() > self.shared.ring_capacity {
            state.ring.pop_front();
        }

        for consumer in &state.consumers {
            consumer.offer(&event);
        }
        Ok(())
    }
}

impl ConsumerShared {
    /// Enqueues the event for an attached (running or held) consumer. A full
    /// queue evicts the consumer: it can restart later in catch-up mode.
    fn offer(&self, event: &Event) {
        let mut state = self.state.lock();
        let (tx, last_delivered) = match &state.mode {
            Mode::Running { tx, last_delivered } | Mode::Held { tx, last_delivered, .. } => {
                (tx.clone(), *last_delivered)
            }
            Mode::Idle | Mode::Failed { .. } => return,
        };
        if last_delivered >= Some(event.id) {
            return;
        }
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let reason = StoreError::ConsumerOverflow(self.name.clone());
                error!(consumer = %self.name, "{reason}");
                state.epoch += 1;
                state.mode = Mode::Failed {
                    reason: reason.to_string(),
                };
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.epoch += 1;
                state.mode = Mode::Idle;
            }
        }
    }

    fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }
}

/// Handle to one registered consumer.
pub struct Consumer<R> {
    inner: Arc<ConsumerShared>,
    shared: Arc<Shared>,
    poller: Poller<R>,
}

impl<R: Repository + 'static> Consumer<R> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ConsumerStatus {
        match self.inner.state.lock().mode {
            Mode::Idle => ConsumerStatus::Idle,
            Mode::Failed { .. } => ConsumerStatus::Failed,
            Mode::Held { .. } => ConsumerStatus::Held,
            Mode::Running { .. } => ConsumerStatus::Running,
        }
    }

    /// Why the consumer failed, when it did.
    pub fn last_error(&self) -> Option<String> {
        match &self.inner.state.lock().mode {
            Mode::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Cursor of the consumer: id of the last event its handler completed.
    pub fn last_delivered(&self) -> Option<EventId> {
        match &self.inner.state.lock().mode {
            Mode::Running { last_delivered, .. } | Mode::Held { last_delivered, .. } => {
                *last_delivered
            }
            _ => None,
        }
    }

    /// Transitions to running, delivering every event strictly after
    /// `after`. If that position is no longer covered by the ring the
    /// consumer first catches up with its own repository reads.
    pub fn start_at(&self, after: Option<EventId>) {
        let epoch = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            state.mode = Mode::Idle;
            state.epoch
        };
        spawn_consumer_task(
            Arc::clone(&self.inner),
            Arc::clone(&self.shared),
            self.poller.clone(),
            epoch,
            after,
        );
    }

    /// Detaches the consumer and drops anything buffered for it.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.mode = Mode::Idle;
    }

    /// Registers interest without delivering: events past `after` are
    /// buffered in the consumer queue until [`Consumer::resume`]. Used to
    /// bridge a coordinated restart without missing events.
    pub fn hold_at(&self, after: Option<EventId>) {
        let (tx, rx) = mpsc::channel(self.shared.queue_capacity);
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.mode = Mode::Held {
            tx,
            rx: Some(rx),
            last_delivered: after,
        };
    }

    /// Starts delivering from `after`, preferring events buffered while
    /// held. Falls back to [`Consumer::start_at`] when not held.
    pub fn resume(&self, after: Option<EventId>) {
        let held = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut state.mode, Mode::Idle) {
                Mode::Held { tx, rx, .. } => {
                    let rx = rx.expect("held consumer retains its receiver");
                    state.epoch += 1;
                    state.mode = Mode::Running {
                        tx,
                        last_delivered: after,
                    };
                    Some((state.epoch, rx))
                }
                other => {
                    state.mode = other;
                    None
                }
            }
        };

        match held {
            Some((epoch, rx)) => {
                let inner = Arc::clone(&self.inner);
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    drain_queue(inner, shared, epoch, rx).await;
                });
            }
            None => self.start_at(after),
        }
    }
}

fn spawn_consumer_task<R: Repository + 'static>(
    inner: Arc<ConsumerShared>,
    shared: Arc<Shared>,
    poller: Poller<R>,
    epoch: u64,
    after: Option<EventId>,
) {
    tokio::spawn(async move {
        let rx = match catch_up(&inner, &shared, &poller, epoch, after).await {
            Some(rx) => rx,
            None => return,
        };
        drain_queue(inner, shared, epoch, rx).await;
    });
}

/// Reads the repository independently until the consumer's cursor reaches the
/// ring's oldest entry, then attaches: queue creation, ring backfill, and
/// registration happen under one lock so the switch is gap- and
/// duplicate-free.
async fn catch_up<R: Repository>(
    inner: &Arc<ConsumerShared>,
    shared: &Arc<Shared>,
    poller: &Poller<R>,
    epoch: u64,
    mut after: Option<EventId>,
) -> Option<mpsc::Receiver<Event>> {
    let repo = poller.repository();
    loop {
        if shared.shutdown.is_cancelled() || inner.epoch() != epoch {
            return None;
        }

        let batch = match repo
            .get_events(after, poller.limit(), poller.trailing_lag(), poller.filter())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(consumer = %inner.name, error = %err, "catch-up read failed, retrying");
                tokio::time::sleep(poller.poll_interval()).await;
                continue;
            }
        };
        let short_batch = batch.len() < poller.limit();

        for event in batch {
            if inner.epoch() != epoch {
                return None;
            }
            let id = event.id;
            let mut handler = inner.handler.lock().await;
            if let Err(err) = handler.on_event(event).await {
                error!(consumer = %inner.name, error = %err, "handler failed during catch-up");
                fail(inner, epoch, err.to_string());
                return None;
            }
            after = Some(id);
        }

        // Attach once the cursor covers the ring's oldest entry (or the ring
        // is idle and the repository is exhausted).
        let attached = {
            let state = shared.state.lock();
            let converged = match state.ring.front() {
                Some(front) => after.is_some_and(|last| last >= front.id),
                None => short_batch,
            };
            if converged {
                let (tx, rx) = mpsc::channel(shared.queue_capacity);
                let mut consumer_state = inner.state.lock();
                if consumer_state.epoch != epoch {
                    return None;
                }
                for event in &state.ring {
                    if after.is_none_or(|last| event.id > last) {
                        // Backfill cannot overflow: the ring never exceeds
                        // the queue capacity.
                        let _ = tx.try_send(event.clone());
                    }
                }
                consumer_state.mode = Mode::Running {
                    tx,
                    last_delivered: after,
                };
                debug!(consumer = %inner.name, cursor = ?after, "consumer attached to ring");
                Some(rx)
            } else {
                None
            }
        };

        if let Some(rx) = attached {
            return Some(rx);
        }
        if short_batch {
            tokio::time::sleep(poller.poll_interval()).await;
        }
    }
}

async fn drain_queue(
    inner: Arc<ConsumerShared>,
    shared: Arc<Shared>,
    epoch: u64,
    mut rx: mpsc::Receiver<Event>,
) {
    loop {
        let event = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        {
            let state = inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            if let Mode::Running { last_delivered, .. } = &state.mode {
                if *last_delivered >= Some(event.id) {
                    continue;
                }
            } else {
                return;
            }
        }

        let id = event.id;
        let mut handler = inner.handler.lock().await;
        if let Err(err) = handler.on_event(event).await {
            error!(consumer = %inner.name, error = %err, "handler failed, stopping consumer");
            fail(&inner, epoch, err.to_string());
            return;
        }
        drop(handler);

        let mut state = inner.state.lock();
        if state.epoch != epoch {
            return;
        }
        if let Mode::Running { last_delivered, .. } = &mut state.mode {
            *last_delivered = Some(id);
        }
    }
}

fn fail(inner: &Arc<ConsumerShared>, epoch: u64, reason: String) {
    let mut state = inner.state.lock();
    if state.epoch == epoch {
        state.epoch += 1;
        state.mode = Mode::Failed { reason };
    }
}
