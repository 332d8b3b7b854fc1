use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    error::Result,
    event::Event,
    eventid::EventId,
    filter::Filter,
    repository::Repository,
    sink::Sink,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_TRAILING_LAG: Duration = Duration::from_millis(200);
pub const DEFAULT_LIMIT: usize = 20;

const MAX_WAIT: Duration = Duration::from_secs(60);

/// Where a poll loop seeds its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// After the current tail of the stream: only new events.
    End,
    /// From the first event ever written.
    Beginning,
    /// Strictly after a known event id.
    At(EventId),
}

/// Ordered event callback. Returning an error stops the current batch; the
/// cursor does not advance past the failed event, so delivery is
/// at-least-once.
#[async_trait]
pub trait EventHandler: Send {
    async fn on_event(&mut self, event: Event) -> Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: FnMut(Event) -> Result<()> + Send,
{
    async fn on_event(&mut self, event: Event) -> Result<()> {
        (self)(event)
    }
}

/// Pull-side view of the global stream: ordered batches read behind the
/// trailing-lag window, with polling, replay, and forward verbs.
///
/// The lag window is what makes "fetch where id > last" safe: any transaction
/// whose id was allocated before `now - lag` has either committed and become
/// visible, or will never commit. `trailing_lag` must exceed the worst-case
/// transaction duration plus clock skew across writers.
pub struct Poller<R> {
    repo: Arc<R>,
    poll_interval: Duration,
    trailing_lag: Duration,
    limit: usize,
    filter: Filter,
}

impl<R> Clone for Poller<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            poll_interval: self.poll_interval,
            trailing_lag: self.trailing_lag,
            limit: self.limit,
            filter: self.filter.clone(),
        }
    }
}

impl<R: Repository> Poller<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            poll_interval: DEFAULT_POLL_INTERVAL,
            trailing_lag: DEFAULT_TRAILING_LAG,
            limit: DEFAULT_LIMIT,
            filter: Filter::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_trailing_lag(mut self, lag: Duration) -> Self {
        self.trailing_lag = lag;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.limit = limit;
        }
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn repository(&self) -> Arc<R> {
        Arc::clone(&self.repo)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn trailing_lag(&self) -> Duration {
        self.trailing_lag
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Polls forever, invoking `handler` for every event in id order.
    ///
    /// Backend and handler errors back off exponentially (doubling from the
    /// poll interval, capped at one minute) without advancing the cursor, so
    /// no event is skipped. Returns `Ok(())` once `ctx` is cancelled.
    pub async fn handle<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        start: Start,
        handler: &mut H,
    ) -> Result<()> {
        let after = match start {
            Start::End => {
                self.repo
                    .get_last_event_id(self.trailing_lag, &Filter::default())
                    .await?
            }
            Start::Beginning => None,
            Start::At(id) => Some(id),
        };
        self.poll_loop(ctx, after, handler).await
    }

    /// Pushes the stream into an external destination, seeding the cursor
    /// from the sink's own resume state.
    pub async fn forward<S: Sink>(&self, ctx: &CancellationToken, sink: &S) -> Result<()> {
        let after = sink.last_event_id().await?;
        info!(after = ?after, "forwarding events to sink");
        let mut handler = SinkHandler { sink };
        self.poll_loop(ctx, after, &mut handler).await
    }

    /// Drains every visible event from the beginning. Returns the last
    /// delivered id.
    pub async fn replay<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        handler: &mut H,
    ) -> Result<Option<EventId>> {
        self.retrieve(ctx, handler, None, None).await
    }

    /// Drains from the beginning until `until` is delivered or the stream is
    /// exhausted.
    pub async fn replay_until<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        handler: &mut H,
        until: EventId,
    ) -> Result<Option<EventId>> {
        self.retrieve(ctx, handler, None, Some(until)).await
    }

    /// Drains `(after, until]`, stopping early when the next batch is empty.
    pub async fn replay_from_until<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        handler: &mut H,
        after: Option<EventId>,
        until: Option<EventId>,
    ) -> Result<Option<EventId>> {
        self.retrieve(ctx, handler, after, until).await
    }

    async fn poll_loop<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        mut after: Option<EventId>,
        handler: &mut H,
    ) -> Result<()> {
        let mut wait = self.poll_interval;
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }

            let mut delay = self.poll_interval;
            match self.retrieve(ctx, handler, after, None).await {
                Ok(cursor) => {
                    after = cursor;
                    wait = self.poll_interval;
                }
                Err(err) => {
                    error!(backoff = ?wait, error = %err, "failure retrieving events, backing off");
                    delay = wait;
                    wait = (wait * 2).min(MAX_WAIT);
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One bounded drain: keeps fetching while batches come back full,
    /// delivering in order and advancing the local cursor. Returns the cursor
    /// after the last delivered event.
    async fn retrieve<H: EventHandler>(
        &self,
        ctx: &CancellationToken,
        handler: &mut H,
        mut after: Option<EventId>,
        until: Option<EventId>,
    ) -> Result<Option<EventId>> {
        loop {
            let events = tokio::select! {
                _ = ctx.cancelled() => return Ok(after),
                batch = self.repo.get_events(after, self.limit, self.trailing_lag, &self.filter) => batch?,
            };
            let full_batch = self.limit > 0 && events.len() == self.limit;

            for event in events {
                let id = event.id;
                handler.on_event(event).await?;
                after = Some(id);
                if until == Some(id) {
                    return Ok(after);
                }
            }

            if !full_batch {
                return Ok(after);
            }
        }
    }
}

struct SinkHandler<'a, S> {
    sink: &'a S,
}

#[async_trait]
impl<S: Sink> EventHandler for SinkHandler<'_, S> {
    async fn on_event(&mut self, event: Event) -> Result<()> {
        self.sink.send(&event).await
    }
}
