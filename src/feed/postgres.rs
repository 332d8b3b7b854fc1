use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::poll_fn;
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{Result, StoreError},
    event::Event,
    eventid::EventId,
    feed::{self, Backoff},
    poller::{EventHandler, Poller},
    repository::Repository,
    sink::Sinker,
};

/// LISTEN/NOTIFY feed. A trigger on the events table NOTIFYs the channel
/// with the JSON-encoded row; the feed covers the backlog through the poll
/// engine first, then tails the channel.
///
/// The resume token is the event id string, so catch-up replays from
/// `delay(token, trailing_lag)` to cover transactions that committed out of
/// id order, and the interleave guard drops any notification at or below the
/// last replayed id.
pub struct PgListenFeed<R> {
    conn_str: String,
    channel: String,
    poller: Poller<R>,
}

impl<R: Repository> PgListenFeed<R> {
    /// The poller carries the filter (including the partition range), batch
    /// limit, and trailing lag used for the catch-up phases.
    pub fn new(conn_str: impl Into<String>, channel: impl Into<String>, poller: Poller<R>) -> Self {
        Self {
            conn_str: conn_str.into(),
            channel: channel.into(),
            poller,
        }
    }

    /// Delivers every committed event in the partition range to `sinker` at
    /// least once, in id order, until `ctx` is cancelled. Sinker and decode
    /// errors are fatal; connection loss reconnects from the last delivered
    /// id with backoff.
    pub async fn run(&self, ctx: &CancellationToken, sinker: &dyn Sinker) -> Result<()> {
        let (low, hi) = feed::partition_range(self.poller.filter());
        let seed = feed::seed_resume_token(sinker, low, hi, |a, b| a > b).await?;
        let mut last = match seed {
            Some(token) => Some(parse_token(&token)?),
            None => None,
        };

        let mut backoff = Backoff::new(self.poller.poll_interval());
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            match self.run_once(ctx, sinker, &mut last).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    let wait = backoff.next();
                    warn!(error = %err, backoff = ?wait, "listen feed disconnected, retrying");
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(
        &self,
        ctx: &CancellationToken,
        sinker: &dyn Sinker,
        last: &mut Option<EventId>,
    ) -> Result<()> {
        let (client, mut connection) = tokio_postgres::connect(&self.conn_str, NoTls).await?;

        // Drive the connection, forwarding notifications. The task ends when
        // the connection does; the closed channel tells the tail loop.
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        if tx.send(notification).is_err() {
                            return;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "postgres notification connection failed");
                        return;
                    }
                    None => return,
                }
            }
        });

        // Listen before replaying, so nothing committed in between is lost.
        client
            .batch_execute(&format!("LISTEN \"{}\"", self.channel))
            .await?;

        // Replay applying the safety margin, in case commits within the lag
        // window landed out of id order.
        let from = last.map(|id| id.delayed(self.poller.trailing_lag()));
        info!(channel = %self.channel, from = ?from, "replaying backlog before tailing");
        let mut handler = StampAndSink { sinker };
        let replayed = self
            .poller
            .replay_from_until(ctx, &mut handler, from, None)
            .await?;

        // Notifications at or below the threshold were covered by the
        // replay; delivering them again would duplicate.
        let threshold = replayed.or(from);
        if let Some(id) = threshold {
            *last = Some(id);
        }

        loop {
            let notification = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                notification = rx.recv() => match notification {
                    Some(notification) => notification,
                    None => {
                        return Err(StoreError::Backend(
                            "notification connection closed".into(),
                        ));
                    }
                },
            };

            let wire: WireEvent = serde_json::from_str(notification.payload())
                .map_err(|err| StoreError::Decode(format!("notification payload: {err}")))?;
            let id = wire.id;
            // Track every id seen, filtered or not: a reconnect restarts
            // from here with the lag applied.
            *last = Some(id);

            if threshold.is_some_and(|t| id <= t) {
                continue;
            }
            if !self.poller.filter().in_partition_range(wire.aggregate_id_hash) {
                continue;
            }
            feed::deliver(sinker, &wire.into_event()?).await?;
        }
    }
}

/// Replay-phase handler: resume token is the event id string.
struct StampAndSink<'a> {
    sinker: &'a dyn Sinker,
}

#[async_trait::async_trait]
impl EventHandler for StampAndSink<'_> {
    async fn on_event(&mut self, mut event: Event) -> Result<()> {
        event.resume_token = Some(event.id.to_string().into_bytes());
        feed::deliver(self.sinker, &event).await
    }
}

fn parse_token(token: &[u8]) -> Result<EventId> {
    let text = std::str::from_utf8(token)
        .map_err(|_| StoreError::InvalidResumeToken("not utf-8".into()))?;
    text.parse()
        .map_err(|_| StoreError::InvalidResumeToken(text.to_string()))
}

/// The JSON row carried by a notification, as produced by a
/// `row_to_json(NEW)` trigger on the events table.
#[derive(Debug, Deserialize)]
struct WireEvent {
    id: EventId,
    aggregate_id: String,
    aggregate_id_hash: u32,
    aggregate_version: u32,
    aggregate_type: String,
    kind: String,
    body: serde_json::Value,
    #[serde(default)]
    idempotency_key: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(deserialize_with = "de_pg_timestamp")]
    created_at: DateTime<Utc>,
}

impl WireEvent {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            aggregate_id: self.aggregate_id,
            aggregate_id_hash: self.aggregate_id_hash,
            aggregate_version: self.aggregate_version,
            aggregate_type: self.aggregate_type,
            kind: self.kind,
            body: serde_json::to_vec(&self.body)?,
            idempotency_key: self.idempotency_key,
            labels: self.labels.unwrap_or_default(),
            created_at: self.created_at,
            resume_token: Some(self.id.to_string().into_bytes()),
        })
    }
}

/// `row_to_json` renders timestamps without a zone suffix; assume UTC when
/// none is present.
fn de_pg_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
