use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use mysql_async::{
    binlog::{
        events::{EventData, RowsEventData, TableMapEvent},
        row::BinlogRow,
        value::BinlogValue,
    },
    BinlogStream, BinlogStreamRequest, Conn, OptsBuilder, Value,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{Result, StoreError},
    event::Event,
    eventid::EventId,
    feed::{self, Backoff},
    filter::Filter,
    sink::Sinker,
};

const RESUME_TOKEN_SEP: char = ':';

/// Position in the binary log; the wire format of this feed's resume token
/// is `"<file>:<position>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

impl BinlogPosition {
    pub fn parse(token: &[u8]) -> Result<Option<Self>> {
        if token.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(token)
            .map_err(|_| StoreError::InvalidResumeToken("not utf-8".into()))?;
        let (file, position) = text
            .rsplit_once(RESUME_TOKEN_SEP)
            .ok_or_else(|| StoreError::InvalidResumeToken(text.to_string()))?;
        let position = position
            .parse::<u64>()
            .map_err(|_| StoreError::InvalidResumeToken(text.to_string()))?;
        Ok(Some(Self {
            file: file.to_string(),
            position,
        }))
    }

    pub fn format(&self) -> Vec<u8> {
        if self.file.is_empty() {
            return Vec::new();
        }
        format!("{}{}{}", self.file, RESUME_TOKEN_SEP, self.position).into_bytes()
    }

    /// Later-file-then-larger-offset ordering; binlog file names carry a
    /// monotonic numeric suffix.
    fn newer_than(&self, other: &Self) -> bool {
        (self.file.as_str(), self.position) > (other.file.as_str(), other.position)
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.file, RESUME_TOKEN_SEP, self.position)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MySqlFeedConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Replica identity announced to the server; must be unique among its
    /// replicas.
    pub server_id: u32,
    pub events_table: String,
    pub partitions: u32,
    pub partition_low: u32,
    pub partition_hi: u32,
}

impl Default for MySqlFeedConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 3306,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            server_id: 1,
            events_table: "events".into(),
            partitions: 0,
            partition_low: 0,
            partition_hi: 0,
        }
    }
}

/// Binlog-tailing feed: registers as a replica and turns row inserts on the
/// events table into deliveries.
///
/// All rows of one transaction are buffered until its commit (XID) event and
/// delivered contiguously; the resume token advances only on the final row
/// of the commit, so a crash mid-transaction re-delivers the whole commit.
pub struct MySqlBinlogFeed {
    config: MySqlFeedConfig,
}

impl MySqlBinlogFeed {
    pub fn new(config: MySqlFeedConfig) -> Self {
        Self { config }
    }

    fn filter(&self) -> Filter {
        Filter::new().with_partitions(
            self.config.partitions,
            self.config.partition_low,
            self.config.partition_hi,
        )
    }

    pub async fn run(&self, ctx: &CancellationToken, sinker: &dyn Sinker) -> Result<()> {
        let mut backoff = Backoff::new(Duration::from_millis(500));
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            match self.run_once(ctx, sinker).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    let wait = backoff.next();
                    warn!(error = %err, backoff = ?wait, "binlog feed disconnected, retrying");
                    tokio::select! {
                        _ = ctx.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once(&self, ctx: &CancellationToken, sinker: &dyn Sinker) -> Result<()> {
        // Re-seed on every (re)connect: only durably sinked tokens count.
        let (low, hi) = if self.config.partitions == 0 {
            (0, 0)
        } else {
            (self.config.partition_low, self.config.partition_hi)
        };
        let token = feed::seed_resume_token(sinker, low, hi, |a, b| {
            match (BinlogPosition::parse(a), BinlogPosition::parse(b)) {
                (Ok(Some(a)), Ok(Some(b))) => a.newer_than(&b),
                (Ok(Some(_)), _) => true,
                _ => false,
            }
        })
        .await?;
        let resume = match token {
            Some(token) => BinlogPosition::parse(&token)?,
            None => None,
        };

        let opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()))
            .pass(Some(self.config.password.clone()))
            .prefer_socket(Some(false));
        let conn = Conn::new(opts).await?;

        let mut request = BinlogStreamRequest::new(self.config.server_id);
        if let Some(pos) = &resume {
            request = request.with_filename(pos.file.as_bytes()).with_pos(pos.position);
        }
        let mut stream = conn.get_binlog_stream(request).await?;

        match &resume {
            Some(pos) => info!(partitions = ?(low, hi), position = %pos, "tailing binlog"),
            None => info!(partitions = ?(low, hi), "tailing binlog from the current position"),
        }

        let filter = self.filter();
        let mut position = resume.unwrap_or_default();
        let mut last_token = position.format();
        let mut pending: Vec<Event> = Vec::new();

        loop {
            let binlog_event = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                event = stream.next() => match event {
                    Some(event) => event?,
                    None => return Err(StoreError::Backend("binlog stream ended".into())),
                },
            };
            position.position = u64::from(binlog_event.header().log_pos());

            let Some(data) = binlog_event
                .read_data()
                .map_err(|err| StoreError::Decode(format!("binlog event: {err}")))?
            else {
                continue;
            };

            match data {
                EventData::RotateEvent(rotate) => {
                    position.file = rotate.name().into_owned();
                    position.position = rotate.position();
                }
                EventData::RowsEvent(rows_event) => {
                    if let Some(rows) = self.decode_insert(&rows_event, &stream, &filter)? {
                        pending.extend(rows);
                    }
                }
                EventData::XidEvent(_) => {
                    let total = pending.len();
                    for (index, mut event) in pending.drain(..).enumerate() {
                        if index == total - 1 {
                            last_token = position.format();
                        }
                        event.resume_token = Some(last_token.clone());
                        feed::deliver(sinker, &event).await?;
                    }
                }
                _ => {}
            }
        }
    }

    /// Rows of one insert on the events table, or `None` when the action is
    /// irrelevant or the transaction's aggregate falls outside the claimed
    /// partition range. All rows of one insert belong to the same aggregate,
    /// so the first row decides for the batch.
    fn decode_insert(
        &self,
        rows_event: &RowsEventData<'_>,
        stream: &BinlogStream,
        filter: &Filter,
    ) -> Result<Option<Vec<Event>>> {
        if !matches!(
            rows_event,
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_)
        ) {
            return Ok(None);
        }

        let table_id = rows_event.table_id();
        let Some(tme) = stream.get_tme(table_id) else {
            return Ok(None);
        };
        if tme.table_name() != self.config.events_table.as_str() {
            return Ok(None);
        }

        let mut events = Vec::new();
        for (index, row_result) in rows_event.rows(tme).enumerate() {
            let (_, after) = row_result
                .map_err(|err| StoreError::Decode(format!("binlog row: {err}")))?;
            let Some(row) = after else { continue };
            let event = row_to_event(&row, tme)?;

            if index == 0 && !filter.in_partition_range(event.aggregate_id_hash) {
                return Ok(None);
            }
            events.push(event);
        }
        Ok(Some(events))
    }
}

/// Maps a binlog row by ordinal onto the canonical events-table layout:
/// `(id, aggregate_id, aggregate_id_hash, aggregate_version, aggregate_type,
/// kind, body, idempotency_key, labels, created_at)`.
fn row_to_event(row: &BinlogRow, _tme: &TableMapEvent<'_>) -> Result<Event> {
    let id = EventId::from_str(&column_string(row, 0)?)?;
    let labels_raw = column_bytes(row, 8)?;
    let labels: BTreeMap<String, String> = if labels_raw.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_slice(&labels_raw)
            .map_err(|err| StoreError::Decode(format!("labels column: {err}")))?
    };

    Ok(Event {
        id,
        aggregate_id: column_string(row, 1)?,
        aggregate_id_hash: column_u32(row, 2)?,
        aggregate_version: column_u32(row, 3)?,
        aggregate_type: column_string(row, 4)?,
        kind: column_string(row, 5)?,
        body: column_bytes(row, 6)?,
        idempotency_key: column_string(row, 7)?,
        labels,
        created_at: column_datetime(row, 9)?,
        resume_token: None,
    })
}

fn column_value<'a>(row: &'a BinlogRow, index: usize) -> Result<&'a Value> {
    match row.as_ref(index) {
        Some(BinlogValue::Value(value)) => Ok(value),
        Some(_) => Err(StoreError::Decode(format!(
            "unsupported binlog value in column {index}"
        ))),
        None => Err(StoreError::Decode(format!("missing column {index}"))),
    }
}

fn column_bytes(row: &BinlogRow, index: usize) -> Result<Vec<u8>> {
    match column_value(row, index)? {
        Value::Bytes(bytes) => Ok(bytes.clone()),
        Value::NULL => Ok(Vec::new()),
        other => Err(StoreError::Decode(format!(
            "column {index} is not bytes: {other:?}"
        ))),
    }
}

fn column_string(row: &BinlogRow, index: usize) -> Result<String> {
    String::from_utf8(column_bytes(row, index)?)
        .map_err(|_| StoreError::Decode(format!("column {index} is not utf-8")))
}

fn column_u32(row: &BinlogRow, index: usize) -> Result<u32> {
    match column_value(row, index)? {
        Value::Int(value) => Ok(*value as u32),
        Value::UInt(value) => Ok(*value as u32),
        other => Err(StoreError::Decode(format!(
            "column {index} is not an integer: {other:?}"
        ))),
    }
}

fn column_datetime(row: &BinlogRow, index: usize) -> Result<DateTime<Utc>> {
    match column_value(row, index)? {
        Value::Date(year, month, day, hour, minute, second, micros) => Utc
            .with_ymd_and_hms(
                i32::from(*year),
                u32::from(*month),
                u32::from(*day),
                u32::from(*hour),
                u32::from(*minute),
                u32::from(*second),
            )
            .single()
            .map(|dt| dt + chrono::Duration::microseconds(i64::from(*micros)))
            .ok_or_else(|| StoreError::Decode(format!("column {index} is not a valid datetime"))),
        other => Err(StoreError::Decode(format!(
            "column {index} is not a datetime: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_token_round_trip() {
        let position = BinlogPosition {
            file: "binlog.000042".into(),
            position: 1337,
        };
        let parsed = BinlogPosition::parse(&position.format()).unwrap().unwrap();
        assert_eq!(parsed, position);
    }

    #[test]
    fn empty_token_means_no_position() {
        assert_eq!(BinlogPosition::parse(b"").unwrap(), None);
        assert!(BinlogPosition::default().format().is_empty());
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(BinlogPosition::parse(b"no-separator").is_err());
        assert!(BinlogPosition::parse(b"binlog.1:not-a-number").is_err());
    }

    #[test]
    fn newer_prefers_later_file_then_offset() {
        let a = BinlogPosition {
            file: "binlog.000001".into(),
            position: 900,
        };
        let b = BinlogPosition {
            file: "binlog.000002".into(),
            position: 4,
        };
        let c = BinlogPosition {
            file: "binlog.000002".into(),
            position: 90,
        };
        assert!(b.newer_than(&a));
        assert!(c.newer_than(&b));
        assert!(!a.newer_than(&c));
    }
}
