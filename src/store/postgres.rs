use std::{collections::BTreeMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{types::ToSql, Client, NoTls, Row};
use tracing::error;

use crate::{
    error::{Result, StoreError},
    event::{Event, ForgetRequest, Snapshot},
    eventid::EventId,
    filter::Filter,
    repository::{AppendBatch, EventWriter, Repository},
};

const DEFAULT_BATCH: usize = 100;

const EVENT_COLUMNS: &str = "id, aggregate_id, aggregate_id_hash, aggregate_version, \
     aggregate_type, kind, body, idempotency_key, labels, created_at";

/// PostgreSQL backend over the canonical schema:
///
/// ```sql
/// events(id TEXT PRIMARY KEY, aggregate_id TEXT, aggregate_id_hash BIGINT,
///        aggregate_version INT, aggregate_type TEXT, kind TEXT, body JSONB,
///        idempotency_key TEXT, labels JSONB, created_at TIMESTAMPTZ,
///        UNIQUE (aggregate_id, aggregate_version),
///        UNIQUE (aggregate_type, idempotency_key) WHERE idempotency_key <> '')
/// snapshots(id TEXT, aggregate_id TEXT, aggregate_version INT, body JSONB,
///           created_at TIMESTAMPTZ, PRIMARY KEY (aggregate_id, aggregate_version))
/// ```
///
/// Migrations are external; this type only assumes the shape above.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    /// Connects and spawns the connection driver task. The driver's
    /// termination is logged; subsequent queries surface it as
    /// [`StoreError::Backend`].
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Appends the filter to a query. Every clause is parameterised; label
    /// matching uses JSONB containment so keys and values never reach the
    /// SQL text.
    fn push_filter_clauses(
        query: &mut String,
        params: &mut Vec<Box<dyn ToSql + Sync + Send>>,
        filter: &Filter,
    ) {
        if !filter.aggregate_types.is_empty() {
            params.push(Box::new(filter.aggregate_types.clone()));
            query.push_str(&format!(" AND aggregate_type = ANY(${})", params.len()));
        }

        for (key, values) in &filter.labels {
            query.push_str(" AND (");
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    query.push_str(" OR ");
                }
                let mut contains = serde_json::Map::new();
                contains.insert(key.clone(), serde_json::Value::String(value.clone()));
                params.push(Box::new(serde_json::Value::Object(contains)));
                query.push_str(&format!("labels @> ${}", params.len()));
            }
            query.push(')');
        }

        if filter.partitions > 1 {
            params.push(Box::new(i64::from(filter.partitions)));
            let partitions = params.len();
            params.push(Box::new(i64::from(filter.partition_low)));
            let low = params.len();
            params.push(Box::new(i64::from(filter.partition_hi)));
            let hi = params.len();
            query.push_str(&format!(
                " AND aggregate_id_hash % ${partitions} BETWEEN ${low} AND ${hi}"
            ));
        }
    }

    fn row_to_event(row: &Row) -> Result<Event> {
        let id: String = row.get(0);
        let body: serde_json::Value = row.get(6);
        let labels: serde_json::Value = row.get(8);
        let hash: i64 = row.get(2);
        let version: i32 = row.get(3);
        let created_at: DateTime<Utc> = row.get(9);

        Ok(Event {
            id: EventId::from_str(&id)?,
            aggregate_id: row.get(1),
            aggregate_id_hash: hash as u32,
            aggregate_version: version as u32,
            aggregate_type: row.get(4),
            kind: row.get(5),
            body: serde_json::to_vec(&body)?,
            idempotency_key: row.get(7),
            labels: labels_from_value(labels)?,
            created_at,
            resume_token: None,
        })
    }
}

fn labels_from_value(value: serde_json::Value) -> Result<BTreeMap<String, String>> {
    match value {
        serde_json::Value::Null => Ok(BTreeMap::new()),
        other => serde_json::from_value(other)
            .map_err(|err| StoreError::Decode(format!("labels column: {err}"))),
    }
}

fn body_as_json(body: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(body).map_err(|err| StoreError::Decode(format!("event body: {err}")))
}

#[async_trait]
impl Repository for PgStore {
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Option<EventId>> {
        let visible_until = Utc::now() - trailing_lag;
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(visible_until)];
        let mut query = String::from("SELECT id FROM events WHERE created_at <= $1");
        Self::push_filter_clauses(&mut query, &mut params, filter);
        query.push_str(" ORDER BY id DESC LIMIT 1");

        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| &**p as _).collect();
        let row = self.client.query_opt(&query, &refs).await?;
        match row {
            Some(row) => {
                let id: String = row.get(0);
                Ok(Some(EventId::from_str(&id)?))
            }
            None => Ok(None),
        }
    }

    async fn get_events(
        &self,
        after: Option<EventId>,
        limit: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Vec<Event>> {
        let visible_until = Utc::now() - trailing_lag;
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        let limit = if limit == 0 { DEFAULT_BATCH } else { limit };

        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            vec![Box::new(after), Box::new(visible_until)];
        let mut query = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id > $1 AND created_at <= $2"
        );
        Self::push_filter_clauses(&mut query, &mut params, filter);
        params.push(Box::new(limit as i64));
        query.push_str(&format!(" ORDER BY id ASC LIMIT ${}", params.len()));

        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| &**p as _).collect();
        let rows = self.client.query(&query, &refs).await?;
        rows.iter().map(Self::row_to_event).collect()
    }
}

#[async_trait]
impl EventWriter for PgStore {
    async fn save_events(&self, batch: AppendBatch) -> Result<(EventId, u32)> {
        if batch.events.is_empty() {
            return Err(StoreError::Config("empty append batch".into()));
        }

        // A single multi-row INSERT commits atomically, so the whole batch
        // becomes visible at one commit point.
        let labels = serde_json::to_value(&batch.labels)?;
        let mut query = format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES ");
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        let mut last_id = EventId::default();
        let last_version = batch.first_version + batch.events.len() as u32 - 1;

        for (index, event) in batch.events.iter().enumerate() {
            let id = EventId::new();
            last_id = id;
            if index > 0 {
                query.push_str(", ");
            }
            let base = params.len();
            params.push(Box::new(id.to_string()));
            params.push(Box::new(batch.aggregate_id.clone()));
            params.push(Box::new(i64::from(batch.aggregate_id_hash)));
            params.push(Box::new((batch.first_version + index as u32) as i32));
            params.push(Box::new(batch.aggregate_type.clone()));
            params.push(Box::new(event.kind.clone()));
            params.push(Box::new(body_as_json(&event.body)?));
            params.push(Box::new(batch.idempotency_key.clone()));
            params.push(Box::new(labels.clone()));
            params.push(Box::new(batch.created_at));
            query.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8,
                base + 9,
                base + 10
            ));
        }

        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| &**p as _).collect();
        self.client.execute(&query, &refs).await?;
        Ok((last_id, last_version))
    }

    async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM events \
                 WHERE aggregate_type = $1 AND idempotency_key = $2)",
                &[&aggregate_type, &key],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>> {
        let row = self
            .client
            .query_opt(
                "SELECT aggregate_id, aggregate_version, body, created_at FROM snapshots \
                 WHERE aggregate_id = $1 ORDER BY aggregate_version DESC LIMIT 1",
                &[&aggregate_id],
            )
            .await?;
        match row {
            Some(row) => {
                let version: i32 = row.get(1);
                let body: serde_json::Value = row.get(2);
                Ok(Some(Snapshot {
                    aggregate_id: row.get(0),
                    aggregate_version: version as u32,
                    body: serde_json::to_vec(&body)?,
                    created_at: row.get(3),
                }))
            }
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let body = body_as_json(&snapshot.body)?;
        // Snapshots are advisory; a concurrent writer landing the same
        // version first is not an error.
        self.client
            .execute(
                "INSERT INTO snapshots (id, aggregate_id, aggregate_version, body, created_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
                &[
                    &EventId::new().to_string(),
                    &snapshot.aggregate_id,
                    &(snapshot.aggregate_version as i32),
                    &body,
                    &snapshot.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_aggregate_events(
        &self,
        aggregate_id: &str,
        after_version: Option<u32>,
    ) -> Result<Vec<Event>> {
        let rows = match after_version {
            Some(version) => {
                self.client
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM events \
                             WHERE aggregate_id = $1 AND aggregate_version > $2 \
                             ORDER BY aggregate_version ASC"
                        ),
                        &[&aggregate_id, &(version as i32)],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        &format!(
                            "SELECT {EVENT_COLUMNS} FROM events \
                             WHERE aggregate_id = $1 ORDER BY aggregate_version ASC"
                        ),
                        &[&aggregate_id],
                    )
                    .await?
            }
        };
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn forget(&self, request: &ForgetRequest) -> Result<()> {
        for directive in &request.events {
            let fields: Vec<String> = directive.fields.clone();
            self.client
                .execute(
                    "UPDATE events SET body = body - $1::text[] \
                     WHERE aggregate_id = $2 AND kind = $3",
                    &[&fields, &request.aggregate_id, &directive.kind],
                )
                .await?;
        }

        if !request.aggregate_fields.is_empty() {
            self.client
                .execute(
                    "UPDATE snapshots SET body = body - $1::text[] WHERE aggregate_id = $2",
                    &[&request.aggregate_fields, &request.aggregate_id],
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clauses_are_fully_parameterised() {
        let filter = Filter::new()
            .with_aggregate_types(["Account"])
            .with_label("geo", "EU")
            .with_label("geo", "US")
            .with_label("tier", "gold")
            .with_partitions(4, 1, 2);

        let mut query = String::from("SELECT id FROM events WHERE created_at <= $1");
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(Utc::now())];
        PgStore::push_filter_clauses(&mut query, &mut params, &filter);

        assert_eq!(
            query,
            "SELECT id FROM events WHERE created_at <= $1 \
             AND aggregate_type = ANY($2) \
             AND (labels @> $3 OR labels @> $4) \
             AND (labels @> $5) \
             AND aggregate_id_hash % $6 BETWEEN $7 AND $8"
        );
        assert_eq!(params.len(), 8);
        // No label text may leak into the SQL itself.
        assert!(!query.contains("EU"));
        assert!(!query.contains("gold"));
    }

    #[test]
    fn empty_filter_adds_no_clauses() {
        let mut query = String::from("SELECT id FROM events WHERE id > $1");
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
            vec![Box::new(String::new())];
        PgStore::push_filter_clauses(&mut query, &mut params, &Filter::new());
        assert_eq!(query, "SELECT id FROM events WHERE id > $1");
        assert_eq!(params.len(), 1);
    }
}
