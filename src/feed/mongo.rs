use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use mongodb::{
    bson::doc,
    change_stream::event::ResumeToken as MongoResumeToken,
    options::ChangeStreamOptions,
    Client,
};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{Result, StoreError},
    event::Event,
    eventid::EventId,
    feed::{self, Backoff},
    sink::Sinker,
};

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct MongoFeedConfig {
    pub connection_string: String,
    pub database: String,
    pub events_collection: String,
    pub partitions: u32,
    pub partition_low: u32,
    pub partition_hi: u32,
}

impl Default for MongoFeedConfig {
    fn default() -> Self {
        Self {
            connection_string: "mongodb://localhost:27017".into(),
            database: String::new(),
            events_collection: "events".into(),
            partitions: 0,
            partition_low: 0,
            partition_hi: 0,
        }
    }
}

/// Change-stream feed over a document store where one document holds the
/// whole save batch as an ordered `details` array.
///
/// Each detail fans out to one delivered event whose id is derived from the
/// document id and the detail index. The resume token is the driver-supplied
/// cursor, advanced only on the final detail of a document so a crash midway
/// re-delivers the whole document.
pub struct MongoChangeFeed {
    config: MongoFeedConfig,
}

impl MongoChangeFeed {
    pub fn new(config: MongoFeedConfig) -> Self {
        Self { config }
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
                    warn!(error = %err, backoff = ?wait, "change stream disconnected, retrying");
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
        let (low, hi) = if self.config.partitions == 0 {
            (0, 0)
        } else {
            (self.config.partition_low, self.config.partition_hi)
        };
        // Driver cursors order byte-wise within one oplog epoch.
        let seed = feed::seed_resume_token(sinker, low, hi, |a, b| a > b).await?;

        let client = Client::with_uri_str(&self.config.connection_string).await?;
        let collection = client
            .database(&self.config.database)
            .collection::<EventDocument>(&self.config.events_collection);

        let mut match_stage = doc! { "operationType": "insert" };
        if self.config.partitions > 1 {
            let partitions = i64::from(self.config.partitions);
            let modulo = vec![
                mongodb::bson::Bson::String("$fullDocument.aggregate_id_hash".into()),
                mongodb::bson::Bson::Int64(partitions),
            ];
            match_stage.insert(
                "$expr",
                doc! {
                    "$and": [
                        { "$gte": [ { "$mod": modulo.clone() }, i64::from(self.config.partition_low) ] },
                        { "$lte": [ { "$mod": modulo }, i64::from(self.config.partition_hi) ] },
                    ]
                },
            );
        }
        let pipeline = vec![doc! { "$match": match_stage }];

        let options = match &seed {
            Some(token) => {
                info!(partitions = ?(low, hi), "resuming change stream from stored token");
                let token: MongoResumeToken = mongodb::bson::from_slice(token)
                    .map_err(|err| StoreError::InvalidResumeToken(err.to_string()))?;
                Some(
                    ChangeStreamOptions::builder()
                        .resume_after(Some(token))
                        .build(),
                )
            }
            None => {
                info!(partitions = ?(low, hi), "starting change stream from the beginning");
                None
            }
        };

        let mut stream = collection.watch(pipeline, options).await?;
        let mut last_token: Option<Vec<u8>> = seed;

        loop {
            let change = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                change = stream.next() => match change {
                    Some(change) => change?,
                    None => return Err(StoreError::Backend("change stream ended".into())),
                },
            };

            let document = change.full_document.ok_or_else(|| {
                StoreError::Decode("insert change without full document".into())
            })?;

            let total = document.details.len();
            for (index, detail) in document.details.iter().enumerate() {
                if index == total - 1 {
                    // The resume token must point at the last fully sinked
                    // document: advancing it mid-document would skip the
                    // remaining details after a crash.
                    if let Some(token) = stream.resume_token() {
                        last_token = Some(
                            mongodb::bson::to_vec(&token)
                                .map_err(|err| StoreError::Serialization(err.to_string()))?,
                        );
                    }
                }
                let event = document.detail_event(index, detail, last_token.clone())?;
                feed::deliver(sinker, &event).await?;
            }
        }
    }
}

/// Shape of one stored document: the save batch of a single aggregate, with
/// each event of the batch as an entry of `details`.
#[derive(Debug, Deserialize)]
struct EventDocument {
    #[serde(rename = "_id")]
    id: EventId,
    aggregate_id: String,
    aggregate_id_hash: u32,
    aggregate_version: u32,
    aggregate_type: String,
    #[serde(default)]
    idempotency_key: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    details: Vec<EventDetail>,
}

#[derive(Debug, Deserialize)]
struct EventDetail {
    kind: String,
    body: serde_json::Value,
}

impl EventDocument {
    fn detail_event(
        &self,
        index: usize,
        detail: &EventDetail,
        resume_token: Option<Vec<u8>>,
    ) -> Result<Event> {
        let ordinal = u8::try_from(index)
            .map_err(|_| StoreError::Decode("more than 255 details in one document".into()))?;
        Ok(Event {
            id: self.id.with_ordinal(ordinal)?,
            aggregate_id: self.aggregate_id.clone(),
            aggregate_id_hash: self.aggregate_id_hash,
            aggregate_version: self.aggregate_version,
            aggregate_type: self.aggregate_type.clone(),
            kind: detail.kind.clone(),
            body: serde_json::to_vec(&detail.body)?,
            idempotency_key: self.idempotency_key.clone(),
            labels: self.labels.clone(),
            created_at: self.created_at,
            resume_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_fan_out_with_ordered_composite_ids() {
        let mut raw = [0u8; crate::eventid::RAW_LEN];
        raw[0..4].copy_from_slice(&1_700_000_000u32.to_be_bytes());
        let document = EventDocument {
            id: EventId::from_raw(raw),
            aggregate_id: "acc-1".into(),
            aggregate_id_hash: 9,
            aggregate_version: 2,
            aggregate_type: "Account".into(),
            idempotency_key: String::new(),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            details: vec![
                EventDetail {
                    kind: "Created".into(),
                    body: serde_json::json!({"owner": "alice"}),
                },
                EventDetail {
                    kind: "Updated".into(),
                    body: serde_json::json!({"owner": "bob"}),
                },
            ],
        };

        let first = document
            .detail_event(0, &document.details[0], None)
            .unwrap();
        let second = document
            .detail_event(1, &document.details[1], Some(b"token".to_vec()))
            .unwrap();

        assert_eq!(first.id, document.id);
        assert!(second.id > first.id);
        assert_eq!(second.kind, "Updated");
        assert_eq!(second.resume_token, Some(b"token".to_vec()));
    }
}
