use std::{str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tonic::{transport::Channel, Request, Response, Status};

use crate::{
    error::{Result, StoreError},
    event::Event,
    eventid::EventId,
    filter::Filter,
    repository::Repository,
};

pub mod proto {
    tonic::include_proto!("eventail.store");
}

use proto::store_client::StoreClient;
use proto::store_server::{Store, StoreServer};

/// Server half of the facade: exposes any [`Repository`] over gRPC so remote
/// pollers can drive their loops against this process.
pub struct StoreService<R> {
    repo: Arc<R>,
}

impl<R: Repository + 'static> StoreService<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn into_server(self) -> StoreServer<Self> {
        StoreServer::new(self)
    }
}

fn map_error(err: StoreError) -> Status {
    match err {
        StoreError::ConcurrentModification => Status::aborted(err.to_string()),
        StoreError::AggregateNotFound => Status::not_found(err.to_string()),
        StoreError::InvalidEventId(_)
        | StoreError::InvalidResumeToken(_)
        | StoreError::Config(_) => Status::invalid_argument(err.to_string()),
        StoreError::Decode(_) | StoreError::Serialization(_) => Status::internal(err.to_string()),
        StoreError::ConsumerOverflow(_) => Status::resource_exhausted(err.to_string()),
        StoreError::Sink(_) | StoreError::Backend(_) => Status::unavailable(err.to_string()),
    }
}

fn filter_from_proto(filter: Option<proto::Filter>) -> Filter {
    let Some(filter) = filter else {
        return Filter::default();
    };
    let mut domain = Filter::new()
        .with_aggregate_types(filter.aggregate_types)
        .with_partitions(filter.partitions, filter.partition_low, filter.partition_hi);
    for label in filter.labels {
        domain = domain.with_label(label.key, label.value);
    }
    domain
}

fn filter_to_proto(filter: &Filter) -> proto::Filter {
    let mut labels = Vec::new();
    for (key, values) in &filter.labels {
        for value in values {
            labels.push(proto::Label {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    proto::Filter {
        aggregate_types: filter.aggregate_types.clone(),
        labels,
        partitions: filter.partitions,
        partition_low: filter.partition_low,
        partition_hi: filter.partition_hi,
    }
}

fn event_to_proto(event: Event) -> std::result::Result<proto::Event, Status> {
    let labels = serde_json::to_string(&event.labels)
        .map_err(|err| Status::internal(err.to_string()))?;
    Ok(proto::Event {
        id: event.id.to_string(),
        aggregate_id: event.aggregate_id,
        aggregate_version: event.aggregate_version,
        aggregate_id_hash: event.aggregate_id_hash,
        aggregate_type: event.aggregate_type,
        kind: event.kind,
        body: event.body,
        idempotency_key: event.idempotency_key,
        labels,
        created_at: event.created_at.to_rfc3339(),
    })
}

fn event_from_proto(event: proto::Event) -> Result<Event> {
    let labels = if event.labels.is_empty() {
        Default::default()
    } else {
        serde_json::from_str(&event.labels)
            .map_err(|err| StoreError::Decode(format!("labels: {err}")))?
    };
    let created_at = DateTime::parse_from_rfc3339(&event.created_at)
        .map_err(|err| StoreError::Decode(format!("created_at: {err}")))?
        .with_timezone(&Utc);

    Ok(Event {
        id: EventId::from_str(&event.id)?,
        aggregate_id: event.aggregate_id,
        aggregate_id_hash: event.aggregate_id_hash,
        aggregate_version: event.aggregate_version,
        aggregate_type: event.aggregate_type,
        kind: event.kind,
        body: event.body,
        idempotency_key: event.idempotency_key,
        labels,
        created_at,
        resume_token: None,
    })
}

#[tonic::async_trait]
impl<R: Repository + 'static> Store for StoreService<R> {
    async fn get_last_event_id(
        &self,
        request: Request<proto::GetLastEventIdRequest>,
    ) -> std::result::Result<Response<proto::GetLastEventIdResponse>, Status> {
        let params = request.into_inner();
        let lag = Duration::from_millis(params.trailing_lag_ms.max(0) as u64);
        let filter = filter_from_proto(params.filter);

        let id = self
            .repo
            .get_last_event_id(lag, &filter)
            .await
            .map_err(map_error)?;
        Ok(Response::new(proto::GetLastEventIdResponse {
            event_id: id.map(|id| id.to_string()).unwrap_or_default(),
        }))
    }

    async fn get_events(
        &self,
        request: Request<proto::GetEventsRequest>,
    ) -> std::result::Result<Response<proto::GetEventsResponse>, Status> {
        let params = request.into_inner();
        let after = if params.after_event_id.is_empty() {
            None
        } else {
            Some(
                EventId::from_str(&params.after_event_id)
                    .map_err(|err| Status::invalid_argument(err.to_string()))?,
            )
        };
        let lag = Duration::from_millis(params.trailing_lag_ms.max(0) as u64);
        let filter = filter_from_proto(params.filter);

        let events = self
            .repo
            .get_events(after, params.limit as usize, lag, &filter)
            .await
            .map_err(map_error)?;
        let events = events
            .into_iter()
            .map(event_to_proto)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Response::new(proto::GetEventsResponse { events }))
    }
}

/// Client half: a [`Repository`] backed by a remote store, so poll engines
/// and consumer caches run unchanged against it.
#[derive(Clone)]
pub struct GrpcRepository {
    client: StoreClient<Channel>,
}

impl GrpcRepository {
    pub async fn connect(endpoint: String) -> Result<Self> {
        let client = StoreClient::connect(endpoint)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: StoreClient::new(channel),
        }
    }
}

#[async_trait]
impl Repository for GrpcRepository {
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Option<EventId>> {
        let mut client = self.client.clone();
        let response = client
            .get_last_event_id(proto::GetLastEventIdRequest {
                trailing_lag_ms: trailing_lag.as_millis() as i64,
                filter: Some(filter_to_proto(filter)),
            })
            .await
            .map_err(|status| StoreError::Backend(status.to_string()))?
            .into_inner();

        if response.event_id.is_empty() {
            Ok(None)
        } else {
            Ok(Some(EventId::from_str(&response.event_id)?))
        }
    }

    async fn get_events(
        &self,
        after: Option<EventId>,
        limit: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> Result<Vec<Event>> {
        let mut client = self.client.clone();
        let response = client
            .get_events(proto::GetEventsRequest {
                after_event_id: after.map(|id| id.to_string()).unwrap_or_default(),
                limit: limit as u32,
                trailing_lag_ms: trailing_lag.as_millis() as i64,
                filter: Some(filter_to_proto(filter)),
            })
            .await
            .map_err(|status| StoreError::Backend(status.to_string()))?
            .into_inner();

        response.events.into_iter().map(event_from_proto).collect()
    }
}

/// Round-trip sanity for the wire conversions, used by both halves.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::hash32;

    #[test]
    fn filter_round_trips_through_proto() {
        let filter = Filter::new()
            .with_aggregate_types(["Account"])
            .with_label("geo", "EU")
            .with_label("geo", "US")
            .with_partitions(4, 1, 2);

        let round_tripped = filter_from_proto(Some(filter_to_proto(&filter)));
        assert_eq!(round_tripped, filter);
    }

    #[test]
    fn event_round_trips_through_proto() {
        let event = Event {
            id: EventId::new(),
            aggregate_id: "acc-1".into(),
            aggregate_id_hash: hash32("acc-1"),
            aggregate_version: 7,
            aggregate_type: "Account".into(),
            kind: "Updated".into(),
            body: br#"{"owner":"alice"}"#.to_vec(),
            idempotency_key: "key-1".into(),
            labels: [("geo".to_string(), "EU".to_string())].into(),
            created_at: Utc::now(),
            resume_token: None,
        };

        let round_tripped = event_from_proto(event_to_proto(event.clone()).unwrap()).unwrap();
        assert_eq!(round_tripped, event);
    }
}
