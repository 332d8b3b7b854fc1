use std::{collections::BTreeMap, net::TcpListener, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use eventail::{
    filter::Filter,
    grpc::{GrpcRepository, StoreService},
    partition::hash32,
    repository::{AppendBatch, EventBody, EventWriter, Repository},
    store::MemoryStore,
    Event, EventId, Poller, Result,
};

const NO_LAG: Duration = Duration::ZERO;

fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn append(store: &MemoryStore, aggregate_id: &str, kinds: &[&str]) {
    let batch = AppendBatch {
        aggregate_id: aggregate_id.to_string(),
        aggregate_id_hash: hash32(aggregate_id),
        aggregate_type: "Account".to_string(),
        first_version: 1,
        idempotency_key: String::new(),
        labels: BTreeMap::from([("geo".to_string(), "EU".to_string())]),
        created_at: Utc::now() - TimeDelta::seconds(1),
        events: kinds
            .iter()
            .map(|kind| EventBody::new(*kind, br#"{"owner":"alice"}"#.to_vec()))
            .collect(),
    };
    store.save_events(batch).await.unwrap();
}

async fn wait_for_grpc(endpoint: &str) -> GrpcRepository {
    for _ in 0..40 {
        match GrpcRepository::connect(endpoint.to_string()).await {
            Ok(repo) => return repo,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("grpc server did not become ready in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_repository_serves_the_poll_contract() {
    let store = Arc::new(MemoryStore::new());
    append(&store, "acc-1", &["Created", "Updated"]).await;
    append(&store, "acc-2", &["Created"]).await;

    let port = match allocate_port() {
        Ok(port) => port,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping grpc test: port binding not permitted ({err})");
            return;
        }
        Err(err) => panic!("{err}"),
    };
    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let service = StoreService::new(Arc::clone(&store));
    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service.into_server())
            .serve(addr)
            .await
    });

    let remote = wait_for_grpc(&format!("http://127.0.0.1:{port}")).await;

    // The remote surface agrees with the local one.
    let local = store
        .get_events(None, 0, NO_LAG, &Filter::default())
        .await
        .unwrap();
    let over_wire = remote
        .get_events(None, 0, NO_LAG, &Filter::default())
        .await
        .unwrap();
    assert_eq!(over_wire, local);

    let last = remote
        .get_last_event_id(NO_LAG, &Filter::default())
        .await
        .unwrap();
    assert_eq!(last, local.last().map(|e| e.id));

    // Filters survive the wire: labels and types are encoded per request.
    let filtered = remote
        .get_events(
            None,
            0,
            NO_LAG,
            &Filter::new()
                .with_aggregate_types(["Account"])
                .with_label("geo", "EU"),
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 3);
    let none = remote
        .get_events(None, 0, NO_LAG, &Filter::new().with_label("geo", "US"))
        .await
        .unwrap();
    assert!(none.is_empty());

    // A poll engine runs unchanged against the remote repository.
    let poller = Poller::new(Arc::new(remote)).with_trailing_lag(NO_LAG);
    let seen: Arc<Mutex<Vec<EventId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut handler = move |event: Event| -> Result<()> {
        sink.lock().push(event.id);
        Ok(())
    };
    let ctx = CancellationToken::new();
    poller.replay(&ctx, &mut handler).await.unwrap();
    assert_eq!(
        *seen.lock(),
        local.iter().map(|e| e.id).collect::<Vec<_>>()
    );

    server.abort();
    let _ = server.await;
}
