//! gRPC client against an in-process broker.

use std::sync::Arc;
use taskworker::{
    GrpcTaskService, GrpcTaskServiceConfig, LocalBroker, PendingTaskStore, TaskConfig, TaskParameters,
    TaskRegistry, TaskService, TaskStatus, TaskworkerError,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

struct RunningBroker {
    url: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_broker(broker: LocalBroker) -> RunningBroker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    tokio::spawn(async move {
        Server::builder()
            .add_service(broker.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    RunningBroker {
        url: format!("http://{addr}"),
        stop: Some(stop),
    }
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("examples", "say_hello", |_| Ok(()), TaskConfig::default().with_max_retries(2))
        .unwrap();
    registry
}

fn enqueue(store: &PendingTaskStore, count: usize) -> Vec<String> {
    let registry = registry();
    let namespace = registry.namespace("examples").unwrap();
    (0..count)
        .map(|i| {
            let params = TaskParameters::new().with_kwarg("name", format!("worker-{i}"));
            let activation = namespace.create_activation("say_hello", &params).unwrap();
            let id = activation.id.clone();
            store.push("taskworker", activation);
            id
        })
        .collect()
}

#[tokio::test]
async fn test_fetch_and_report_round_trip() {
    let store = Arc::new(PendingTaskStore::new());
    let ids = enqueue(&store, 1);
    let broker = start_broker(LocalBroker::new(store.clone())).await;

    let service = GrpcTaskService::new(vec![broker.url.clone()], None, GrpcTaskServiceConfig::default()).unwrap();
    let task = service
        .get_task(None, Some("taskworker".to_string()))
        .await
        .unwrap()
        .expect("an activation");

    assert_eq!(task.id, ids[0]);
    assert_eq!(task.namespace, "examples");
    assert_eq!(task.taskname, "say_hello");
    assert_eq!(task.retry_state.max_attempts, 3);
    assert_eq!(
        task.decode_parameters().unwrap().kwarg::<String>("name").unwrap().as_deref(),
        Some("worker-0")
    );
    assert_eq!(store.status_of(&task.id), Some(TaskStatus::Processing));

    service.complete_task(&task.id).await.unwrap();
    assert_eq!(store.status_of(&task.id), Some(TaskStatus::Complete));

    // a repeated report of the same status is harmless
    service.set_task_status(&task.id, TaskStatus::Complete).await.unwrap();
}

#[tokio::test]
async fn test_empty_broker_means_no_work() {
    let broker = start_broker(LocalBroker::new(Arc::new(PendingTaskStore::new()))).await;
    let service = GrpcTaskService::new(vec![broker.url.clone()], None, GrpcTaskServiceConfig::default()).unwrap();

    assert!(service.get_task(None, None).await.unwrap().is_none());
    assert!(service.get_task(Some(0), Some("other".into())).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_is_redelivered_with_next_attempt() {
    let store = Arc::new(PendingTaskStore::new());
    let ids = enqueue(&store, 1);
    let broker = start_broker(LocalBroker::new(store.clone())).await;
    let service = GrpcTaskService::new(vec![broker.url.clone()], None, GrpcTaskServiceConfig::default()).unwrap();

    let first = service.get_task(None, None).await.unwrap().unwrap();
    service.set_task_status(&first.id, TaskStatus::Retry).await.unwrap();

    let second = service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(second.id, ids[0]);
    assert_eq!(second.attempt(), first.attempt() + 1);

    let err = service.set_task_status("missing", TaskStatus::Complete).await.unwrap_err();
    assert!(matches!(err, TaskworkerError::Rpc { code: tonic::Code::NotFound, .. }));
}

#[tokio::test]
async fn test_rpc_secret_is_enforced() {
    let store = Arc::new(PendingTaskStore::new());
    enqueue(&store, 1);
    let broker = start_broker(LocalBroker::new(store).with_rpc_secret(Some("s3cret".into()))).await;

    let anonymous = GrpcTaskService::new(vec![broker.url.clone()], None, GrpcTaskServiceConfig::default()).unwrap();
    let err = anonymous.get_task(None, None).await.unwrap_err();
    assert!(matches!(err, TaskworkerError::Rpc { code: tonic::Code::Unauthenticated, .. }));
    assert!(!err.is_connection_error());

    let authorized = GrpcTaskService::new(
        vec![broker.url.clone()],
        Some("s3cret".into()),
        GrpcTaskServiceConfig::default(),
    )
    .unwrap();
    assert!(authorized.get_task(None, None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_connection_rebalances_across_hosts() {
    let store = Arc::new(PendingTaskStore::new());
    enqueue(&store, 4);
    let first = start_broker(LocalBroker::new(store.clone())).await;
    let second = start_broker(LocalBroker::new(store.clone())).await;

    let service = GrpcTaskService::new(
        vec![first.url.clone(), second.url.clone()],
        None,
        GrpcTaskServiceConfig::default().with_rebalance_after(2),
    )
    .unwrap();

    assert_eq!(service.current_host().as_deref(), Some(first.url.as_str()));
    service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(service.current_host().as_deref(), Some(first.url.as_str()));
    service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(service.current_host().as_deref(), Some(second.url.as_str()));

    service.get_task(None, None).await.unwrap().unwrap();
    service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(service.current_host().as_deref(), Some(first.url.as_str()));
    assert_eq!(store.counts().processing, 4);
}

#[tokio::test]
async fn test_reports_go_to_the_host_that_handed_out_the_activation() {
    let first_store = Arc::new(PendingTaskStore::new());
    let second_store = Arc::new(PendingTaskStore::new());
    let first_ids = enqueue(&first_store, 2);
    let second_ids = enqueue(&second_store, 1);
    let first = start_broker(LocalBroker::new(first_store.clone())).await;
    let second = start_broker(LocalBroker::new(second_store.clone())).await;

    let service = GrpcTaskService::new(
        vec![first.url.clone(), second.url.clone()],
        None,
        GrpcTaskServiceConfig::default().with_rebalance_after(1),
    )
    .unwrap();

    // every fetch moves the connection to the other host
    let a = service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(a.id, first_ids[0]);
    assert_eq!(service.current_host().as_deref(), Some(second.url.as_str()));
    let b = service.get_task(None, None).await.unwrap().unwrap();
    assert_eq!(b.id, second_ids[0]);
    assert_eq!(service.current_host().as_deref(), Some(first.url.as_str()));
    assert_eq!(service.host_for_task(&a.id).as_deref(), Some(first.url.as_str()));
    assert_eq!(service.host_for_task(&b.id).as_deref(), Some(second.url.as_str()));

    // report in the opposite order to where the connection points
    service.complete_task(&b.id).await.unwrap();
    service.set_task_status(&a.id, TaskStatus::Retry).await.unwrap();

    assert_eq!(second_store.status_of(&b.id), Some(TaskStatus::Complete));
    assert_eq!(first_store.status_of(&a.id), Some(TaskStatus::Pending));
    assert_eq!(service.host_for_task(&a.id), None);
    assert_eq!(service.host_for_task(&b.id), None);

    // the retry went back on the first broker's queue
    assert_eq!(first_store.counts().pending, 2);
    assert_eq!(second_store.counts().complete, 1);
}
