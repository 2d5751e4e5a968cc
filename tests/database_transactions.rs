use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_lock::Mutex as AsyncMutex;
use firebase_rtdb_sync::database::{
    Database, DatabaseErrorCode, DatabaseReference, DatabaseSettings, MemoryServer, MergeRequest,
    Path, PutRequest, PutStatus, ServerUpdateSink, TransactionOptions, TransactionResult, Transport,
};
use firebase_rtdb_sync::database::DatabaseResult;
use futures::future::{self, BoxFuture};
use serde_json::{json, Value};

/// Records every command it receives and answers puts from a script,
/// defaulting to `ok`. Never pushes data back.
#[derive(Default)]
struct RecordingTransport {
    events: Arc<AsyncMutex<Vec<String>>>,
    statuses: Mutex<VecDeque<PutStatus>>,
}

impl RecordingTransport {
    fn scripted(statuses: impl IntoIterator<Item = PutStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    fn record(&self, event: String) {
        self.events
            .try_lock()
            .expect("events are never held across an await")
            .push(event);
    }

    async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }

    fn answer(&self) -> BoxFuture<'static, PutStatus> {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PutStatus::Ok);
        Box::pin(future::ready(status))
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    fn attach(&self, _sink: ServerUpdateSink) {}

    async fn connect(&self) -> DatabaseResult<()> {
        self.events.lock().await.push("connect".to_string());
        Ok(())
    }

    async fn disconnect(&self) -> DatabaseResult<()> {
        self.events.lock().await.push("disconnect".to_string());
        Ok(())
    }

    async fn listen(&self, path: &Path) -> DatabaseResult<()> {
        self.events.lock().await.push(format!("listen {path}"));
        Ok(())
    }

    async fn unlisten(&self, path: &Path) -> DatabaseResult<()> {
        self.events.lock().await.push(format!("unlisten {path}"));
        Ok(())
    }

    fn put(&self, request: PutRequest) -> BoxFuture<'static, PutStatus> {
        self.record(format!("put {} {}", request.path, request.data));
        self.answer()
    }

    fn merge(&self, request: MergeRequest) -> BoxFuture<'static, PutStatus> {
        self.record(format!("merge {}", request.path));
        self.answer()
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn recording(transport: &Arc<RecordingTransport>) -> Database {
    Database::new(transport.clone(), DatabaseSettings::default())
}

fn increment(current: Value) -> Option<Value> {
    Some(json!(current.as_i64().unwrap_or(0) + 1))
}

type Outcomes = Arc<Mutex<Vec<(usize, DatabaseResult<TransactionResult>)>>>;

fn start_tagged(
    reference: &DatabaseReference,
    tag: usize,
    outcomes: &Outcomes,
    update: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
) {
    let sink = Arc::clone(outcomes);
    reference
        .start_transaction(update, TransactionOptions::default(), move |result| {
            sink.lock().unwrap().push((tag, result));
        })
        .unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn concurrent_increments_all_commit() {
    let server = MemoryServer::new();
    server.set_latency(Duration::from_millis(1));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let counter = database.reference("counters/x").unwrap();

    let results = future::join_all((0..3).map(|_| counter.run_transaction(increment))).await;

    assert_eq!(server.value(counter.path()), json!(3));
    let mut committed: Vec<Value> = results
        .into_iter()
        .map(|result| {
            let result = result.unwrap();
            assert!(result.committed);
            result.snapshot.into_value()
        })
        .collect();
    committed.sort_by_key(|value| value.as_i64());
    assert_eq!(committed, [json!(1), json!(2), json!(3)]);
}

#[tokio::test(flavor = "current_thread")]
async fn direct_write_aborts_a_queued_transaction() {
    let transport = Arc::new(RecordingTransport::default());
    let database = recording(&transport);
    let target = database.reference("a/b").unwrap();

    let pending = target.run_transaction(|_| Some(json!(5)));
    let written = database.reference("a").unwrap().set(json!({"other": true}));

    let error = pending.await.unwrap_err();
    assert_eq!(error.code, DatabaseErrorCode::TransactionAborted);
    assert_eq!(error.abort_reason(), Some("set"));
    written.await.unwrap();
    settle().await;

    let puts: Vec<String> = transport
        .events()
        .await
        .into_iter()
        .filter(|event| event.starts_with("put"))
        .collect();
    assert_eq!(puts, [r#"put /a {"other":true}"#]);
}

#[tokio::test(flavor = "current_thread")]
async fn declined_transaction_never_reaches_the_transport() {
    let transport = Arc::new(RecordingTransport::default());
    let database = recording(&transport);
    let calls = Arc::new(Mutex::new(0));
    let counted = Arc::clone(&calls);

    let result = database
        .reference("x")
        .unwrap()
        .run_transaction(move |_| {
            *counted.lock().unwrap() += 1;
            None
        })
        .await
        .unwrap();
    settle().await;

    assert!(!result.committed);
    assert!(!result.snapshot.exists());
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(transport.events().await, ["connect"]);
}

#[tokio::test(flavor = "current_thread")]
async fn nested_transactions_are_sent_as_one_put() {
    let transport = Arc::new(RecordingTransport::default());
    let database = recording(&transport);
    let parent = database.reference("p").unwrap();
    let child = parent.child("child").unwrap();

    let first = parent.run_transaction(|_| Some(json!({"a": 1})));
    let second = child.run_transaction(|_| Some(json!("c")));
    let (first, second) = future::join(first, second).await;
    assert!(first.unwrap().committed);
    assert!(second.unwrap().committed);

    let puts: Vec<String> = transport
        .events()
        .await
        .into_iter()
        .filter(|event| event.starts_with("put"))
        .collect();
    assert_eq!(puts, [r#"put /p {"a":1,"child":"c"}"#]);
}

#[tokio::test(flavor = "current_thread")]
async fn completions_follow_creation_order() {
    let server = MemoryServer::new();
    server.set_latency(Duration::from_millis(5));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let outcomes = Outcomes::default();
    let a = database.reference("a").unwrap();
    let b = a.child("b").unwrap();

    start_tagged(&a, 0, &outcomes, |_| Some(json!({"b": 0})));
    settle().await;
    start_tagged(&b, 1, &outcomes, increment);
    start_tagged(&a, 2, &outcomes, |current| {
        let b = current.get("b").and_then(Value::as_i64).unwrap_or(0);
        Some(json!({"b": b * 10}))
    });
    settle().await;
    settle().await;

    let outcomes = outcomes.lock().unwrap();
    let tags: Vec<usize> = outcomes.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, [0, 1, 2]);
    assert!(outcomes.iter().all(|(_, result)| result.as_ref().unwrap().committed));
    assert_eq!(server.value(a.path()), json!({"b": 10}));
}

#[tokio::test(flavor = "current_thread")]
async fn each_transaction_completes_and_releases_its_listen_once() {
    let transport = Arc::new(RecordingTransport::scripted([
        PutStatus::DataStale,
        PutStatus::DataStale,
        PutStatus::Ok,
    ]));
    let database = recording(&transport);
    let outcomes = Outcomes::default();

    start_tagged(&database.reference("x").unwrap(), 0, &outcomes, increment);
    settle().await;

    assert_eq!(outcomes.lock().unwrap().len(), 1);
    let events = transport.events().await;
    let count = |prefix: &str| events.iter().filter(|event| event.starts_with(prefix)).count();
    assert_eq!(count("listen /x"), 1);
    assert_eq!(count("unlisten /x"), 1);
    assert_eq!(count("put /x"), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn reruns_converge_after_stale_rejections() {
    let server = MemoryServer::with_data(json!({"n": 10}));
    server.script_statuses([PutStatus::DataStale, PutStatus::DataStale]);
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let n = database.reference("n").unwrap();

    let first = n.run_transaction(increment);
    server.set(n.path(), json!(100));
    let second = n.run_transaction(increment);
    let (first, second) = future::join(first, second).await;

    assert!(first.unwrap().committed);
    assert!(second.unwrap().committed);
    assert_eq!(server.value(n.path()), json!(102));
    assert_eq!(n.get().unwrap().value(), &json!(102));
}

#[tokio::test(flavor = "current_thread")]
async fn exhausted_retries_abort_without_resending() {
    let server = MemoryServer::new();
    server.script_statuses(std::iter::repeat(PutStatus::DataStale).take(30));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let target = database.reference("contended").unwrap();

    let error = target.run_transaction(increment).await.unwrap_err();
    settle().await;

    assert_eq!(error.abort_reason(), Some("maxretry"));
    assert_eq!(server.writes().len(), 25);
    assert!(!target.get().unwrap().exists());
}

#[tokio::test(flavor = "current_thread")]
async fn server_rejection_is_reported_with_its_status() {
    let server = MemoryServer::with_data(json!({"locked": "v"}));
    server.script_statuses([PutStatus::from_code("permission_denied")]);
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let locked = database.reference("locked").unwrap();

    let error = locked.run_transaction(|_| Some(json!("mine"))).await.unwrap_err();
    settle().await;

    assert_eq!(error.abort_reason(), Some("permission_denied"));
    assert_eq!(locked.get().unwrap().value(), &json!("v"));
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_results_are_rejected_before_queueing() {
    let transport = Arc::new(RecordingTransport::default());
    let database = recording(&transport);

    let error = database
        .reference("x")
        .unwrap()
        .run_transaction(|_| Some(json!({"$bad": 1})))
        .await
        .unwrap_err();
    settle().await;

    assert_eq!(error.code, DatabaseErrorCode::InvalidArgument);
    assert_eq!(transport.events().await, ["connect"]);
}

#[tokio::test(flavor = "current_thread")]
async fn hidden_transactions_only_show_the_confirmed_value() {
    let server = MemoryServer::with_data(json!({"score": 1}));
    server.set_latency(Duration::from_millis(5));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let score = database.reference("score").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _registration = score
        .on_value(move |snapshot| sink.lock().unwrap().push(snapshot.into_value()))
        .unwrap();
    settle().await;

    let pending = score.run_transaction_with_options(
        |current| Some(json!(current.as_i64().unwrap_or(0) * 2)),
        TransactionOptions {
            apply_locally: false,
        },
    );
    assert_eq!(score.get().unwrap().value(), &json!(1));
    let result = pending.await.unwrap();
    settle().await;

    assert!(result.committed);
    assert_eq!(*seen.lock().unwrap(), vec![Value::Null, json!(1), json!(2)]);
}

#[tokio::test(flavor = "current_thread")]
async fn offline_transactions_are_sent_on_reconnect() {
    let server = MemoryServer::with_data(json!({"visits": 7}));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let visits = database.reference("visits").unwrap();
    settle().await;
    database.go_offline().await.unwrap();

    let pending = visits.run_transaction(increment);
    settle().await;
    assert_eq!(server.value(visits.path()), json!(7));

    database.go_online().await.unwrap();
    let result = pending.await.unwrap();
    assert!(result.committed);
    assert_eq!(server.value(visits.path()), json!(8));
}

#[tokio::test(flavor = "current_thread")]
async fn update_reading_the_database_gets_an_error() {
    let server = MemoryServer::with_data(json!({"config": {"step": 5}, "counter": 1}));
    let database = Database::with_memory_server(&server, DatabaseSettings::default());
    let counter = database.reference("counter").unwrap();
    let step = database.reference("config/step").unwrap();
    settle().await;

    let reads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reads);
    let pending = counter.run_transaction(move |current| {
        let read = step.get().map(|snapshot| snapshot.into_value());
        sink.lock().unwrap().push(read.map_err(|err| err.code));
        increment(current)
    });
    let result = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .unwrap()
        .unwrap();

    assert!(result.committed);
    assert_eq!(server.value(counter.path()), json!(2));
    let reads = reads.lock().unwrap();
    assert!(!reads.is_empty());
    assert!(reads
        .iter()
        .all(|read| *read == Err(DatabaseErrorCode::InvalidArgument)));
    assert_eq!(counter.get().unwrap().value(), &json!(2));
}
