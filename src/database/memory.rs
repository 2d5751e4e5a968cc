//! In-process authoritative server.
//!
//! [`MemoryServer`] holds the authoritative tree and hands out
//! [`MemoryTransport`] clients. Clients start offline and can be taken
//! offline again; writes made while offline are held and delivered in order
//! on reconnect. Conditional puts are checked against the hash of the data
//! they were computed from, and every accepted change is pushed to the
//! clients listening on a related path before the write resolves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::database::error::DatabaseResult;
use crate::database::logger::LOGGER;
use crate::database::node::{export_value, get_at, node_hash, normalize, set_at};
use crate::database::path::Path;
use crate::database::server_value::{resolve_deferred_values, ServerValues};
use crate::database::transport::{MergeRequest, PutRequest, PutStatus, ServerUpdateSink, Transport};
use crate::platform::runtime::sleep;

/// A write as received by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerWrite {
    Put(PutRequest),
    Merge(MergeRequest),
}

impl ServerWrite {
    pub fn path(&self) -> &Path {
        match self {
            ServerWrite::Put(request) => &request.path,
            ServerWrite::Merge(request) => &request.path,
        }
    }
}

#[derive(Default)]
struct ClientState {
    sink: Option<ServerUpdateSink>,
    listens: Vec<Path>,
    online: bool,
    held: Vec<(ServerWrite, oneshot::Sender<PutStatus>)>,
}

#[derive(Default)]
struct ServerState {
    data: Value,
    clients: Vec<ClientState>,
    scripted: VecDeque<PutStatus>,
    latency: Duration,
    received: Vec<ServerWrite>,
}

impl ServerState {
    fn process(&mut self, write: ServerWrite) -> PutStatus {
        self.received.push(write.clone());
        if let Some(status) = self.scripted.pop_front() {
            if !status.is_ok() {
                LOGGER.debug(format!("memory server answers {status} for {}", write.path()));
                return status;
            }
        }
        let server_values = ServerValues::now();
        let changed = match write {
            ServerWrite::Put(request) => {
                let existing = get_at(&self.data, &request.path);
                if let Some(expected) = &request.hash {
                    if node_hash(&existing) != *expected {
                        return PutStatus::DataStale;
                    }
                }
                let resolved =
                    resolve_deferred_values(normalize(request.data), &existing, &server_values);
                set_at(&mut self.data, &request.path, resolved);
                request.path
            }
            ServerWrite::Merge(request) => {
                for (relative, value) in request.children {
                    let target = request.path.join(&relative);
                    let existing = get_at(&self.data, &target);
                    let resolved =
                        resolve_deferred_values(normalize(value), &existing, &server_values);
                    set_at(&mut self.data, &target, resolved);
                }
                request.path
            }
        };
        self.broadcast(&changed);
        PutStatus::Ok
    }

    /// Pushes the current data of every listen related to `changed` to the
    /// online clients holding it.
    fn broadcast(&self, changed: &Path) {
        for client in self.clients.iter().filter(|client| client.online) {
            for listened in &client.listens {
                if listened.is_related(changed) {
                    self.send(client, listened);
                }
            }
        }
    }

    fn send(&self, client: &ClientState, listened: &Path) {
        if let Some(sink) = &client.sink {
            if !sink.data_update(listened.clone(), get_at(&self.data, listened)) {
                LOGGER.debug(format!("client for {listened} has shut down"));
            }
        }
    }
}

/// Authoritative data shared by any number of [`MemoryTransport`] clients.
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        let server = Self::new();
        server.lock().data = normalize(data);
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new client. It connects when its repo goes online.
    pub fn client(&self) -> MemoryTransport {
        let mut state = self.lock();
        state.clients.push(ClientState::default());
        MemoryTransport {
            server: self.clone(),
            client: state.clients.len() - 1,
        }
    }

    /// Exported data at `path`.
    pub fn value(&self, path: &Path) -> Value {
        export_value(&get_at(&self.lock().data, path))
    }

    /// Writes directly on the server, as another party would.
    pub fn set(&self, path: &Path, value: Value) {
        let mut state = self.lock();
        let existing = get_at(&state.data, path);
        let resolved = resolve_deferred_values(normalize(value), &existing, &ServerValues::now());
        set_at(&mut state.data, path, resolved);
        state.broadcast(path);
    }

    /// Answers the next writes with `statuses`, in order. A scripted status
    /// other than `ok` rejects the write without applying it.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = PutStatus>) {
        self.lock().scripted.extend(statuses);
    }

    /// Delay between applying a write and resolving its response.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Every write received so far, accepted or not.
    pub fn writes(&self) -> Vec<ServerWrite> {
        self.lock().received.clone()
    }
}

/// One client connection to a [`MemoryServer`].
pub struct MemoryTransport {
    server: MemoryServer,
    client: usize,
}

impl MemoryTransport {
    fn submit(&self, write: ServerWrite) -> BoxFuture<'static, PutStatus> {
        let mut state = self.server.lock();
        let latency = state.latency;
        let online = state
            .clients
            .get(self.client)
            .map(|client| client.online)
            .unwrap_or(false);
        if online {
            let status = state.process(write);
            return Box::pin(async move {
                sleep(latency).await;
                status
            });
        }
        let (sender, receiver) = oneshot::channel();
        if let Some(client) = state.clients.get_mut(self.client) {
            client.held.push((write, sender));
        }
        Box::pin(async move {
            receiver
                .await
                .unwrap_or_else(|_| PutStatus::Failed("disconnect".to_string()))
        })
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn attach(&self, sink: ServerUpdateSink) {
        if let Some(client) = self.server.lock().clients.get_mut(self.client) {
            client.sink = Some(sink);
        }
    }

    async fn connect(&self) -> DatabaseResult<()> {
        let mut state = self.server.lock();
        let held = match state.clients.get_mut(self.client) {
            Some(client) if !client.online => {
                client.online = true;
                std::mem::take(&mut client.held)
            }
            _ => return Ok(()),
        };
        if let Some(client) = state.clients.get(self.client) {
            for listened in &client.listens {
                state.send(client, listened);
            }
        }
        for (write, responder) in held {
            let status = state.process(write);
            let _ = responder.send(status);
        }
        Ok(())
    }

    async fn disconnect(&self) -> DatabaseResult<()> {
        if let Some(client) = self.server.lock().clients.get_mut(self.client) {
            client.online = false;
        }
        Ok(())
    }

    async fn listen(&self, path: &Path) -> DatabaseResult<()> {
        let mut state = self.server.lock();
        let online = match state.clients.get_mut(self.client) {
            Some(client) => {
                client.listens.push(path.clone());
                client.online
            }
            None => return Ok(()),
        };
        if online {
            if let Some(client) = state.clients.get(self.client) {
                state.send(client, path);
            }
        }
        Ok(())
    }

    async fn unlisten(&self, path: &Path) -> DatabaseResult<()> {
        if let Some(client) = self.server.lock().clients.get_mut(self.client) {
            if let Some(index) = client.listens.iter().position(|listened| listened == path) {
                client.listens.remove(index);
            }
        }
        Ok(())
    }

    fn put(&self, request: PutRequest) -> BoxFuture<'static, PutStatus> {
        self.submit(ServerWrite::Put(request))
    }

    fn merge(&self, request: MergeRequest) -> BoxFuture<'static, PutStatus> {
        self.submit(ServerWrite::Merge(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::RepoTask;
    use async_channel::Receiver;
    use serde_json::json;

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn attached(server: &MemoryServer) -> (MemoryTransport, Receiver<RepoTask>) {
        let (sender, receiver) = async_channel::unbounded();
        let transport = server.client();
        transport.attach(ServerUpdateSink::new(sender));
        (transport, receiver)
    }

    fn updates(receiver: &Receiver<RepoTask>) -> Vec<(String, Value)> {
        let mut seen = Vec::new();
        while let Ok(task) = receiver.try_recv() {
            if let RepoTask::ServerUpdate { path, data } = task {
                seen.push((path.to_string(), data));
            }
        }
        seen
    }

    fn put(at: &str, data: Value, hash: Option<String>) -> PutRequest {
        PutRequest {
            path: path(at),
            data,
            hash,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn conditional_put_checks_the_hash() {
        let server = MemoryServer::with_data(json!({"n": 1}));
        let (transport, _updates) = attached(&server);
        transport.connect().await.unwrap();

        let stale = transport.put(put("n", json!(5), Some(node_hash(&json!(0))))).await;
        assert_eq!(stale, PutStatus::DataStale);
        let fresh = transport.put(put("n", json!(2), Some(node_hash(&json!(1))))).await;
        assert_eq!(fresh, PutStatus::Ok);
        assert_eq!(server.value(&path("n")), json!(2));
        assert_eq!(server.writes().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn changes_reach_related_listeners() {
        let server = MemoryServer::with_data(json!({"a": {"b": 1}, "c": 2}));
        let (writer, _) = attached(&server);
        let (reader, receiver) = attached(&server);
        writer.connect().await.unwrap();
        reader.connect().await.unwrap();
        reader.listen(&path("a")).await.unwrap();
        reader.listen(&path("c")).await.unwrap();
        assert_eq!(
            updates(&receiver),
            [("/a".to_string(), json!({"b": 1})), ("/c".to_string(), json!(2))]
        );

        writer.put(put("a/b", json!(3), None)).await;
        writer
            .merge(MergeRequest {
                path: Path::root(),
                children: vec![(path("c"), json!(4))],
            })
            .await;
        assert_eq!(
            updates(&receiver),
            [("/a".to_string(), json!({"b": 3})), ("/c".to_string(), json!(4))]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn offline_writes_are_held_until_connect() {
        let server = MemoryServer::new();
        let (transport, receiver) = attached(&server);
        transport.listen(&path("x")).await.unwrap();
        let response = transport.put(put("x", json!("queued"), None));
        assert!(server.writes().is_empty());
        assert!(updates(&receiver).is_empty());

        transport.connect().await.unwrap();
        assert_eq!(response.await, PutStatus::Ok);
        assert_eq!(
            updates(&receiver),
            [("/x".to_string(), Value::Null), ("/x".to_string(), json!("queued"))]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripted_rejection_leaves_data_untouched() {
        let server = MemoryServer::with_data(json!({"x": 1}));
        server.script_statuses([PutStatus::from_code("permission_denied")]);
        let (transport, _) = attached(&server);
        transport.connect().await.unwrap();

        let status = transport.put(put("x", json!(2), None)).await;
        assert_eq!(status, PutStatus::Failed("permission_denied".into()));
        assert_eq!(server.value(&path("x")), json!(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn server_values_resolve_on_the_server() {
        let server = MemoryServer::with_data(json!({"count": 2}));
        server.set(&path("count"), crate::database::server_value::increment(3.0));
        assert_eq!(server.value(&path("count")), json!(5));
    }
}
