use std::fmt;

use async_channel::Sender;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::database::error::DatabaseResult;
use crate::database::path::Path;
use crate::database::repo::RepoTask;

/// A write sent to the server. `hash` makes the write conditional on the
/// server still holding data with that hash at `path`.
#[derive(Clone, Debug, PartialEq)]
pub struct PutRequest {
    pub path: Path,
    pub data: Value,
    pub hash: Option<String>,
}

/// A multi-location update below `path`. Children are relative to `path`.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeRequest {
    pub path: Path,
    pub children: Vec<(Path, Value)>,
}

/// Outcome of a put, as reported by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutStatus {
    Ok,
    /// The conditional hash no longer matches the server's data.
    DataStale,
    /// Any other status token, kept verbatim.
    Failed(String),
}

impl PutStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "ok" => PutStatus::Ok,
            "datastale" => PutStatus::DataStale,
            other => PutStatus::Failed(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PutStatus::Ok => "ok",
            PutStatus::DataStale => "datastale",
            PutStatus::Failed(code) => code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PutStatus::Ok)
    }
}

impl fmt::Display for PutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle a transport uses to push authoritative data into a repo.
#[derive(Clone)]
pub struct ServerUpdateSink {
    sender: Sender<RepoTask>,
}

impl fmt::Debug for ServerUpdateSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerUpdateSink")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl ServerUpdateSink {
    pub(crate) fn new(sender: Sender<RepoTask>) -> Self {
        Self { sender }
    }

    /// Reports the server's data at `path`. Returns `false` once the repo
    /// behind this sink has shut down.
    pub fn data_update(&self, path: Path, data: Value) -> bool {
        self.sender
            .try_send(RepoTask::ServerUpdate { path, data })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Connection to the authoritative server.
///
/// Implementations answer listens by pushing the current data (and later
/// changes) for the listened path through the attached [`ServerUpdateSink`].
/// When a put changes a listened path, the data update must reach the sink
/// before the put resolves.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Hands the transport the sink for server data. Called once per repo.
    fn attach(&self, sink: ServerUpdateSink);

    async fn connect(&self) -> DatabaseResult<()>;

    async fn disconnect(&self) -> DatabaseResult<()>;

    async fn listen(&self, path: &Path) -> DatabaseResult<()>;

    async fn unlisten(&self, path: &Path) -> DatabaseResult<()>;

    /// Sends a write. The request is handed over before this returns, so
    /// writes reach the server in call order; the future resolves with the
    /// server's answer.
    fn put(&self, request: PutRequest) -> BoxFuture<'static, PutStatus>;

    fn merge(&self, request: MergeRequest) -> BoxFuture<'static, PutStatus>;
}
