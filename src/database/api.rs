use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::channel::oneshot;
use serde_json::{Map, Value};

use crate::database::error::{internal_error, invalid_argument, DatabaseResult};
use crate::database::events::{ChildCallback, ChildEventType, ListenerKind, ValueCallback};
use crate::database::logger::LOGGER;
use crate::database::memory::MemoryServer;
use crate::database::path::Path;
use crate::database::repo::{Repo, TransactionRequest, WriteCompletion};
use crate::database::settings::DatabaseSettings;
use crate::database::snapshot::DataSnapshot;
use crate::database::transaction::{TransactionOptions, TransactionResult};
use crate::database::transport::Transport;

/// Handle to one database: its local cache, pending writes and queued
/// transactions. Clones share the same state.
#[derive(Clone)]
pub struct Database {
    repo: Arc<Repo>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("settings", self.repo.settings())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseReference {
    database: Database,
    path: Path,
}

/// RAII-style listener registration; dropping the handle detaches the
/// underlying listener.
pub struct ListenerRegistration {
    repo: Arc<Repo>,
    id: Option<u64>,
}

impl ListenerRegistration {
    fn new(repo: Arc<Repo>, id: u64) -> Self {
        Self { repo, id: Some(id) }
    }

    pub fn detach(mut self) {
        if let Some(id) = self.id.take() {
            self.repo.remove_listener(id);
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.repo.remove_listener(id);
        }
    }
}

impl Database {
    /// Creates a database on top of `transport` and starts connecting.
    ///
    /// Must be called from within a tokio runtime, or the repo's background
    /// work runs on a shared fallback runtime.
    pub fn new(transport: Arc<dyn Transport>, settings: DatabaseSettings) -> Self {
        if let Some(level) = settings.log_level {
            LOGGER.set_log_level(level);
        }
        Self {
            repo: Repo::new(transport, settings),
        }
    }

    /// Creates a database backed by a new client of `server`.
    pub fn with_memory_server(server: &MemoryServer, settings: DatabaseSettings) -> Self {
        Self::new(Arc::new(server.client()), settings)
    }

    pub fn settings(&self) -> &DatabaseSettings {
        self.repo.settings()
    }

    pub fn reference(&self, path: &str) -> DatabaseResult<DatabaseReference> {
        Ok(DatabaseReference {
            database: self.clone(),
            path: Path::parse(path)?,
        })
    }

    pub async fn go_online(&self) -> DatabaseResult<()> {
        self.repo.go_online().await
    }

    /// Disconnects the transport. Local writes and transactions keep
    /// queueing and are delivered when the database goes online again.
    pub async fn go_offline(&self) -> DatabaseResult<()> {
        self.repo.go_offline().await
    }
}

fn write_completion() -> (
    WriteCompletion,
    impl Future<Output = DatabaseResult<()>> + Send + 'static,
) {
    let (sender, receiver) = oneshot::channel();
    let completion: WriteCompletion = Box::new(move |result| {
        let _ = sender.send(result);
    });
    let outcome = async move {
        receiver
            .await
            .unwrap_or_else(|_| Err(internal_error("write was dropped before it completed")))
    };
    (completion, outcome)
}

impl DatabaseReference {
    pub fn child(&self, relative: &str) -> DatabaseResult<DatabaseReference> {
        let relative = Path::parse(relative)?;
        Ok(DatabaseReference {
            database: self.database.clone(),
            path: self.path.join(&relative),
        })
    }

    /// Returns the parent of this reference, `None` at the root.
    pub fn parent(&self) -> Option<DatabaseReference> {
        self.path.parent().map(|path| DatabaseReference {
            database: self.database.clone(),
            path,
        })
    }

    pub fn root(&self) -> DatabaseReference {
        DatabaseReference {
            database: self.database.clone(),
            path: Path::root(),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Latest local state, pending writes included.
    ///
    /// Fails when called from inside a transaction update function.
    pub fn get(&self) -> DatabaseResult<DataSnapshot> {
        self.database.repo.get(&self.path)
    }

    /// Replaces the data at this location.
    ///
    /// The write is applied locally before this returns; the returned future
    /// resolves once the server accepts or rejects it.
    pub fn set(&self, value: Value) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        self.write(value, None)
    }

    pub fn set_with_priority(
        &self,
        value: Value,
        priority: Value,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        self.write(value, Some(priority))
    }

    pub fn remove(&self) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        self.write(Value::Null, None)
    }

    fn write(
        &self,
        value: Value,
        priority: Option<Value>,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let (completion, outcome) = write_completion();
        let started = self
            .database
            .repo
            .set(self.path.clone(), value, priority, completion);
        async move {
            started?;
            outcome.await
        }
    }

    /// Writes several descendants at once. Keys are paths relative to this
    /// location; siblings that are not named keep their data.
    pub fn update(
        &self,
        values: Map<String, Value>,
    ) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
        let (completion, outcome) = write_completion();
        let started = parse_update_paths(values).and_then(|children| {
            self.database
                .repo
                .update(self.path.clone(), children, completion)
        });
        async move {
            started?;
            outcome.await
        }
    }

    pub fn on_value<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DataSnapshot) + Send + Sync + 'static,
    {
        let callback: ValueCallback = Arc::new(callback);
        self.listen(ListenerKind::Value(callback))
    }

    pub fn on_child_added<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DataSnapshot, Option<String>) + Send + Sync + 'static,
    {
        self.listen_children(ChildEventType::Added, Arc::new(callback))
    }

    pub fn on_child_changed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DataSnapshot, Option<String>) + Send + Sync + 'static,
    {
        self.listen_children(ChildEventType::Changed, Arc::new(callback))
    }

    pub fn on_child_removed<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DataSnapshot, Option<String>) + Send + Sync + 'static,
    {
        self.listen_children(ChildEventType::Removed, Arc::new(callback))
    }

    fn listen_children(
        &self,
        event: ChildEventType,
        callback: ChildCallback,
    ) -> DatabaseResult<ListenerRegistration> {
        self.listen(ListenerKind::Child { event, callback })
    }

    fn listen(&self, kind: ListenerKind) -> DatabaseResult<ListenerRegistration> {
        let repo = Arc::clone(&self.database.repo);
        let id = repo.add_listener(self.path.clone(), kind)?;
        Ok(ListenerRegistration::new(repo, id))
    }

    /// Atomically modifies the data at this location.
    ///
    /// `update` receives the current value and returns the new one, or
    /// `None` to leave the data untouched. It may run several times, and
    /// must not have side effects. A result that fails validation is
    /// reported synchronously through the returned future without being
    /// queued.
    pub fn run_transaction<F>(
        &self,
        update: F,
    ) -> impl Future<Output = DatabaseResult<TransactionResult>> + Send + 'static
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        let options = TransactionOptions {
            apply_locally: self.database.settings().apply_locally,
        };
        self.run_transaction_with_options(update, options)
    }

    pub fn run_transaction_with_options<F>(
        &self,
        update: F,
        options: TransactionOptions,
    ) -> impl Future<Output = DatabaseResult<TransactionResult>> + Send + 'static
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let started = self.start_transaction(update, options, move |result| {
            let _ = sender.send(result);
        });
        async move {
            started?;
            receiver
                .await
                .unwrap_or_else(|_| Err(internal_error("transaction was dropped before it completed")))
        }
    }

    /// Callback form of [`run_transaction`](Self::run_transaction).
    /// `on_complete` runs exactly once unless this returns an error.
    pub fn start_transaction<F, C>(
        &self,
        update: F,
        options: TransactionOptions,
        on_complete: C,
    ) -> DatabaseResult<()>
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
        C: FnOnce(DatabaseResult<TransactionResult>) + Send + 'static,
    {
        self.database.repo.start_transaction(TransactionRequest {
            path: self.path.clone(),
            update: Arc::new(update),
            completion: Box::new(on_complete),
            apply_locally: options.apply_locally,
        })
    }
}

/// Parses the keys of an update and rejects overlapping locations.
fn parse_update_paths(values: Map<String, Value>) -> DatabaseResult<Vec<(Path, Value)>> {
    let mut children = Vec::with_capacity(values.len());
    for (key, value) in values {
        let relative = Path::parse(&key)?;
        if relative.is_root() {
            return Err(invalid_argument(
                "update failed: the root of the update cannot be one of its keys",
            ));
        }
        children.push((relative, value));
    }
    let mut sorted: Vec<&Path> = children.iter().map(|(path, _)| path).collect();
    sorted.sort_by_key(|path| path.segments().to_vec());
    for pair in sorted.windows(2) {
        if pair[0].contains(pair[1]) {
            return Err(invalid_argument(format!(
                "update failed: path {} is an ancestor of {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(children)
}

/// Free-function form of [`DatabaseReference::run_transaction`].
pub fn run_transaction<F>(
    reference: &DatabaseReference,
    update: F,
) -> impl Future<Output = DatabaseResult<TransactionResult>> + Send + 'static
where
    F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
{
    reference.run_transaction(update)
}

/// Free-function form of [`DatabaseReference::set_with_priority`].
pub fn set_with_priority(
    reference: &DatabaseReference,
    value: Value,
    priority: Value,
) -> impl Future<Output = DatabaseResult<()>> + Send + 'static {
    reference.set_with_priority(value, priority)
}
