//! The repo owns all client-side state of one database: the server cache and
//! pending writes, the transaction queue, the listener registry and the
//! reference counted listens held on the transport.
//!
//! State lives behind one mutex. Each entry point mutates it in a single
//! critical section that records its side effects in [`Effects`]. Tasks and
//! deliveries are queued before the lock is released, so they keep the order
//! of the sections that produced them; listener and completion callbacks run
//! after the release and may call back into the repo. Transaction update
//! functions run inside the section, and any repo call they make fails
//! instead of blocking on the lock. Asynchronous inputs (server data, put
//! responses, deferred releases) and outgoing writes are funnelled through
//! one task queue drained by a single worker, which keeps their processing
//! strictly sequential.

mod transactions;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_channel::{Receiver, Sender};
use serde_json::Value;

use crate::database::error::{error_for_write_status, invalid_argument, DatabaseResult};
use crate::database::events::{
    guard_callback, Delivery, DeliveryQueue, EventRegistry, ListenerKind, PendingEvent,
};
use crate::database::logger::LOGGER;
use crate::database::node::{get_at, normalize, with_priority};
use crate::database::path::Path;
use crate::database::server_value::{resolve_deferred_values, ServerValues};
use crate::database::settings::DatabaseSettings;
use crate::database::snapshot::DataSnapshot;
use crate::database::transaction::{PendingOperation, TransactionCompletion, TransactionUpdate};
use crate::database::transport::{MergeRequest, PutRequest, PutStatus, ServerUpdateSink, Transport};
use crate::database::tree::Tree;
use crate::database::validation::{validate_priority, validate_writable_data};
use crate::database::write_tree::WriteTree;
use crate::platform::runtime::spawn_detached;

/// Completion of a direct write.
pub(crate) type WriteCompletion = Box<dyn FnOnce(DatabaseResult<()>) + Send>;

/// Work processed by the repo's task queue.
pub(crate) enum RepoTask {
    Connect,
    /// Hands a write to the transport. Writes share the queue with listens
    /// so both reach the transport in submission order.
    Write { write: OutgoingWrite, target: PutTarget },
    SendReadyTransactions,
    ServerUpdate { path: Path, data: Value },
    PutResponse { target: PutTarget, status: PutStatus },
    Listen(Path),
    Unlisten(Path),
    /// Deferred release of a transaction's listen.
    Release(Path),
    /// Listener removal requested while the state lock was held.
    RemoveListener(u64),
}

/// What a put was sent for, carried back with its response.
pub(crate) enum PutTarget {
    Write {
        path: Path,
        write_id: u64,
        completion: WriteCompletion,
    },
    Transactions {
        path: Path,
        orders: Vec<u64>,
    },
}

pub(crate) enum OutgoingWrite {
    Put(PutRequest),
    Merge(MergeRequest),
}

/// Side effects collected inside a critical section.
#[derive(Default)]
pub(crate) struct Effects {
    changed_paths: Vec<Path>,
    events: Vec<PendingEvent>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
    tasks: Vec<RepoTask>,
    writes: Vec<(OutgoingWrite, PutTarget)>,
}

impl Effects {
    fn take_deliveries(&mut self) -> Vec<Delivery> {
        let events = self.events.drain(..).map(Delivery::Event);
        let callbacks = self.callbacks.drain(..).map(Delivery::Callback);
        events.chain(callbacks).collect()
    }

    fn raise_at(&mut self, path: Path) {
        if !self.changed_paths.contains(&path) {
            self.changed_paths.push(path);
        }
    }

    fn listen(&mut self, path: Path) {
        self.tasks.push(RepoTask::Listen(path));
    }

    /// A listen opened earlier in the same critical section is cancelled
    /// instead of reaching the transport.
    fn unlisten(&mut self, path: Path) {
        let opened_here = self
            .tasks
            .iter()
            .rposition(|task| matches!(task, RepoTask::Listen(listened) if *listened == path));
        match opened_here {
            Some(index) => {
                self.tasks.remove(index);
            }
            None => self.tasks.push(RepoTask::Unlisten(path)),
        }
    }
}

thread_local! {
    /// Repos whose state lock the current thread holds.
    static HELD_SECTIONS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks one repo's critical section as entered on this thread.
struct SectionMarker(usize);

impl SectionMarker {
    fn enter(repo: usize) -> DatabaseResult<Self> {
        HELD_SECTIONS.with(|held| {
            let mut held = held.borrow_mut();
            if held.contains(&repo) {
                return Err(invalid_argument(
                    "the database cannot be used from inside a transaction update function",
                ));
            }
            held.push(repo);
            Ok(SectionMarker(repo))
        })
    }
}

impl Drop for SectionMarker {
    fn drop(&mut self) {
        HELD_SECTIONS.with(|held| held.borrow_mut().retain(|repo| *repo != self.0));
    }
}

#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next_write_id: u64,
    next_order: u64,
}

impl IdAllocator {
    pub fn write_id(&mut self) -> u64 {
        self.next_write_id += 1;
        self.next_write_id
    }

    pub fn order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }
}

pub(crate) struct RepoState {
    writes: WriteTree,
    transactions: Tree<Vec<PendingOperation>>,
    events: EventRegistry,
    listens: HashMap<Path, usize>,
    ids: IdAllocator,
    max_retries: u32,
}

impl RepoState {
    fn new(settings: &DatabaseSettings) -> Self {
        Self {
            writes: WriteTree::new(),
            transactions: Tree::new(),
            events: EventRegistry::new(),
            listens: HashMap::new(),
            ids: IdAllocator::default(),
            max_retries: settings.max_transaction_retries,
        }
    }

    /// Best known data at `path` including hidden writes, minus `excluded`.
    fn latest_state(&self, path: &Path, excluded: &[u64]) -> Value {
        self.writes.calc_complete_event_cache(path, excluded, true)
    }

    /// Data at `path` as listeners see it.
    fn view(&self, path: &Path) -> Value {
        self.writes.calc_complete_event_cache(path, &[], false)
    }

    fn watch(&mut self, path: &Path, effects: &mut Effects) {
        let count = self.listens.entry(path.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            effects.listen(path.clone());
        }
    }

    fn unwatch(&mut self, path: &Path, effects: &mut Effects) {
        let Some(count) = self.listens.get_mut(path) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.listens.remove(path);
            effects.unlisten(path.clone());
        }
    }

    fn is_listened(&self, path: &Path) -> bool {
        self.listens.keys().any(|listened| listened.contains(path))
    }

    /// Acknowledges a write. Successful writes at locations without a listen
    /// are folded into the server cache, since no server update will carry
    /// them.
    fn ack_write(&mut self, write_id: u64, revert: bool) -> Option<Path> {
        let commit = !revert
            && self
                .writes
                .write_path(write_id)
                .map(|path| !self.is_listened(path))
                .unwrap_or(false);
        self.writes.ack_user_write(write_id, commit)
    }

    fn flush_events(&mut self, effects: &mut Effects) {
        if effects.changed_paths.is_empty() {
            return;
        }
        let changed = std::mem::take(&mut effects.changed_paths);
        let Self { writes, events, .. } = self;
        let raised = events.raise(&changed, |path| {
            writes.calc_complete_event_cache(path, &[], false)
        });
        effects.events.extend(raised);
    }

    fn remove_listener(&mut self, id: u64, effects: &mut Effects) {
        if let Some(path) = self.events.unregister(id) {
            self.unwatch(&path, effects);
        }
    }

    fn apply_server_update(&mut self, path: Path, data: Value, effects: &mut Effects) {
        if self.writes.apply_server_overwrite(&path, normalize(data)) {
            self.rerun_transactions(&path, effects);
            effects.raise_at(path);
        }
    }

    fn handle_write_response(
        &mut self,
        path: Path,
        write_id: u64,
        completion: WriteCompletion,
        status: PutStatus,
        effects: &mut Effects,
    ) {
        let success = status.is_ok();
        if !success {
            LOGGER.warn(format!("set at {path} failed: {status}"));
        }
        if let Some(changed) = self.ack_write(write_id, !success) {
            effects.raise_at(changed);
        }
        let result = if success {
            Ok(())
        } else {
            Err(error_for_write_status(status.as_str()))
        };
        effects.callbacks.push(Box::new(move || completion(result)));
    }
}

/// Transaction submitted through the public API.
pub(crate) struct TransactionRequest {
    pub path: Path,
    pub update: TransactionUpdate,
    pub completion: TransactionCompletion,
    pub apply_locally: bool,
}

#[derive(Debug, Default)]
enum ConnectionState {
    #[default]
    Offline,
    Online,
}

pub(crate) struct Repo {
    transport: Arc<dyn Transport>,
    settings: DatabaseSettings,
    state: Mutex<RepoState>,
    connection: Mutex<ConnectionState>,
    tasks: Sender<RepoTask>,
    deliveries: DeliveryQueue,
}

impl Repo {
    /// Creates a repo, attaches it to `transport` and schedules the initial
    /// connect on its task queue.
    pub fn new(transport: Arc<dyn Transport>, settings: DatabaseSettings) -> Arc<Self> {
        let (sender, receiver) = async_channel::unbounded();
        transport.attach(ServerUpdateSink::new(sender.clone()));
        let repo = Arc::new(Self {
            state: Mutex::new(RepoState::new(&settings)),
            transport,
            settings,
            connection: Mutex::new(ConnectionState::Offline),
            tasks: sender,
            deliveries: DeliveryQueue::new(),
        });
        spawn_detached(run_task_queue(Arc::downgrade(&repo), receiver));
        repo.schedule(RepoTask::Connect);
        repo
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    fn section_id(&self) -> usize {
        self as *const Repo as usize
    }

    /// Locks the state, failing when this thread already holds it.
    fn lock(&self) -> DatabaseResult<(SectionMarker, MutexGuard<'_, RepoState>)> {
        let marker = SectionMarker::enter(self.section_id())?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((marker, state))
    }

    /// Runs `operation` inside the critical section, then delivers its
    /// events and callbacks with the lock released.
    fn transact<R>(
        &self,
        operation: impl FnOnce(&mut RepoState, &mut Effects) -> R,
    ) -> DatabaseResult<R> {
        let mut effects = Effects::default();
        let result = {
            let (_marker, mut state) = self.lock()?;
            let result = operation(&mut state, &mut effects);
            state.flush_events(&mut effects);
            self.queue_effects(&mut effects);
            result
        };
        self.deliveries.drain();
        Ok(result)
    }

    /// Hands the section's tasks to the worker and its events and callbacks
    /// to the delivery queue. Called with the state lock held.
    fn queue_effects(&self, effects: &mut Effects) {
        for (write, target) in effects.writes.drain(..) {
            self.schedule(RepoTask::Write { write, target });
        }
        for task in effects.tasks.drain(..) {
            self.schedule(task);
        }
        self.deliveries.push(effects.take_deliveries());
    }

    fn transact_task(&self, operation: impl FnOnce(&mut RepoState, &mut Effects)) {
        if let Err(err) = self.transact(operation) {
            LOGGER.error(format!("repo task could not run: {err}"));
        }
    }

    fn schedule(&self, task: RepoTask) {
        if self.tasks.try_send(task).is_err() {
            LOGGER.debug("repo task queue is closed; dropping task");
        }
    }

    fn dispatch_write(&self, write: OutgoingWrite, target: PutTarget) {
        let response = match write {
            OutgoingWrite::Put(request) => self.transport.put(request),
            OutgoingWrite::Merge(request) => self.transport.merge(request),
        };
        let sender = self.tasks.clone();
        spawn_detached(async move {
            let status = response.await;
            if sender
                .send(RepoTask::PutResponse { target, status })
                .await
                .is_err()
            {
                LOGGER.debug("put response arrived after the repo shut down");
            }
        });
    }

    async fn handle_task(&self, task: RepoTask) {
        match task {
            RepoTask::Connect => {
                if let Err(err) = self.go_online().await {
                    LOGGER.warn(format!("failed to connect: {err}"));
                }
            }
            RepoTask::Write { write, target } => self.dispatch_write(write, target),
            RepoTask::Listen(path) => {
                if let Err(err) = self.transport.listen(&path).await {
                    LOGGER.warn(format!("listen at {path} failed: {err}"));
                }
            }
            RepoTask::Unlisten(path) => {
                if let Err(err) = self.transport.unlisten(&path).await {
                    LOGGER.warn(format!("unlisten at {path} failed: {err}"));
                }
            }
            RepoTask::SendReadyTransactions => {
                self.transact_task(|state, effects| state.send_ready_transactions(effects))
            }
            RepoTask::ServerUpdate { path, data } => {
                self.transact_task(|state, effects| state.apply_server_update(path, data, effects))
            }
            RepoTask::PutResponse { target, status } => {
                LOGGER.debug(format!("put response: {status}"));
                self.transact_task(|state, effects| match target {
                    PutTarget::Write {
                        path,
                        write_id,
                        completion,
                    } => state.handle_write_response(path, write_id, completion, status, effects),
                    PutTarget::Transactions { path, orders } => {
                        state.handle_transaction_response(path, &orders, status, effects)
                    }
                })
            }
            RepoTask::Release(path) => {
                self.transact_task(|state, effects| state.unwatch(&path, effects))
            }
            RepoTask::RemoveListener(id) => {
                self.transact_task(|state, effects| state.remove_listener(id, effects))
            }
        }
    }

    pub async fn go_online(&self) -> DatabaseResult<()> {
        let should_connect = {
            let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            matches!(*connection, ConnectionState::Offline)
        };
        if !should_connect {
            return Ok(());
        }
        self.transport.connect().await?;
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Online;
        Ok(())
    }

    pub async fn go_offline(&self) -> DatabaseResult<()> {
        let should_disconnect = {
            let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            matches!(*connection, ConnectionState::Online)
        };
        if !should_disconnect {
            return Ok(());
        }
        self.transport.disconnect().await?;
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Offline;
        Ok(())
    }

    /// Local view of `path`, pending writes included.
    pub fn get(&self, path: &Path) -> DatabaseResult<DataSnapshot> {
        let node = self.lock()?.1.view(path);
        Ok(DataSnapshot::new(path.clone(), node))
    }

    /// Writes `value` at `path`, replacing what is there.
    ///
    /// Overlapping transactions are aborted and the write is applied locally
    /// before this returns; `completion` runs once the server answers.
    pub fn set(
        &self,
        path: Path,
        value: Value,
        priority: Option<Value>,
        completion: WriteCompletion,
    ) -> DatabaseResult<()> {
        validate_writable_data("set failed: Data", &value, &path)?;
        let mut unresolved = normalize(value);
        if let Some(priority) = priority {
            validate_priority("set_with_priority failed:", &priority)?;
            unresolved = with_priority(unresolved, priority);
        }
        LOGGER.debug(format!("set {path}"));
        self.transact(|state, effects| {
            let existing = state.latest_state(&path, &[]);
            let resolved =
                resolve_deferred_values(unresolved.clone(), &existing, &ServerValues::now());
            let write_id = state.ids.write_id();
            state
                .writes
                .apply_user_overwrite(&path, resolved, write_id, true);
            effects.raise_at(path.clone());
            effects.writes.push((
                OutgoingWrite::Put(PutRequest {
                    path: path.clone(),
                    data: unresolved,
                    hash: None,
                }),
                PutTarget::Write {
                    path: path.clone(),
                    write_id,
                    completion,
                },
            ));
            let affected = state.abort_transactions(&path, effects);
            state.rerun_transactions(&affected, effects);
            effects.raise_at(affected);
        })
    }

    /// Writes each child of `children` (paths relative to `path`) without
    /// touching siblings.
    pub fn update(
        &self,
        path: Path,
        children: Vec<(Path, Value)>,
        completion: WriteCompletion,
    ) -> DatabaseResult<()> {
        let mut unresolved = Vec::with_capacity(children.len());
        for (relative, value) in children {
            let target = path.join(&relative);
            validate_writable_data("update failed: Data", &value, &target)?;
            unresolved.push((relative, normalize(value)));
        }
        if unresolved.is_empty() {
            LOGGER.debug("update() called with empty data; nothing to do");
            guard_callback("completion callback", move || completion(Ok(())));
            return Ok(());
        }
        LOGGER.debug(format!("update {path}"));
        self.transact(|state, effects| {
            let existing = state.latest_state(&path, &[]);
            let server_values = ServerValues::now();
            let resolved = unresolved
                .iter()
                .map(|(relative, value)| {
                    let base = get_at(&existing, relative);
                    (
                        relative.clone(),
                        resolve_deferred_values(value.clone(), &base, &server_values),
                    )
                })
                .collect();
            let write_id = state.ids.write_id();
            state.writes.apply_user_merge(&path, resolved, write_id);
            effects.raise_at(path.clone());
            let targets: Vec<Path> = unresolved
                .iter()
                .map(|(relative, _)| path.join(relative))
                .collect();
            effects.writes.push((
                OutgoingWrite::Merge(MergeRequest {
                    path: path.clone(),
                    children: unresolved,
                }),
                PutTarget::Write {
                    path: path.clone(),
                    write_id,
                    completion,
                },
            ));
            for target in targets {
                let affected = state.abort_transactions(&target, effects);
                state.rerun_transactions(&affected, effects);
                effects.raise_at(affected);
            }
        })
    }

    pub fn start_transaction(&self, request: TransactionRequest) -> DatabaseResult<()> {
        self.transact(|state, effects| state.start_transaction(request, effects))?
    }

    /// Registers a listener and delivers its initial events.
    pub fn add_listener(&self, path: Path, kind: ListenerKind) -> DatabaseResult<u64> {
        self.transact(|state, effects| {
            state.watch(&path, effects);
            let current = state.view(&path);
            let (id, initial) = state.events.register(path, kind, current);
            effects.events.extend(initial);
            id
        })
    }

    /// Detaches a listener. From inside a transaction update function the
    /// removal is deferred to the task queue.
    pub fn remove_listener(&self, id: u64) {
        if self
            .transact(|state, effects| state.remove_listener(id, effects))
            .is_err()
        {
            self.schedule(RepoTask::RemoveListener(id));
        }
    }
}

impl Drop for Repo {
    fn drop(&mut self) {
        // Update sinks held by the transport keep the channel open.
        self.tasks.close();
    }
}

async fn run_task_queue(repo: Weak<Repo>, receiver: Receiver<RepoTask>) {
    while let Ok(task) = receiver.recv().await {
        let Some(repo) = repo.upgrade() else {
            break;
        };
        repo.handle_task(task).await;
    }
}
