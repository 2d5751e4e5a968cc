//! Transaction scheduling and reconciliation.
//!
//! Queued transactions live in a tree keyed by their path. A queue node and
//! everything below it is sent as one conditional batch once every entry in
//! it is waiting to run; rejected batches are rerun against fresher data,
//! and direct writes abort the transactions they overlap.

use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;

use crate::database::error::{internal_error, DatabaseResult};
use crate::database::logger::LOGGER;
use crate::database::node::{
    export_value, has_explicit_priority, node_hash, normalize, priority_of, set_at, with_priority,
};
use crate::database::path::Path;
use crate::database::server_value::{resolve_deferred_values, ServerValues};
use crate::database::snapshot::DataSnapshot;
use crate::database::transaction::{
    AbortReason, NewOperation, PendingOperation, TransactionResult, TransactionStatus,
    TransactionUpdate,
};
use crate::database::transport::{PutRequest, PutStatus};
use crate::database::tree::Tree;
use crate::database::validation::validate_writable_data;

use super::{Effects, OutgoingWrite, PutTarget, RepoState, RepoTask, TransactionRequest};

const INVALID_RESULT_CONTEXT: &str = "transaction failed: Data returned";

type QueueTree = Tree<Vec<PendingOperation>>;

impl RepoState {
    /// Runs the update once against the local state and queues the result.
    ///
    /// An update that declines to write completes immediately with
    /// `committed == false` and queues nothing. Invalid data is reported
    /// through the returned error without invoking the completion.
    pub(super) fn start_transaction(
        &mut self,
        request: TransactionRequest,
        effects: &mut Effects,
    ) -> DatabaseResult<()> {
        let TransactionRequest {
            path,
            update,
            completion,
            apply_locally,
        } = request;
        LOGGER.debug(format!("transaction at {path}"));

        self.watch(&path, effects);
        let current = self.latest_state(&path, &[]);
        let output = match run_update(&update, &current) {
            Ok(Some(output)) => output,
            Ok(None) => {
                self.unwatch(&path, effects);
                let snapshot = DataSnapshot::new(path, current);
                effects.callbacks.push(Box::new(move || {
                    completion(Ok(TransactionResult {
                        committed: false,
                        snapshot,
                    }))
                }));
                return Ok(());
            }
            Err(error) => {
                self.unwatch(&path, effects);
                return Err(error);
            }
        };
        if let Err(error) = validate_writable_data(INVALID_RESULT_CONTEXT, &output, &path) {
            self.unwatch(&path, effects);
            return Err(error);
        }

        let (output_raw, output_resolved) = prepare_output(output, &current);
        let order = self.ids.order();
        let write_id = self.ids.write_id();
        self.writes
            .apply_user_overwrite(&path, output_resolved.clone(), write_id, apply_locally);
        let operation = PendingOperation::new(NewOperation {
            path: path.clone(),
            update,
            completion,
            order,
            apply_locally,
            write_id,
            input_snapshot: current,
            output_raw,
            output_resolved,
            unwatch: path.clone(),
        });
        let node = self.transactions.subtree_mut(&path);
        match node.value_mut() {
            Some(queue) => queue.push(operation),
            None => node.set_value(Some(vec![operation])),
        }

        effects.raise_at(path);
        effects.tasks.push(RepoTask::SendReadyTransactions);
        Ok(())
    }

    /// Sends every queue whose entries are all waiting to run.
    pub(super) fn send_ready_transactions(&mut self, effects: &mut Effects) {
        self.prune_completed_transactions();
        self.send_ready_below(&Path::root(), effects);
    }

    fn send_ready_below(&mut self, path: &Path, effects: &mut Effects) {
        let Some(node) = self.transactions.get(path) else {
            return;
        };
        if node.value().is_some() {
            let all_run = node
                .values()
                .into_iter()
                .flatten()
                .all(|operation| operation.status() == TransactionStatus::Run);
            if all_run {
                self.send_transaction_queue(path, effects);
            }
        } else if node.has_children() {
            for key in node.child_keys() {
                self.send_ready_below(&path.child(key), effects);
            }
        }
    }

    /// Folds every queued output below `path` into one conditional put.
    fn send_transaction_queue(&mut self, path: &Path, effects: &mut Effects) {
        let Self {
            transactions,
            writes,
            ..
        } = self;
        let mut queue = operations_below(transactions, path);
        let sets_to_ignore: Vec<u64> = queue.iter().map(|operation| operation.write_id).collect();
        let latest = writes.calc_complete_event_cache(path, &sets_to_ignore, true);
        let hash = node_hash(&latest);

        let mut data = latest;
        let mut orders = Vec::with_capacity(queue.len());
        for operation in queue.iter_mut() {
            operation.set_status(TransactionStatus::Sent);
            operation.retry_count += 1;
            if let Some(relative) = path.relative_to_child(&operation.path) {
                set_at(&mut data, &relative, operation.output_raw.clone());
            }
            orders.push(operation.order);
        }
        LOGGER.debug(format!(
            "sending {} transaction(s) at {path}",
            orders.len()
        ));
        effects.writes.push((
            OutgoingWrite::Put(PutRequest {
                path: path.clone(),
                data,
                hash: Some(hash),
            }),
            PutTarget::Transactions {
                path: path.clone(),
                orders,
            },
        ));
    }

    pub(super) fn handle_transaction_response(
        &mut self,
        path: Path,
        orders: &[u64],
        status: PutStatus,
        effects: &mut Effects,
    ) {
        let mut batch = operations_with_orders(&mut self.transactions, &path, orders);
        match status {
            PutStatus::Ok => {
                let mut acknowledged = Vec::with_capacity(batch.len());
                let mut released = Vec::new();
                for operation in batch.iter_mut() {
                    operation.set_status(TransactionStatus::Completed);
                    acknowledged.push(operation.write_id);
                    released.extend(operation.take_unwatch());
                    let snapshot =
                        DataSnapshot::new(operation.path.clone(), operation.output_resolved.clone());
                    let result = Ok(TransactionResult {
                        committed: true,
                        snapshot,
                    });
                    effects.callbacks.extend(operation.take_completion(result));
                }
                for write_id in acknowledged {
                    if let Some(changed) = self.ack_write(write_id, false) {
                        effects.raise_at(changed);
                    }
                }
                for listened in released {
                    self.unwatch(&listened, effects);
                }
                self.prune_completed_transactions();
                self.send_ready_transactions(effects);
                effects.raise_at(path);
            }
            PutStatus::DataStale => {
                for operation in batch.iter_mut() {
                    if operation.status() == TransactionStatus::SentNeedsAbort {
                        operation.set_status(TransactionStatus::NeedsAbort);
                    } else {
                        operation.set_status(TransactionStatus::Run);
                    }
                }
                self.rerun_transactions(&path, effects);
            }
            PutStatus::Failed(code) => {
                LOGGER.warn(format!(
                    "transaction at {path} failed: {code}"
                ));
                for operation in batch.iter_mut() {
                    operation.set_status(TransactionStatus::NeedsAbort);
                    operation.abort_reason = Some(AbortReason::Server(code.clone()));
                }
                self.rerun_transactions(&path, effects);
            }
        }
    }

    /// Reruns the queue containing `changed_path` and returns the path of the
    /// rootmost queue node involved.
    pub(super) fn rerun_transactions(&mut self, changed_path: &Path, effects: &mut Effects) -> Path {
        let root = self.transactions.rootmost_valued_ancestor(changed_path);
        self.rerun_transaction_queue(&root, effects);
        root
    }

    fn rerun_transaction_queue(&mut self, path: &Path, effects: &mut Effects) {
        let max_retries = self.max_retries;
        let Self {
            transactions,
            writes,
            ids,
            ..
        } = self;
        let mut queue = operations_below(transactions, path);
        if queue.is_empty() {
            return;
        }
        let mut sets_to_ignore: Vec<u64> = queue.iter().map(|operation| operation.write_id).collect();

        for operation in queue.iter_mut() {
            let abort = match operation.status() {
                TransactionStatus::NeedsAbort => {
                    writes.ack_user_write(operation.write_id, false);
                    Some(operation.abort_reason.take().unwrap_or(AbortReason::Set))
                }
                TransactionStatus::Run if operation.retry_count >= max_retries => {
                    writes.ack_user_write(operation.write_id, false);
                    Some(AbortReason::MaxRetry)
                }
                TransactionStatus::Run => {
                    let current =
                        writes.calc_complete_event_cache(&operation.path, &sets_to_ignore, true);
                    operation.input_snapshot = current.clone();
                    let rerun = run_update(&operation.update, &current).and_then(|output| {
                        match output {
                            Some(output) => {
                                validate_writable_data(INVALID_RESULT_CONTEXT, &output, &operation.path)
                                    .map(|()| Some(output))
                            }
                            None => Ok(None),
                        }
                    });
                    match rerun {
                        Ok(Some(output)) => {
                            let (output_raw, output_resolved) = prepare_output(output, &current);
                            let previous_write_id = operation.write_id;
                            operation.output_raw = output_raw;
                            operation.output_resolved = output_resolved.clone();
                            operation.write_id = ids.write_id();
                            sets_to_ignore.retain(|write_id| *write_id != previous_write_id);
                            writes.apply_user_overwrite(
                                &operation.path,
                                output_resolved,
                                operation.write_id,
                                operation.apply_locally,
                            );
                            writes.ack_user_write(previous_write_id, false);
                            None
                        }
                        Ok(None) => {
                            writes.ack_user_write(operation.write_id, false);
                            Some(AbortReason::NoData)
                        }
                        Err(error) => {
                            writes.ack_user_write(operation.write_id, false);
                            Some(AbortReason::Invalid(error))
                        }
                    }
                }
                _ => None,
            };

            if let Some(reason) = abort {
                operation.set_status(TransactionStatus::Completed);
                if let Some(listened) = operation.take_unwatch() {
                    effects.tasks.push(RepoTask::Release(listened));
                }
                let result = match reason {
                    AbortReason::NoData => Ok(TransactionResult {
                        committed: false,
                        snapshot: DataSnapshot::new(
                            operation.path.clone(),
                            operation.input_snapshot.clone(),
                        ),
                    }),
                    other => Err(other.into_error()),
                };
                effects.callbacks.extend(operation.take_completion(result));
            }
        }

        effects.raise_at(path.clone());
        self.prune_completed_transactions();
        self.send_ready_transactions(effects);
    }

    /// Aborts every transaction at, above or below `path` ahead of a direct
    /// write there. Returns the path of the rootmost queue node affected.
    pub(super) fn abort_transactions(&mut self, path: &Path, effects: &mut Effects) -> Path {
        let affected = self.transactions.rootmost_valued_ancestor(path);
        let mut nodes = self.transactions.valued_ancestors(path);
        nodes.extend(self.transactions.valued_paths_below(path));
        for node_path in nodes {
            self.abort_transactions_on_node(&node_path, effects);
        }
        affected
    }

    fn abort_transactions_on_node(&mut self, node_path: &Path, effects: &mut Effects) {
        let Self {
            transactions,
            writes,
            ..
        } = self;
        let Some(node) = transactions.get_mut(node_path) else {
            return;
        };
        let Some(queue) = node.value_mut() else {
            return;
        };

        let mut released = Vec::new();
        for operation in queue.iter_mut() {
            match operation.status() {
                TransactionStatus::Sent => {
                    operation.set_status(TransactionStatus::SentNeedsAbort);
                    operation.abort_reason = Some(AbortReason::Set);
                }
                TransactionStatus::Run => {
                    operation.set_status(TransactionStatus::Completed);
                    released.extend(operation.take_unwatch());
                    writes.ack_user_write(operation.write_id, false);
                    effects
                        .callbacks
                        .extend(operation.take_completion(Err(AbortReason::Set.into_error())));
                }
                _ => {}
            }
        }
        queue.retain(|operation| {
            matches!(
                operation.status(),
                TransactionStatus::Sent | TransactionStatus::SentNeedsAbort
            )
        });
        if queue.is_empty() {
            node.set_value(None);
        }

        for listened in released {
            self.unwatch(&listened, effects);
        }
        effects.raise_at(node_path.clone());
    }

    /// Drops completed entries and the queue nodes they leave empty.
    fn prune_completed_transactions(&mut self) {
        for node_path in self.transactions.valued_paths_below(&Path::root()) {
            let Some(node) = self.transactions.get_mut(&node_path) else {
                continue;
            };
            let empty = match node.value_mut() {
                Some(queue) => {
                    queue.retain(|operation| operation.status() != TransactionStatus::Completed);
                    queue.is_empty()
                }
                None => false,
            };
            if empty {
                node.set_value(None);
            }
        }
        self.transactions.prune();
    }
}

/// Every queued operation at or below `path`, ordered by creation.
fn operations_below<'a>(tree: &'a mut QueueTree, path: &Path) -> Vec<&'a mut PendingOperation> {
    let Some(node) = tree.get_mut(path) else {
        return Vec::new();
    };
    let mut operations: Vec<&mut PendingOperation> =
        node.values_mut().into_iter().flatten().collect();
    operations.sort_by_key(|operation| operation.order);
    operations
}

fn operations_with_orders<'a>(
    tree: &'a mut QueueTree,
    path: &Path,
    orders: &[u64],
) -> Vec<&'a mut PendingOperation> {
    operations_below(tree, path)
        .into_iter()
        .filter(|operation| orders.contains(&operation.order))
        .collect()
}

/// Runs a user update function against the exported form of `current`.
fn run_update(update: &TransactionUpdate, current: &Value) -> DatabaseResult<Option<Value>> {
    let input = export_value(current);
    panic::catch_unwind(AssertUnwindSafe(|| update(input)))
        .map_err(|_| internal_error("transaction update function panicked"))
}

/// Normalizes an update result, carrying the current priority over unless
/// the result names one, and resolves server values against `current`.
fn prepare_output(output: Value, current: &Value) -> (Value, Value) {
    let explicit_priority = has_explicit_priority(&output);
    let mut raw = normalize(output);
    if !explicit_priority {
        raw = with_priority(raw, priority_of(current));
    }
    let resolved = resolve_deferred_values(raw.clone(), current, &ServerValues::now());
    (raw, resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::settings::DatabaseSettings;
    use crate::database::transaction::{TransactionCompletion, TransactionResult};
    use crate::database::error::DatabaseResult;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Outcomes = Arc<Mutex<Vec<(u64, DatabaseResult<TransactionResult>)>>>;

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn state() -> RepoState {
        RepoState::new(&DatabaseSettings::default())
    }

    fn recorder(outcomes: &Outcomes, tag: u64) -> TransactionCompletion {
        let sink = Arc::clone(outcomes);
        Box::new(move |result| sink.lock().unwrap().push((tag, result)))
    }

    fn submit(
        state: &mut RepoState,
        effects: &mut Effects,
        at: &str,
        update: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
        completion: TransactionCompletion,
    ) -> DatabaseResult<()> {
        state.start_transaction(
            TransactionRequest {
                path: path(at),
                update: Arc::new(update),
                completion,
                apply_locally: true,
            },
            effects,
        )
    }

    fn run_callbacks(effects: &mut Effects) {
        for callback in effects.callbacks.drain(..) {
            callback();
        }
    }

    fn sent_puts(effects: &mut Effects) -> Vec<(PutRequest, Vec<u64>)> {
        effects
            .writes
            .drain(..)
            .filter_map(|(write, target)| match (write, target) {
                (OutgoingWrite::Put(request), PutTarget::Transactions { orders, .. }) => {
                    Some((request, orders))
                }
                _ => None,
            })
            .collect()
    }

    fn increment(value: Value) -> Option<Value> {
        Some(json!(value.as_i64().unwrap_or(0) + 1))
    }

    #[test]
    fn nested_queues_are_sent_as_one_batch() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();
        state.writes.apply_server_overwrite(&path("p"), json!({"other": true}));

        submit(&mut state, &mut effects, "p", |_| Some(json!({"a": 1})), recorder(&outcomes, 0))
            .unwrap();
        submit(&mut state, &mut effects, "p/child", |_| Some(json!("c")), recorder(&outcomes, 1))
            .unwrap();
        state.send_ready_transactions(&mut effects);

        let puts = sent_puts(&mut effects);
        assert_eq!(puts.len(), 1);
        let (request, orders) = &puts[0];
        assert_eq!(request.path, path("p"));
        assert_eq!(request.data, json!({"a": 1, "child": "c"}));
        assert_eq!(request.hash.as_deref(), Some(node_hash(&json!({"other": true})).as_str()));
        assert_eq!(orders, &vec![0, 1]);
    }

    #[test]
    fn queue_with_a_sent_entry_waits() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        assert_eq!(sent_puts(&mut effects).len(), 1);

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 1)).unwrap();
        state.send_ready_transactions(&mut effects);
        assert!(sent_puts(&mut effects).is_empty());
        assert_eq!(state.latest_state(&path("n"), &[]), json!(2));
    }

    #[test]
    fn ok_response_completes_in_order_and_sends_the_next_batch() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        let (_, first_orders) = sent_puts(&mut effects).remove(0);
        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 1)).unwrap();

        state.handle_transaction_response(path("n"), &first_orders, PutStatus::Ok, &mut effects);
        let puts = sent_puts(&mut effects);
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].1, vec![1]);

        run_callbacks(&mut effects);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let (tag, result) = &outcomes[0];
        assert_eq!(*tag, 0);
        let result = result.as_ref().unwrap();
        assert!(result.committed);
        assert_eq!(result.snapshot.value(), &json!(1));
    }

    #[test]
    fn stale_response_reruns_against_new_data() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        let (_, orders) = sent_puts(&mut effects).remove(0);

        state.writes.apply_server_overwrite(&path("n"), json!(10));
        state.handle_transaction_response(path("n"), &orders, PutStatus::DataStale, &mut effects);

        let puts = sent_puts(&mut effects);
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0.data, json!(11));
        assert_eq!(puts[0].0.hash, Some(node_hash(&json!(10))));
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn exhausted_retries_abort_with_maxretry() {
        let mut state = RepoState::new(&DatabaseSettings {
            max_transaction_retries: 2,
            ..DatabaseSettings::default()
        });
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        let mut sends = 0;
        loop {
            let puts = sent_puts(&mut effects);
            if puts.is_empty() {
                break;
            }
            sends += 1;
            let (_, orders) = &puts[0];
            state.handle_transaction_response(path("n"), orders, PutStatus::DataStale, &mut effects);
        }
        assert_eq!(sends, 2);

        run_callbacks(&mut effects);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let error = outcomes[0].1.as_ref().unwrap_err();
        assert_eq!(error.abort_reason(), Some("maxretry"));
        assert_eq!(state.latest_state(&path("n"), &[]), Value::Null);
        assert!(state.transactions.is_empty());
        assert!(effects
            .tasks
            .iter()
            .any(|task| matches!(task, RepoTask::Release(released) if *released == path("n"))));
    }

    #[test]
    fn server_failure_aborts_with_the_status() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "n", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        let (_, orders) = sent_puts(&mut effects).remove(0);
        state.handle_transaction_response(
            path("n"),
            &orders,
            PutStatus::from_code("permission_denied"),
            &mut effects,
        );

        run_callbacks(&mut effects);
        let outcomes = outcomes.lock().unwrap();
        let error = outcomes[0].1.as_ref().unwrap_err();
        assert_eq!(error.abort_reason(), Some("permission_denied"));
        assert!(sent_puts(&mut effects).is_empty());
    }

    #[test]
    fn direct_write_aborts_running_and_marks_sent() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        submit(&mut state, &mut effects, "a/sent", increment, recorder(&outcomes, 0)).unwrap();
        state.send_ready_transactions(&mut effects);
        let (_, sent_orders) = sent_puts(&mut effects).remove(0);
        submit(&mut state, &mut effects, "a/b", |_| Some(json!(5)), recorder(&outcomes, 1)).unwrap();

        let affected = state.abort_transactions(&path("a"), &mut effects);
        assert_eq!(affected, path("a"));
        run_callbacks(&mut effects);
        {
            let outcomes = outcomes.lock().unwrap();
            assert_eq!(outcomes.len(), 1);
            assert_eq!(outcomes[0].0, 1);
            assert_eq!(outcomes[0].1.as_ref().unwrap_err().abort_reason(), Some("set"));
        }

        state.handle_transaction_response(path("a/sent"), &sent_orders, PutStatus::DataStale, &mut effects);
        run_callbacks(&mut effects);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].0, 0);
        assert_eq!(outcomes[1].1.as_ref().unwrap_err().abort_reason(), Some("set"));
        assert!(sent_puts(&mut effects).is_empty());
    }

    #[test]
    fn declined_update_completes_without_queueing() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();
        state.writes.apply_server_overwrite(&path("x"), json!("old"));

        submit(&mut state, &mut effects, "x", |_| None, recorder(&outcomes, 0)).unwrap();
        assert!(state.transactions.is_empty());
        assert!(effects.tasks.iter().all(|task| !matches!(task, RepoTask::Listen(_))));

        run_callbacks(&mut effects);
        let outcomes = outcomes.lock().unwrap();
        let result = outcomes[0].1.as_ref().unwrap();
        assert!(!result.committed);
        assert_eq!(result.snapshot.value(), &json!("old"));
    }

    #[test]
    fn invalid_result_is_rejected_synchronously() {
        let mut state = state();
        let mut effects = Effects::default();
        let outcomes = Outcomes::default();

        let error = submit(
            &mut state,
            &mut effects,
            "x",
            |_| Some(json!({"bad.key": 1})),
            recorder(&outcomes, 0),
        )
        .unwrap_err();
        assert_eq!(error.code_str(), "database/invalid-argument");
        assert!(state.transactions.is_empty());
        run_callbacks(&mut effects);
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn priority_is_carried_over_unless_explicit() {
        let current = json!({".value": 1, ".priority": 7});
        let (raw, _) = prepare_output(json!(2), &current);
        assert_eq!(raw, json!({".value": 2, ".priority": 7}));
        let (raw, _) = prepare_output(json!({".value": 2, ".priority": null}), &current);
        assert_eq!(raw, json!(2));
    }

    #[test]
    fn panicking_update_is_reported() {
        let update: TransactionUpdate = Arc::new(|_| panic!("update exploded"));
        let error = run_update(&update, &Value::Null).unwrap_err();
        assert_eq!(error.code_str(), "database/internal");
    }
}
