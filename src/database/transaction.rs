//! Transaction queue entries and their state machine.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::database::error::{transaction_aborted, DatabaseError, DatabaseResult};
use crate::database::logger::LOGGER;
use crate::database::path::Path;
use crate::database::snapshot::DataSnapshot;

/// Update function of a transaction. Receives the current value at the
/// location and returns the value to write, or `None` to abort.
///
/// It may run many times and must be free of side effects.
pub type TransactionUpdate = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

/// Invoked exactly once when a transaction finishes.
pub type TransactionCompletion = Box<dyn FnOnce(DatabaseResult<TransactionResult>) + Send>;

/// Final outcome of a transaction that did not fail.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionResult {
    /// `false` when the update function declined to write.
    pub committed: bool,
    /// The committed data, or the data the update function declined.
    pub snapshot: DataSnapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Raise local events for intermediate values before the server
    /// confirms the transaction.
    pub apply_locally: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            apply_locally: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Waiting to be sent, or waiting to be rerun.
    Run,
    /// Sent to the server, no response yet.
    Sent,
    /// Sent, and a conflicting local write arrived meanwhile. Aborts when
    /// the response comes back.
    SentNeedsAbort,
    /// Will be aborted on the next rerun pass.
    NeedsAbort,
    Completed,
}

impl TransactionStatus {
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Run, Sent)
                | (Run, NeedsAbort)
                | (Run, Completed)
                | (Sent, Completed)
                | (Sent, SentNeedsAbort)
                | (Sent, Run)
                | (Sent, NeedsAbort)
                | (SentNeedsAbort, NeedsAbort)
                | (SentNeedsAbort, Completed)
                | (NeedsAbort, Completed)
        )
    }
}

/// Why a transaction ended without committing.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum AbortReason {
    /// The update function returned `None`. Not an error.
    NoData,
    MaxRetry,
    /// A direct write overlapped the transaction.
    Set,
    /// The server rejected the write with this status.
    Server(String),
    /// The update function produced data that cannot be written.
    Invalid(DatabaseError),
}

impl AbortReason {
    pub fn into_error(self) -> DatabaseError {
        match self {
            AbortReason::Invalid(error) => error,
            other => transaction_aborted(other.to_string()),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoData => f.write_str("nodata"),
            AbortReason::MaxRetry => f.write_str("maxretry"),
            AbortReason::Set => f.write_str("set"),
            AbortReason::Server(status) => f.write_str(status),
            AbortReason::Invalid(error) => write!(f, "{}", error.message()),
        }
    }
}

/// A queued transaction.
pub(crate) struct PendingOperation {
    pub path: Path,
    pub update: TransactionUpdate,
    completion: Option<TransactionCompletion>,
    status: TransactionStatus,
    pub order: u64,
    pub apply_locally: bool,
    pub retry_count: u32,
    pub write_id: u64,
    pub input_snapshot: Value,
    /// Update output before server values are resolved; this is what is sent.
    pub output_raw: Value,
    /// Update output with server values resolved locally; this is applied.
    pub output_resolved: Value,
    pub abort_reason: Option<AbortReason>,
    /// Path of the standing listen held for this transaction, released once.
    unwatch: Option<Path>,
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("path", &self.path)
            .field("status", &self.status)
            .field("order", &self.order)
            .field("write_id", &self.write_id)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Fields of a new operation that has already passed validation.
pub(crate) struct NewOperation {
    pub path: Path,
    pub update: TransactionUpdate,
    pub completion: TransactionCompletion,
    pub order: u64,
    pub apply_locally: bool,
    pub write_id: u64,
    pub input_snapshot: Value,
    pub output_raw: Value,
    pub output_resolved: Value,
    pub unwatch: Path,
}

impl PendingOperation {
    pub fn new(fields: NewOperation) -> Self {
        Self {
            path: fields.path,
            update: fields.update,
            completion: Some(fields.completion),
            status: TransactionStatus::Run,
            order: fields.order,
            apply_locally: fields.apply_locally,
            retry_count: 0,
            write_id: fields.write_id,
            input_snapshot: fields.input_snapshot,
            output_raw: fields.output_raw,
            output_resolved: fields.output_resolved,
            abort_reason: None,
            unwatch: Some(fields.unwatch),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Moves to `next` when the transition table allows it. An illegal
    /// transition is logged and leaves the status unchanged.
    pub fn set_status(&mut self, next: TransactionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            LOGGER.error(format!(
                "transaction {} at {} cannot move from {:?} to {:?}",
                self.order, self.path, self.status, next
            ));
            return false;
        }
        self.status = next;
        true
    }

    /// Takes the listen to release. Yields `Some` at most once.
    pub fn take_unwatch(&mut self) -> Option<Path> {
        self.unwatch.take()
    }

    /// Builds the deferred completion call, consuming the callback.
    pub fn take_completion(
        &mut self,
        result: DatabaseResult<TransactionResult>,
    ) -> Option<Box<dyn FnOnce() + Send>> {
        let completion = self.completion.take()?;
        Some(Box::new(move || completion(result)))
    }
}
