use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseErrorCode {
    InvalidArgument,
    Internal,
    PermissionDenied,
    TransactionAborted,
    Disconnected,
}

impl DatabaseErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseErrorCode::InvalidArgument => "database/invalid-argument",
            DatabaseErrorCode::Internal => "database/internal",
            DatabaseErrorCode::PermissionDenied => "database/permission-denied",
            DatabaseErrorCode::TransactionAborted => "database/transaction-aborted",
            DatabaseErrorCode::Disconnected => "database/disconnected",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseError {
    pub code: DatabaseErrorCode,
    message: String,
}

impl DatabaseError {
    pub fn new(code: DatabaseErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The literal reason (`"set"`, `"maxretry"` or the server status) when
    /// this error ended a transaction.
    pub fn abort_reason(&self) -> Option<&str> {
        match self.code {
            DatabaseErrorCode::TransactionAborted => Some(&self.message),
            _ => None,
        }
    }
}

impl Display for DatabaseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl std::error::Error for DatabaseError {}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub fn invalid_argument(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Internal, message)
}

pub fn permission_denied(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::PermissionDenied, message)
}

pub fn transaction_aborted(reason: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::TransactionAborted, reason)
}

pub fn disconnected(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseErrorCode::Disconnected, message)
}

/// Maps a status token reported for a failed write onto an error.
pub(crate) fn error_for_write_status(status: &str) -> DatabaseError {
    match status {
        "permission_denied" => permission_denied(format!("write failed: {status}")),
        "disconnect" => disconnected(format!("write failed: {status}")),
        other => internal_error(format!("write failed: {other}")),
    }
}
