use serde::{Deserialize, Serialize};

use crate::database::constants::MAX_TRANSACTION_RETRIES;
use crate::logger::LogLevel;

/// Per-database configuration.
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseSettings {
    /// Sends a transaction may make before it aborts with `maxretry`.
    pub max_transaction_retries: u32,
    /// Default for [`TransactionOptions::apply_locally`](crate::database::TransactionOptions).
    pub apply_locally: bool,
    /// Level applied to the database logger when the database is created.
    pub log_level: Option<LogLevel>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            max_transaction_retries: MAX_TRANSACTION_RETRIES,
            apply_locally: true,
            log_level: None,
        }
    }
}
