/// Number of times a transaction is sent before it gives up with `maxretry`.
pub const MAX_TRANSACTION_RETRIES: u32 = 25;

/// Name of the database logger.
pub const DATABASE_LOGGER_NAME: &str = "@firebase/database";
