//! Offline sync and transaction engine for a Firebase-style Realtime Database.
//!
//! The [`database`] module holds the engine: optimistic local writes,
//! hash-conditioned transactions with automatic reruns, and listeners over
//! the local view. [`logger`] is the leveled logger shared by every module,
//! [`platform`] the runtime glue used for background work.

pub mod database;
pub mod logger;
pub mod platform;
pub mod util;
