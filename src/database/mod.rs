//! # Realtime Database sync and transaction engine
//!
//! Client-side core of a realtime database: an optimistic local cache that
//! overlays pending writes on the last data received from the server, a
//! queue of transactions sent as hash-conditioned puts and rerun whenever
//! they are rejected as stale, and listeners notified once per state
//! transition.
//!
//! ## Features
//!
//! - Optimistic `set` / `set_with_priority` / `update` / `remove`, reverted when the server rejects them
//! - Transactions with retries (`maxretry`), abort on overlapping writes (`set`) and `nodata` no-ops
//! - Batching of nested transactions into one conditional put
//! - Value and child listeners fed from the local view
//! - Server values (`server_timestamp`, `increment`) resolved locally and on the server
//! - A pluggable [`Transport`] and an in-process [`MemoryServer`] for tests and offline use
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use firebase_rtdb_sync::database::{Database, DatabaseSettings, MemoryServer};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MemoryServer::with_data(json!({ "likes": 41 }));
//!     let database = Database::with_memory_server(&server, DatabaseSettings::default());
//!
//!     let likes = database.reference("likes")?;
//!     let result = likes
//!         .run_transaction(|current| Some(json!(current.as_i64().unwrap_or(0) + 1)))
//!         .await?;
//!     assert!(result.committed);
//!     println!("likes: {}", result.snapshot.value());
//!
//!     Ok(())
//! }
//! ```

mod api;
mod constants;
pub mod error;
mod events;
mod logger;
mod memory;
mod node;
mod path;
pub(crate) mod repo;
mod server_value;
mod settings;
mod snapshot;
mod transaction;
mod transport;
mod tree;
mod validation;
mod write_tree;

#[doc(inline)]
pub use api::{
    run_transaction, set_with_priority, Database, DatabaseReference, ListenerRegistration,
};

#[doc(inline)]
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};

#[doc(inline)]
pub use events::ChildEventType;

#[doc(inline)]
pub use memory::{MemoryServer, MemoryTransport, ServerWrite};

#[doc(inline)]
pub use node::node_hash;

#[doc(inline)]
pub use path::Path;

#[doc(inline)]
pub use server_value::{increment, server_timestamp};

#[doc(inline)]
pub use settings::DatabaseSettings;

#[doc(inline)]
pub use snapshot::DataSnapshot;

#[doc(inline)]
pub use transaction::{TransactionOptions, TransactionResult, TransactionStatus};

#[doc(inline)]
pub use transport::{MergeRequest, PutRequest, PutStatus, ServerUpdateSink, Transport};
