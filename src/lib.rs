//! Maat: conflict resolution and wait/abort engine for a transactional
//! document store.
//!
//! Before a write is applied, its keys are checked against intents of other
//! in-flight transactions and against recently committed data. Depending on
//! the [`ConflictManagementPolicy`], the writer then proceeds, is rejected,
//! waits in a [`WaitQueue`] for its competitors to finish, or aborts
//! lower-priority competitors.
//!
//! ```no_run
//! use std::sync::Arc;
//! use maat::prelude::*;
//!
//! # async fn run() -> maat::Result<()> {
//! let doc_db = DocDb::in_memory();
//! let authority = InMemoryStatusAuthority::new();
//! let queue = WaitQueue::new(ResolverConfig::default());
//! authority.attach_wait_queue(Arc::clone(&queue));
//! let resolver = ConflictResolver::new(doc_db, authority, Some(queue), ResolverConfig::default())?;
//!
//! let txn = TransactionMetadata::new(TransactionId::generate(), 10);
//! let write_set = vec![WriteRequest::write(DocPath::row(None, ["user-1"]))];
//! let locks = SharedLockManager::new();
//! let mut batch = locks
//!     .lock(Some(txn.transaction_id), LockEntry::for_write_set(&write_set, false), None)
//!     .await?;
//! let ht = resolver
//!     .resolve_transaction_conflicts(
//!         TransactionConflictRequest {
//!             transaction: txn,
//!             policy: ConflictManagementPolicy::WaitOnConflict,
//!             write_set,
//!             initial_resolution_ht: HybridTime::from_micros(1_000, 0),
//!             read_time: HybridTime::from_micros(900, 0),
//!             partial_range_key_intents: false,
//!             deadline: None,
//!         },
//!         &mut batch,
//!     )
//!     .await?;
//! # let _ = ht;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conflict;
pub mod data_store;
pub mod errors;
pub mod hybrid_time;
pub mod intent;
pub mod lock_manager;
pub mod policy;
pub mod resolver;
pub mod status;
pub mod transaction_id;
pub mod wait_queue;

// Re-export key types for easier access
pub use config::ResolverConfig;
pub use conflict::detection::WriteRequest;
pub use data_store::DocDb;
pub use errors::{MaatError, Result};
pub use hybrid_time::{DocHybridTime, HybridTime};
pub use policy::ConflictManagementPolicy;
pub use resolver::{ConflictResolver, OperationConflictRequest, TransactionConflictRequest};
pub use status::{TransactionStatus, TransactionStatusManager};
pub use transaction_id::{TransactionId, TransactionMetadata};
pub use wait_queue::WaitQueue;

/// Everything needed to wire up and drive a resolver.
pub mod prelude {
    pub use crate::config::ResolverConfig;
    pub use crate::conflict::detection::WriteRequest;
    pub use crate::data_store::DocDb;
    pub use crate::errors::{MaatError, Result};
    pub use crate::hybrid_time::{DocHybridTime, HybridTime};
    pub use crate::intent::doc_path::DocPath;
    pub use crate::intent::types::{IntentType, IntentTypeSet};
    pub use crate::lock_manager::{LockBatch, LockEntry, SharedLockManager};
    pub use crate::policy::ConflictManagementPolicy;
    pub use crate::resolver::{
        ConflictResolver, OperationConflictRequest, TransactionConflictRequest,
    };
    pub use crate::status::memory::InMemoryStatusAuthority;
    pub use crate::status::{StatusResponse, TransactionStatus, TransactionStatusManager};
    pub use crate::transaction_id::{TransactionId, TransactionMetadata};
    pub use crate::wait_queue::{WaitQueue, WakeReason};
}
