use std::fmt;

use thiserror::Error;

use crate::hybrid_time::HybridTime;
use crate::intent::types::IntentTypeSet;
use crate::status::TransactionStatus;
use crate::transaction_id::TransactionId;

/// One conflicting transaction as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingTransaction {
    /// Owner of the conflicting intents.
    pub transaction_id: TransactionId,
    /// Union of the intent types it holds on the overlapping keys.
    pub intent_types: IntentTypeSet,
    /// Status snapshot taken for the attempt that produced the rejection.
    pub status: TransactionStatus,
}

/// Structured detail carried by conflict and skip-locking rejections.
///
/// The engine does not produce user-facing text; this record is preserved
/// unchanged through to the caller so a diagnostic can be formatted there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetail {
    /// The transaction that asked for resolution, `None` for operation writes.
    pub requester: Option<TransactionId>,
    /// Every conflicting transaction found by the attempt, ordered by id.
    pub conflicts: Vec<ConflictingTransaction>,
    /// Highest commit time among committed conflicts (intents or regular values).
    pub max_commit_ht: Option<HybridTime>,
}

impl fmt::Display for ConflictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.requester {
            Some(id) => write!(f, "{id} conflicts with")?,
            None => write!(f, "operation conflicts with")?,
        }
        if self.conflicts.is_empty() {
            write!(f, " committed data")?;
        }
        for (idx, conflict) in self.conflicts.iter().enumerate() {
            let sep = if idx == 0 { " " } else { ", " };
            write!(
                f,
                "{sep}{} {:?} ({})",
                conflict.transaction_id, conflict.intent_types, conflict.status
            )?;
        }
        if let Some(ht) = self.max_commit_ht {
            write!(f, "; max commit time {ht}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum MaatError {
    #[error("Intent decode error: {message} (key: {key}, transaction: {transaction})")]
    Decode {
        message: String,
        key: String,
        transaction: String,
    },

    #[error("Transaction conflict detected: {0}")]
    Conflict(Box<ConflictDetail>),

    #[error("Skip locking: {0}")]
    SkipLocking(Box<ConflictDetail>),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to reacquire lock batch after wait: {0}")]
    LockReacquire(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Deadlock detected for transaction {0}")]
    Deadlock(TransactionId),

    #[error("Transaction status authority unavailable: {0}")]
    StatusUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MaatError {
    pub(crate) fn decode(message: impl Into<String>, key: &[u8], transaction: &[u8]) -> Self {
        MaatError::Decode {
            message: message.into(),
            key: hex::encode(key),
            transaction: hex::encode(transaction),
        }
    }

    /// Whether the caller may re-run resolution (possibly after backoff).
    ///
    /// Decode, configuration, storage, lock-reacquire and internal errors are
    /// fatal to the write and are never worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MaatError::Conflict(_)
                | MaatError::SkipLocking(_)
                | MaatError::TimedOut(_)
                | MaatError::Deadlock(_)
                | MaatError::StatusUnavailable(_)
        )
    }

    /// The maximal committed conflicting time, if the error carries one.
    pub fn conflict_hybrid_time(&self) -> Option<HybridTime> {
        match self {
            MaatError::Conflict(detail) | MaatError::SkipLocking(detail) => detail.max_commit_ht,
            _ => None,
        }
    }

    /// Structured conflict detail for conflict and skip-locking rejections.
    pub fn conflict_detail(&self) -> Option<&ConflictDetail> {
        match self {
            MaatError::Conflict(detail) | MaatError::SkipLocking(detail) => Some(detail),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MaatError>;
