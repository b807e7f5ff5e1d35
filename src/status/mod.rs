/// In-memory transaction status authority.
pub mod memory;
/// Batching client used by the resolver.
pub mod oracle;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::hybrid_time::HybridTime;
use crate::transaction_id::{TransactionId, TransactionPriority};

/// Resolved status of a conflicting transaction, as seen by one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Committed { commit_ht: HybridTime },
    Pending { priority: TransactionPriority },
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending { .. })
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Committed { commit_ht } => write!(f, "COMMITTED at {commit_ht}"),
            TransactionStatus::Pending { priority } => write!(f, "PENDING priority {priority}"),
            TransactionStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// What the status authority answers for one transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusResponse {
    Committed { commit_ht: HybridTime },
    Pending { priority: TransactionPriority },
    Aborted,
    /// The authority has no record of the transaction.
    NotFound,
}

impl From<StatusResponse> for TransactionStatus {
    /// A transaction the authority does not know about can no longer commit,
    /// so its intents are treated like those of an aborted one.
    fn from(response: StatusResponse) -> Self {
        match response {
            StatusResponse::Committed { commit_ht } => TransactionStatus::Committed { commit_ht },
            StatusResponse::Pending { priority } => TransactionStatus::Pending { priority },
            StatusResponse::Aborted | StatusResponse::NotFound => TransactionStatus::Aborted,
        }
    }
}

/// Result of asking the authority to abort a competitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortOutcome {
    /// The competitor is now aborted (or already was, or never existed).
    Aborted,
    /// The competitor won the race and committed first.
    AlreadyCommitted { commit_ht: HybridTime },
}

/// Query interface to the external transaction status authority.
///
/// Implementations must be `Send` and `Sync`; the resolver calls them from
/// many concurrent resolution attempts.
pub trait TransactionStatusManager: Send + Sync + 'static {
    /// Looks up the status of every id in `ids` in a single round-trip.
    ///
    /// `read_ht` is the time the statuses are requested at. Ids missing from
    /// the answer are treated as [`StatusResponse::NotFound`].
    fn request_statuses(
        &self,
        ids: Vec<TransactionId>,
        read_ht: HybridTime,
    ) -> impl Future<Output = Result<Vec<(TransactionId, StatusResponse)>>> + Send;

    /// Best-effort request to abort `victim` on behalf of `requester`.
    fn abort_transaction(
        &self,
        victim: TransactionId,
        requester: Option<TransactionId>,
    ) -> impl Future<Output = Result<AbortOutcome>> + Send;
}
