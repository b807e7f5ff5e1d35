use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::errors::{MaatError, Result};
use crate::hybrid_time::HybridTime;
use crate::status::{AbortOutcome, StatusResponse, TransactionStatus, TransactionStatusManager};
use crate::transaction_id::{TransactionId, TransactionPriority};
use crate::wait_queue::WaitQueue;

/// A status authority living in the same process, used by single-node
/// deployments and tests.
///
/// Terminal transitions are pushed to every attached [`WaitQueue`] so waiters
/// resume without waiting for the next poll.
#[derive(Default)]
pub struct InMemoryStatusAuthority {
    transactions: RwLock<HashMap<TransactionId, TransactionStatus>>,
    wait_queues: Mutex<Vec<Arc<WaitQueue>>>,
    status_requests: AtomicU64,
    abort_requests: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStatusAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts tracking `transaction_id` as pending.
    pub fn register(&self, transaction_id: TransactionId, priority: TransactionPriority) {
        self.transactions
            .write()
            .insert(transaction_id, TransactionStatus::Pending { priority });
    }

    /// Commits a pending transaction. A transaction that was aborted first
    /// stays aborted; the returned status is the final one.
    pub fn commit(&self, transaction_id: TransactionId, commit_ht: HybridTime) -> TransactionStatus {
        let status = {
            let mut transactions = self.transactions.write();
            let entry = transactions
                .entry(transaction_id)
                .or_insert(TransactionStatus::Committed { commit_ht });
            if let TransactionStatus::Pending { .. } = entry {
                *entry = TransactionStatus::Committed { commit_ht };
            }
            *entry
        };
        debug!("Transaction {transaction_id} finished as {status}");
        self.notify_finished(transaction_id);
        status
    }

    /// Aborts a transaction unless it already committed.
    pub fn abort(&self, transaction_id: TransactionId) -> AbortOutcome {
        let outcome = {
            let mut transactions = self.transactions.write();
            let entry = transactions
                .entry(transaction_id)
                .or_insert(TransactionStatus::Aborted);
            match *entry {
                TransactionStatus::Committed { commit_ht } => {
                    AbortOutcome::AlreadyCommitted { commit_ht }
                }
                _ => {
                    *entry = TransactionStatus::Aborted;
                    AbortOutcome::Aborted
                }
            }
        };
        if outcome == AbortOutcome::Aborted {
            debug!("Transaction {transaction_id} aborted");
            self.notify_finished(transaction_id);
        }
        outcome
    }

    pub fn status(&self, transaction_id: TransactionId) -> Option<TransactionStatus> {
        self.transactions.read().get(&transaction_id).copied()
    }

    /// Forgets a finished transaction; later lookups answer `NotFound`.
    pub fn forget(&self, transaction_id: TransactionId) -> Option<TransactionStatus> {
        self.transactions.write().remove(&transaction_id)
    }

    pub fn attach_wait_queue(&self, queue: Arc<WaitQueue>) {
        self.wait_queues.lock().push(queue);
    }

    /// Makes every request fail, simulating a partitioned authority.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `request_statuses` round-trips served so far.
    pub fn status_request_count(&self) -> u64 {
        self.status_requests.load(Ordering::SeqCst)
    }

    /// Number of abort requests received so far.
    pub fn abort_request_count(&self) -> u64 {
        self.abort_requests.load(Ordering::SeqCst)
    }

    fn notify_finished(&self, transaction_id: TransactionId) {
        let queues: Vec<Arc<WaitQueue>> = self.wait_queues.lock().clone();
        for queue in queues {
            queue.signal_finished(transaction_id);
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MaatError::StatusUnavailable(
                "in-memory authority marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl TransactionStatusManager for InMemoryStatusAuthority {
    fn request_statuses(
        &self,
        ids: Vec<TransactionId>,
        _read_ht: HybridTime,
    ) -> impl Future<Output = Result<Vec<(TransactionId, StatusResponse)>>> + Send {
        self.status_requests.fetch_add(1, Ordering::SeqCst);
        let answer = self.check_available().map(|()| {
            let transactions = self.transactions.read();
            ids.into_iter()
                .map(|id| {
                    let response = match transactions.get(&id) {
                        Some(TransactionStatus::Committed { commit_ht }) => {
                            StatusResponse::Committed {
                                commit_ht: *commit_ht,
                            }
                        }
                        Some(TransactionStatus::Pending { priority }) => StatusResponse::Pending {
                            priority: *priority,
                        },
                        Some(TransactionStatus::Aborted) => StatusResponse::Aborted,
                        None => StatusResponse::NotFound,
                    };
                    (id, response)
                })
                .collect()
        });
        futures::future::ready(answer)
    }

    fn abort_transaction(
        &self,
        victim: TransactionId,
        requester: Option<TransactionId>,
    ) -> impl Future<Output = Result<AbortOutcome>> + Send {
        self.abort_requests.fetch_add(1, Ordering::SeqCst);
        let outcome = self.check_available().map(|()| {
            match requester {
                Some(requester) => debug!("{requester} requests abort of {victim}"),
                None => debug!("Operation write requests abort of {victim}"),
            }
            self.abort(victim)
        });
        futures::future::ready(outcome)
    }
}
