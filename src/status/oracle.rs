use std::sync::Arc;

use ahash::AHashMap as HashMap;
use futures::future::join_all;
use log::{debug, warn};

use crate::errors::{MaatError, Result};
use crate::hybrid_time::HybridTime;
use crate::status::{AbortOutcome, StatusResponse, TransactionStatus, TransactionStatusManager};
use crate::transaction_id::TransactionId;

/// Statuses of every conflicting transaction, taken once per attempt.
pub type StatusSnapshot = HashMap<TransactionId, TransactionStatus>;

/// Client side of the status authority: batches lookups and fans out aborts.
///
/// Holds no cache across calls; every resolution attempt asks again because
/// statuses change between attempts.
pub struct StatusOracle<S> {
    manager: Arc<S>,
    batch_size: usize,
}

impl<S> Clone for StatusOracle<S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            batch_size: self.batch_size,
        }
    }
}

impl<S: TransactionStatusManager> StatusOracle<S> {
    pub fn new(manager: Arc<S>, batch_size: usize) -> Self {
        Self {
            manager,
            batch_size: batch_size.max(1),
        }
    }

    pub fn manager(&self) -> &Arc<S> {
        &self.manager
    }

    /// Resolves every id to a status.
    ///
    /// Duplicates are collapsed and ids are sent in as few round-trips as the
    /// batch size allows; batches are issued concurrently.
    pub async fn fetch<I>(&self, ids: I, read_ht: HybridTime) -> Result<StatusSnapshot>
    where
        I: IntoIterator<Item = TransactionId>,
    {
        let mut unique: Vec<TransactionId> = ids.into_iter().collect();
        unique.sort_unstable();
        unique.dedup();
        if unique.is_empty() {
            return Ok(StatusSnapshot::new());
        }

        let batches = unique
            .chunks(self.batch_size)
            .map(|chunk| self.manager.request_statuses(chunk.to_vec(), read_ht));
        let responses = join_all(batches).await;
        debug!(
            "Fetched statuses of {} transactions in {} round-trips",
            unique.len(),
            responses.len()
        );

        let mut snapshot = StatusSnapshot::with_capacity(unique.len());
        for response in responses {
            for (id, status) in response? {
                snapshot.insert(id, status.into());
            }
        }
        for id in unique {
            snapshot.entry(id).or_insert_with(|| {
                warn!("Status authority did not answer for {id}, treating it as aborted");
                StatusResponse::NotFound.into()
            });
        }
        Ok(snapshot)
    }

    /// Asks the authority to abort every victim. Succeeds only if every abort
    /// is acknowledged; a victim that committed first turns the whole call
    /// into an error carrying its commit time.
    pub async fn abort_all(
        &self,
        victims: &[TransactionId],
        requester: Option<TransactionId>,
    ) -> std::result::Result<(), AbortFailure> {
        let attempts = victims
            .iter()
            .map(|victim| self.manager.abort_transaction(*victim, requester));
        let outcomes = join_all(attempts).await;

        let mut failure: Option<AbortFailure> = None;
        for (victim, outcome) in victims.iter().zip(outcomes) {
            match outcome {
                Ok(AbortOutcome::Aborted) => debug!("Aborted conflicting transaction {victim}"),
                Ok(AbortOutcome::AlreadyCommitted { commit_ht }) => {
                    warn!("Could not abort {victim}: already committed at {commit_ht}");
                    failure
                        .get_or_insert_with(AbortFailure::default)
                        .committed
                        .push((*victim, commit_ht));
                }
                Err(e) => {
                    warn!("Abort request for {victim} failed: {e}");
                    failure.get_or_insert_with(AbortFailure::default).errors.push((*victim, e));
                }
            }
        }
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Why a round of abort requests did not fully succeed.
#[derive(Debug, Default)]
pub struct AbortFailure {
    /// Victims that had already committed, with their commit times.
    pub committed: Vec<(TransactionId, HybridTime)>,
    /// Victims whose abort request itself failed.
    pub errors: Vec<(TransactionId, MaatError)>,
}

impl AbortFailure {
    pub fn max_commit_ht(&self) -> Option<HybridTime> {
        self.committed.iter().map(|(_, ht)| *ht).max()
    }
}
