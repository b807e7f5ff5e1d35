//! Entry points of conflict resolution.
//!
//! Every attempt runs `Scanning -> AwaitingStatus -> Deciding` and ends in
//! `Proceed`, `Reject`, or `Suspended`. A suspended attempt releases its lock
//! batch, waits in the wait queue, takes the batch back and starts over from
//! `Scanning`; nothing learned before the wait is reused.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::{debug, info, trace, warn};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::ResolverConfig;
use crate::conflict::detection::{ScanOptions, WriteRequest, scan_conflicts};
use crate::conflict::resolution::{
    ConflictingTransactions, Decision, DecisionContext, ResolutionMode, ResolverState, decide,
};
use crate::data_store::DocDb;
use crate::errors::{MaatError, Result};
use crate::hybrid_time::HybridTime;
use crate::lock_manager::{LockBatch, LockBridge};
use crate::policy::ConflictManagementPolicy;
use crate::status::TransactionStatusManager;
use crate::status::oracle::StatusOracle;
use crate::transaction_id::{
    OPERATION_PRIORITY, TransactionId, TransactionMetadata, TransactionPriority,
};
use crate::wait_queue::{WaitQueue, WaitRegistration, WakeReason};

/// Resolution request of a write belonging to a distributed transaction.
#[derive(Debug, Clone)]
pub struct TransactionConflictRequest {
    pub transaction: TransactionMetadata,
    pub policy: ConflictManagementPolicy,
    pub write_set: Vec<WriteRequest>,
    /// Current hybrid time of the tablet; returned on success when nothing
    /// pushes it further.
    pub initial_resolution_ht: HybridTime,
    /// Snapshot the transaction reads at. Commits at or before it are
    /// already visible and never conflict.
    pub read_time: HybridTime,
    pub partial_range_key_intents: bool,
    pub deadline: Option<Instant>,
}

/// Resolution request of a single non-transactional write.
#[derive(Debug, Clone)]
pub struct OperationConflictRequest {
    pub policy: ConflictManagementPolicy,
    pub write_set: Vec<WriteRequest>,
    pub initial_resolution_ht: HybridTime,
    pub partial_range_key_intents: bool,
    pub deadline: Option<Instant>,
}

/// Receives the outcome of a resolution together with the lock batch it ran
/// under. The batch is locked iff the outcome is `Ok`.
pub type ResolutionCallback = Box<dyn FnOnce(Result<HybridTime>, LockBatch) + Send + 'static>;

/// Per-call state of one resolution, kept across wait-queue suspensions.
struct ResolutionContext {
    mode: ResolutionMode,
    requester: Option<TransactionId>,
    /// Key the requester is registered under in the wait queue.
    waiter_id: TransactionId,
    requester_priority: TransactionPriority,
    policy: ConflictManagementPolicy,
    write_set: Vec<WriteRequest>,
    resolution_ht: HybridTime,
    read_time: Option<HybridTime>,
    partial_range_key_intents: bool,
    deadline: Option<Instant>,
    state: ResolverState,
    attempts: u32,
}

impl ResolutionContext {
    fn for_transaction(request: TransactionConflictRequest) -> Self {
        let id = request.transaction.transaction_id;
        Self {
            mode: ResolutionMode::Transaction,
            requester: Some(id),
            waiter_id: id,
            requester_priority: request.transaction.priority,
            policy: request.policy,
            write_set: request.write_set,
            resolution_ht: request.initial_resolution_ht,
            read_time: Some(request.read_time),
            partial_range_key_intents: request.partial_range_key_intents,
            deadline: request.deadline,
            state: ResolverState::Init,
            attempts: 0,
        }
    }

    fn for_operation(request: OperationConflictRequest) -> Self {
        Self {
            mode: ResolutionMode::Operation,
            requester: None,
            waiter_id: TransactionId::generate(),
            requester_priority: OPERATION_PRIORITY,
            policy: request.policy,
            write_set: request.write_set,
            resolution_ht: request.initial_resolution_ht,
            read_time: None,
            partial_range_key_intents: request.partial_range_key_intents,
            deadline: request.deadline,
            state: ResolverState::Init,
            attempts: 0,
        }
    }

    fn transition(&mut self, next: ResolverState) {
        trace!(
            "Resolution of {} attempt {}: {} -> {}",
            self.waiter_id, self.attempts, self.state, next
        );
        self.state = next;
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            requester: self.requester,
            read_time: self.read_time,
            resolution_ht: self.resolution_ht,
            partial_range_key_intents: self.partial_range_key_intents,
        }
    }

    fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(MaatError::TimedOut(format!(
                "conflict resolution of {} passed its deadline",
                self.waiter_id
            ))),
            _ => Ok(()),
        }
    }
}

/// Runs `future`, failing with `TimedOut` once `deadline` passes. Dropping
/// the future cancels whatever it was waiting on.
async fn with_deadline<F, T>(deadline: Option<Instant>, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), future)
                .await
                .map_err(|_| MaatError::TimedOut(format!("deadline passed while {what}")))?
        }
        None => future.await,
    }
}

/// Cancels a wait registration if the waiting future goes away before the
/// callback fires.
struct RegistrationGuard<'a> {
    queue: &'a WaitQueue,
    registration: WaitRegistration,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if self.registration.queued {
            self.queue.cancel_registration(&self.registration);
        }
    }
}

/// Conflict resolver of one tablet.
pub struct ConflictResolver<S> {
    doc_db: DocDb,
    oracle: StatusOracle<S>,
    wait_queue: Option<Arc<WaitQueue>>,
    config: ResolverConfig,
    conflicts_metric: Arc<AtomicU64>,
}

impl<S: TransactionStatusManager> ConflictResolver<S> {
    pub fn new(
        doc_db: DocDb,
        status_manager: Arc<S>,
        wait_queue: Option<Arc<WaitQueue>>,
        config: ResolverConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            doc_db,
            oracle: StatusOracle::new(status_manager, config.status_batch_size),
            wait_queue,
            config,
            conflicts_metric: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shares an existing conflict counter instead of a private one.
    pub fn with_conflicts_metric(mut self, metric: Arc<AtomicU64>) -> Self {
        self.conflicts_metric = metric;
        self
    }

    /// Number of attempts that found at least one conflict.
    pub fn conflicts_metric(&self) -> &Arc<AtomicU64> {
        &self.conflicts_metric
    }

    pub fn doc_db(&self) -> &DocDb {
        &self.doc_db
    }

    pub fn wait_queue(&self) -> Option<&Arc<WaitQueue>> {
        self.wait_queue.as_ref()
    }

    pub fn status_oracle(&self) -> &StatusOracle<S> {
        &self.oracle
    }

    fn active_wait_queue(&self) -> Option<&Arc<WaitQueue>> {
        self.wait_queue
            .as_ref()
            .filter(|_| self.config.enable_wait_queues)
    }

    /// Resolves conflicts of a transactional write whose keys are covered by
    /// `lock_batch`.
    ///
    /// On success the returned hybrid time is at least every conflicting
    /// commit time seen, and `lock_batch` is locked. On error the batch may
    /// have been released.
    pub async fn resolve_transaction_conflicts(
        &self,
        request: TransactionConflictRequest,
        lock_batch: &mut LockBatch,
    ) -> Result<HybridTime> {
        let mut ctx = ResolutionContext::for_transaction(request);
        self.run(&mut ctx, lock_batch).await
    }

    /// Resolves conflicts of a non-transactional write.
    ///
    /// Committed data never rejects an operation; instead the returned time
    /// is pushed past the newest conflicting commit. Pending conflicts are
    /// handled by the policy with the operation holding the highest priority.
    pub async fn resolve_operation_conflicts(
        &self,
        request: OperationConflictRequest,
        lock_batch: &mut LockBatch,
    ) -> Result<HybridTime> {
        let mut ctx = ResolutionContext::for_operation(request);
        self.run(&mut ctx, lock_batch).await
    }

    async fn run(&self, ctx: &mut ResolutionContext, lock_batch: &mut LockBatch) -> Result<HybridTime> {
        let result = self.resolve_loop(ctx, lock_batch).await;
        match &result {
            Ok(ht) => {
                ctx.transition(ResolverState::Proceed);
                debug!(
                    "Resolution of {} proceeds at {} after {} attempts",
                    ctx.waiter_id, ht, ctx.attempts
                );
            }
            Err(e) => {
                ctx.transition(ResolverState::Reject);
                debug!("Resolution of {} rejected: {}", ctx.waiter_id, e);
            }
        }
        result
    }

    async fn resolve_loop(
        &self,
        ctx: &mut ResolutionContext,
        lock_batch: &mut LockBatch,
    ) -> Result<HybridTime> {
        if !lock_batch.is_locked() {
            return Err(MaatError::Internal(
                "conflict resolution requires a locked batch".to_string(),
            ));
        }
        loop {
            ctx.attempts += 1;
            ctx.check_deadline()?;
            ctx.transition(ResolverState::Scanning);
            let scan = scan_conflicts(&self.doc_db, &ctx.write_set, &ctx.scan_options())?;
            if scan.is_empty() {
                return Ok(ctx.resolution_ht);
            }

            ctx.transition(ResolverState::AwaitingStatus);
            let observed_at = Instant::now();
            let statuses = with_deadline(
                ctx.deadline,
                "awaiting transaction statuses",
                self.oracle.fetch(scan.transaction_ids(), ctx.resolution_ht),
            )
            .await?;

            ctx.transition(ResolverState::Deciding);
            let visible_floor = match ctx.mode {
                ResolutionMode::Transaction => ctx.read_time,
                ResolutionMode::Operation => None,
            };
            let conflicts =
                ConflictingTransactions::build(ctx.requester, &scan, &statuses, visible_floor);
            if conflicts.has_committed() || conflicts.pending().next().is_some() {
                self.conflicts_metric.fetch_add(1, Ordering::Relaxed);
            }
            let decision = decide(
                &conflicts,
                &DecisionContext {
                    mode: ctx.mode,
                    policy: ctx.policy,
                    requester_priority: ctx.requester_priority,
                    resolution_ht: ctx.resolution_ht,
                    wait_queue_available: self.active_wait_queue().is_some(),
                },
            )?;

            match decision {
                Decision::Proceed { resolution_ht } => return Ok(resolution_ht),
                Decision::RejectConflict(detail) => {
                    return Err(MaatError::Conflict(Box::new(detail)));
                }
                Decision::RejectSkip(detail) => {
                    return Err(MaatError::SkipLocking(Box::new(detail)));
                }
                Decision::AbortThenProceed {
                    victims,
                    resolution_ht,
                } => {
                    info!(
                        "Aborting {} lower priority transactions for {}",
                        victims.len(),
                        ctx.waiter_id
                    );
                    let aborted = with_deadline(ctx.deadline, "aborting conflicts", async {
                        Ok::<_, MaatError>(self.oracle.abort_all(&victims, ctx.requester).await)
                    })
                    .await?;
                    return match aborted {
                        Ok(()) => Ok(resolution_ht),
                        Err(failure) => {
                            let mut detail = conflicts.detail();
                            detail.max_commit_ht = detail.max_commit_ht.max(failure.max_commit_ht());
                            Err(MaatError::Conflict(Box::new(detail)))
                        }
                    };
                }
                Decision::Wait { blockers } => {
                    ctx.transition(ResolverState::Suspended);
                    self.wait(ctx, blockers, observed_at, lock_batch).await?;
                }
            }
        }
    }

    async fn wait(
        &self,
        ctx: &ResolutionContext,
        blockers: Vec<TransactionId>,
        observed_at: Instant,
        lock_batch: &mut LockBatch,
    ) -> Result<()> {
        let queue = self.active_wait_queue().ok_or_else(|| {
            MaatError::Configuration("wait queue disappeared during resolution".to_string())
        })?;
        debug!(
            "{} waits for {} blockers: {:?}",
            ctx.waiter_id,
            blockers.len(),
            blockers
        );

        let bridge = LockBridge::release(lock_batch);
        let (tx, rx) = oneshot::channel::<WakeReason>();
        let registration = queue.enqueue_observed(
            ctx.waiter_id,
            blockers,
            observed_at,
            Box::new(move |reason| {
                let _ = tx.send(reason);
            }),
        );
        let guard = RegistrationGuard {
            queue,
            registration,
        };

        let reason = with_deadline(ctx.deadline, "waiting on conflicting transactions", async move {
            rx.await.map_err(|_| {
                MaatError::Internal("wait registration dropped without resuming".to_string())
            })
        })
        .await?;
        drop(guard);

        match reason {
            WakeReason::BlockersResolved => {
                bridge.reacquire(ctx.deadline).await?;
                trace!("{} resumed with lock batch reacquired", ctx.waiter_id);
                Ok(())
            }
            WakeReason::Deadlock => {
                warn!("{} aborted as deadlock victim", ctx.waiter_id);
                Err(MaatError::Deadlock(ctx.waiter_id))
            }
            WakeReason::StatusUnavailable(message) => Err(MaatError::StatusUnavailable(message)),
        }
    }
}

impl<S: TransactionStatusManager> ConflictResolver<S> {
    /// Callback flavour of [`resolve_transaction_conflicts`]: the resolution
    /// runs as a task on `runtime` and `callback` receives the outcome.
    ///
    /// [`resolve_transaction_conflicts`]: Self::resolve_transaction_conflicts
    pub fn resolve_transaction_conflicts_with_callback(
        self: &Arc<Self>,
        runtime: &Handle,
        request: TransactionConflictRequest,
        mut lock_batch: LockBatch,
        callback: ResolutionCallback,
    ) {
        let resolver = Arc::clone(self);
        runtime.spawn(async move {
            let result = resolver
                .resolve_transaction_conflicts(request, &mut lock_batch)
                .await;
            callback(result, lock_batch);
        });
    }

    /// Callback flavour of [`resolve_operation_conflicts`].
    ///
    /// [`resolve_operation_conflicts`]: Self::resolve_operation_conflicts
    pub fn resolve_operation_conflicts_with_callback(
        self: &Arc<Self>,
        runtime: &Handle,
        request: OperationConflictRequest,
        mut lock_batch: LockBatch,
        callback: ResolutionCallback,
    ) {
        let resolver = Arc::clone(self);
        runtime.spawn(async move {
            let result = resolver
                .resolve_operation_conflicts(request, &mut lock_batch)
                .await;
            callback(result, lock_batch);
        });
    }

    /// Blocks the calling thread until resolution finishes. Must not be
    /// called from inside the runtime.
    pub fn resolve_transaction_conflicts_blocking(
        &self,
        runtime: &Handle,
        request: TransactionConflictRequest,
        lock_batch: &mut LockBatch,
    ) -> Result<HybridTime> {
        runtime.block_on(self.resolve_transaction_conflicts(request, lock_batch))
    }

    pub fn resolve_operation_conflicts_blocking(
        &self,
        runtime: &Handle,
        request: OperationConflictRequest,
        lock_batch: &mut LockBatch,
    ) -> Result<HybridTime> {
        runtime.block_on(self.resolve_operation_conflicts(request, lock_batch))
    }
}
