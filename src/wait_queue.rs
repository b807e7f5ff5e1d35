//! Registry of suspended resolution attempts and the transactions blocking
//! them.
//!
//! A waiter is registered against a set of blocker transaction ids together
//! with a resume callback. The callback fires at most once: when the last
//! blocker finishes, when a deadlock is signalled for the waiter, or when the
//! status authority stays unreachable for too long. Callbacks always run
//! after the internal lock has been released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ResolverConfig;
use crate::hybrid_time::HybridTime;
use crate::status::TransactionStatusManager;
use crate::status::oracle::StatusOracle;
use crate::transaction_id::TransactionId;

/// Why a waiter was resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    /// Every blocker reached a terminal status; re-run resolution.
    BlockersResolved,
    /// The waiter is part of a wait-for cycle and was chosen as the victim.
    Deadlock,
    /// Blocker statuses could not be obtained for too long.
    StatusUnavailable(String),
}

/// Invoked exactly once with the reason a waiter was resumed. Dropped
/// without being called if the registration is cancelled.
pub type ResumeCallback = Box<dyn FnOnce(WakeReason) + Send + 'static>;

struct Waiter {
    serial: u64,
    blockers: HashSet<TransactionId>,
    resume: ResumeCallback,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    waiters: HashMap<TransactionId, Waiter>,
    /// Blocker id to the waiters registered against it.
    blocking: HashMap<TransactionId, HashSet<TransactionId>>,
    recently_finished: HashMap<TransactionId, Instant>,
    unreachable_since: Option<Instant>,
}

impl QueueState {
    fn detach(&mut self, waiter_id: TransactionId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&waiter_id)?;
        for blocker in &waiter.blockers {
            if let Some(waiters) = self.blocking.get_mut(blocker) {
                waiters.remove(&waiter_id);
                if waiters.is_empty() {
                    self.blocking.remove(blocker);
                }
            }
        }
        Some(waiter)
    }

    fn purge_finished(&mut self, now: Instant, retention: std::time::Duration) {
        self.recently_finished
            .retain(|_, finished_at| now.duration_since(*finished_at) < retention);
    }
}

/// Handle identifying one registration, returned by [`WaitQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRegistration {
    pub waiter: TransactionId,
    pub serial: u64,
    /// False when every blocker had already finished and the callback fired
    /// immediately.
    pub queued: bool,
}

pub struct WaitQueue {
    state: Mutex<QueueState>,
    config: ResolverConfig,
    next_serial: AtomicU64,
}

impl WaitQueue {
    pub fn new(config: ResolverConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            config,
            next_serial: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Registers `waiter` against `blockers`.
    ///
    /// Blockers known to have finished recently are dropped; if none remain
    /// the callback fires right away with [`WakeReason::BlockersResolved`].
    /// A waiter already present under the same id is replaced and its
    /// callback dropped.
    pub fn enqueue<I>(&self, waiter: TransactionId, blockers: I, resume: ResumeCallback) -> WaitRegistration
    where
        I: IntoIterator<Item = TransactionId>,
    {
        self.register(waiter, blockers, None, resume)
    }

    /// Like [`enqueue`](Self::enqueue) for blockers whose status was observed
    /// as pending at `observed_at`.
    ///
    /// Only finishes recorded at or after `observed_at` drop a blocker. An
    /// earlier finish signal was spurious as far as this waiter is concerned,
    /// since the blocker was still pending when its status was read.
    pub fn enqueue_observed<I>(
        &self,
        waiter: TransactionId,
        blockers: I,
        observed_at: Instant,
        resume: ResumeCallback,
    ) -> WaitRegistration
    where
        I: IntoIterator<Item = TransactionId>,
    {
        self.register(waiter, blockers, Some(observed_at), resume)
    }

    fn register<I>(
        &self,
        waiter: TransactionId,
        blockers: I,
        observed_at: Option<Instant>,
        resume: ResumeCallback,
    ) -> WaitRegistration
    where
        I: IntoIterator<Item = TransactionId>,
    {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_finished(now, self.config.recently_finished_retention);

        let blockers: HashSet<TransactionId> = blockers
            .into_iter()
            .filter(|id| {
                let finished = state.recently_finished.get(id).is_some_and(|finished_at| {
                    observed_at.is_none_or(|observed_at| *finished_at >= observed_at)
                });
                *id != waiter && !finished
            })
            .collect();
        let replaced = state.detach(waiter);

        if blockers.is_empty() {
            drop(state);
            drop(replaced);
            debug!("{waiter} has no live blockers, resuming immediately");
            resume(WakeReason::BlockersResolved);
            return WaitRegistration {
                waiter,
                serial,
                queued: false,
            };
        }

        for blocker in &blockers {
            state.blocking.entry(*blocker).or_default().insert(waiter);
        }
        debug!("{waiter} waits on {} blockers", blockers.len());
        state.waiters.insert(
            waiter,
            Waiter {
                serial,
                blockers,
                resume,
                enqueued_at: now,
            },
        );
        drop(state);
        if replaced.is_some() {
            warn!("Replaced an existing wait registration of {waiter}");
        }
        WaitRegistration {
            waiter,
            serial,
            queued: true,
        }
    }

    /// Removes the registration of `waiter` without firing its callback.
    /// Returns false if it had already been resumed or cancelled.
    pub fn cancel(&self, waiter: TransactionId) -> bool {
        let removed = self.state.lock().detach(waiter);
        match removed {
            Some(w) => {
                trace!("Cancelled wait of {waiter} (serial {})", w.serial);
                true
            }
            None => false,
        }
    }

    /// Cancels only if the registration is still the one identified by
    /// `registration`, so a stale handle never removes a newer wait.
    pub fn cancel_registration(&self, registration: &WaitRegistration) -> bool {
        let mut state = self.state.lock();
        let current = state.waiters.get(&registration.waiter).map(|w| w.serial);
        if current != Some(registration.serial) {
            return false;
        }
        let removed = state.detach(registration.waiter);
        drop(state);
        drop(removed);
        true
    }

    /// Records that `transaction_id` reached a terminal status and resumes
    /// every waiter left without blockers.
    pub fn signal_finished(&self, transaction_id: TransactionId) -> usize {
        let mut resumed = Vec::new();
        {
            let now = Instant::now();
            let mut state = self.state.lock();
            state.purge_finished(now, self.config.recently_finished_retention);
            state.recently_finished.insert(transaction_id, now);
            let Some(waiters) = state.blocking.remove(&transaction_id) else {
                return 0;
            };
            for waiter_id in waiters {
                let unblocked = match state.waiters.get_mut(&waiter_id) {
                    Some(w) => {
                        w.blockers.remove(&transaction_id);
                        w.blockers.is_empty()
                    }
                    None => false,
                };
                if unblocked {
                    if let Some(w) = state.detach(waiter_id) {
                        resumed.push((waiter_id, w));
                    }
                }
            }
        }
        let count = resumed.len();
        for (waiter_id, w) in resumed {
            debug!(
                "Resuming {waiter_id} after {:?}, blockers resolved",
                w.enqueued_at.elapsed()
            );
            (w.resume)(WakeReason::BlockersResolved);
        }
        count
    }

    /// Resumes `waiter` with [`WakeReason::Deadlock`]. Ignored when deadlock
    /// detection is disabled.
    pub fn signal_deadlock(&self, waiter: TransactionId) -> bool {
        if !self.config.enable_deadlock_detection {
            debug!("Deadlock detection disabled, ignoring signal for {waiter}");
            return false;
        }
        let removed = self.state.lock().detach(waiter);
        match removed {
            Some(w) => {
                warn!("Deadlock detected, resuming {waiter} as victim");
                (w.resume)(WakeReason::Deadlock);
                true
            }
            None => false,
        }
    }

    /// Edges of the wait-for graph: each waiter with its outstanding blockers.
    pub fn wait_for_graph(&self) -> Vec<(TransactionId, Vec<TransactionId>)> {
        let state = self.state.lock();
        let mut graph: Vec<(TransactionId, Vec<TransactionId>)> = state
            .waiters
            .iter()
            .map(|(id, w)| {
                let mut blockers: Vec<TransactionId> = w.blockers.iter().copied().collect();
                blockers.sort_unstable();
                (*id, blockers)
            })
            .collect();
        graph.sort_unstable_by_key(|(id, _)| *id);
        graph
    }

    pub fn num_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_waiting(&self, waiter: TransactionId) -> bool {
        self.state.lock().waiters.contains_key(&waiter)
    }

    /// Finished transactions still remembered for late enqueues.
    pub fn num_recently_finished(&self) -> usize {
        self.state.lock().recently_finished.len()
    }

    /// Every transaction some waiter is blocked on.
    pub fn blocker_ids(&self) -> Vec<TransactionId> {
        self.state.lock().blocking.keys().copied().collect()
    }

    /// One polling round: fetches the status of every blocker and resumes
    /// waiters of those that finished.
    ///
    /// If the authority keeps failing for longer than
    /// `status_unreachable_timeout`, every waiter is resumed with
    /// [`WakeReason::StatusUnavailable`].
    pub async fn poll_once<S: TransactionStatusManager>(&self, oracle: &StatusOracle<S>) {
        let blockers = self.blocker_ids();
        if blockers.is_empty() {
            self.state.lock().unreachable_since = None;
            return;
        }
        match oracle.fetch(blockers, HybridTime::MAX).await {
            Ok(snapshot) => {
                self.state.lock().unreachable_since = None;
                for (id, status) in snapshot {
                    if status.is_terminal() {
                        trace!("Poller saw {id} finish as {status}");
                        self.signal_finished(id);
                    }
                }
            }
            Err(e) => {
                let since = *self
                    .state
                    .lock()
                    .unreachable_since
                    .get_or_insert_with(Instant::now);
                warn!("Wait queue could not poll blocker statuses: {e}");
                if since.elapsed() >= self.config.status_unreachable_timeout {
                    self.fail_all(&e.to_string());
                }
            }
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<(TransactionId, Waiter)> = {
            let mut state = self.state.lock();
            state.blocking.clear();
            state.unreachable_since = None;
            state.waiters.drain().collect()
        };
        warn!(
            "Status authority unreachable, resuming {} waiters: {reason}",
            drained.len()
        );
        for (_, w) in drained {
            (w.resume)(WakeReason::StatusUnavailable(reason.to_string()));
        }
    }

    /// Spawns a background task polling blocker statuses every
    /// `wait_queue_poll_interval`. The task exits once the queue is dropped.
    pub fn spawn_poller<S: TransactionStatusManager>(
        self: &Arc<Self>,
        oracle: StatusOracle<S>,
    ) -> JoinHandle<()> {
        let queue: Weak<Self> = Arc::downgrade(self);
        let period = self.config.wait_queue_poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(queue) = queue.upgrade() else {
                    debug!("Wait queue dropped, stopping poller");
                    return;
                };
                queue.poll_once(&oracle).await;
            }
        })
    }
}
