use serde::{Deserialize, Serialize};

/// How a writer reacts to intents of other transactions on the keys it is
/// about to write.
///
/// A conflict with already committed data rejects a transactional writer:
/// with a skip-locking outcome under [`SkipOnConflict`], with a conflict
/// otherwise. Beyond that the policies differ in how pending competitors
/// are handled.
///
/// [`SkipOnConflict`]: ConflictManagementPolicy::SkipOnConflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictManagementPolicy {
    /// **Wait on conflict:**
    ///
    /// The writer releases its locks, parks in the wait queue until every
    /// pending competitor has committed or aborted, then re-runs conflict
    /// resolution from scratch. Requires a wait queue.
    WaitOnConflict,
    /// **Skip on conflict:**
    ///
    /// Any conflict, committed data or a pending competitor of any priority,
    /// rejects the writer with a skip-locking outcome. Never waits and never
    /// aborts anybody.
    SkipOnConflict,
    /// **Fail on conflict:**
    ///
    /// If the writer's priority is strictly higher than that of every pending
    /// competitor, the competitors are aborted and the writer proceeds once
    /// every abort is acknowledged. Otherwise the writer is rejected with a
    /// conflict immediately.
    FailOnConflict,
}
