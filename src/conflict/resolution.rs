use std::collections::BTreeMap;
use std::fmt;

use log::debug;

use crate::conflict::detection::ScanResult;
use crate::errors::{ConflictDetail, ConflictingTransaction, MaatError, Result};
use crate::hybrid_time::HybridTime;
use crate::intent::types::IntentTypeSet;
use crate::policy::ConflictManagementPolicy;
use crate::status::TransactionStatus;
use crate::status::oracle::StatusSnapshot;
use crate::transaction_id::{TransactionId, TransactionPriority};

/// What is known about one conflicting transaction within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictEntry {
    pub intent_types: IntentTypeSet,
    pub status: TransactionStatus,
}

/// Conflicting transactions of a single resolution attempt, keyed by id.
///
/// Built fresh from a scan and a status snapshot every attempt; never reused.
#[derive(Debug, Clone, Default)]
pub struct ConflictingTransactions {
    pub requester: Option<TransactionId>,
    pub entries: BTreeMap<TransactionId, ConflictEntry>,
    /// Newest committed regular value that overlapped the write set.
    pub committed_values_max_ht: Option<HybridTime>,
}

impl ConflictingTransactions {
    /// Joins scan output with statuses.
    ///
    /// Transactions committed at or before `visible_commit_floor` wrote data
    /// the requester already reads and are dropped; pass `None` to keep every
    /// commit (operation writes).
    pub fn build(
        requester: Option<TransactionId>,
        scan: &ScanResult,
        statuses: &StatusSnapshot,
        visible_commit_floor: Option<HybridTime>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for (id, types) in &scan.intents {
            let status = statuses
                .get(id)
                .copied()
                .unwrap_or(TransactionStatus::Aborted);
            if let (TransactionStatus::Committed { commit_ht }, Some(floor)) =
                (status, visible_commit_floor)
            {
                if commit_ht <= floor {
                    continue;
                }
            }
            entries.insert(
                *id,
                ConflictEntry {
                    intent_types: *types,
                    status,
                },
            );
        }
        Self {
            requester,
            entries,
            committed_values_max_ht: scan.committed_values_max_ht,
        }
    }

    pub fn committed(&self) -> impl Iterator<Item = (TransactionId, HybridTime)> + '_ {
        self.entries.iter().filter_map(|(id, e)| match e.status {
            TransactionStatus::Committed { commit_ht } => Some((*id, commit_ht)),
            _ => None,
        })
    }

    pub fn pending(&self) -> impl Iterator<Item = (TransactionId, TransactionPriority)> + '_ {
        self.entries.iter().filter_map(|(id, e)| match e.status {
            TransactionStatus::Pending { priority } => Some((*id, priority)),
            _ => None,
        })
    }

    /// Highest commit time among committed intents and committed values.
    pub fn max_commit_ht(&self) -> Option<HybridTime> {
        self.committed()
            .map(|(_, ht)| ht)
            .chain(self.committed_values_max_ht)
            .max()
    }

    pub fn has_committed(&self) -> bool {
        self.max_commit_ht().is_some()
    }

    /// Structured detail for a rejection. Aborted owners are left out.
    pub fn detail(&self) -> ConflictDetail {
        ConflictDetail {
            requester: self.requester,
            conflicts: self
                .entries
                .iter()
                .filter(|(_, e)| e.status != TransactionStatus::Aborted)
                .map(|(id, e)| ConflictingTransaction {
                    transaction_id: *id,
                    intent_types: e.intent_types,
                    status: e.status,
                })
                .collect(),
            max_commit_ht: self.max_commit_ht(),
        }
    }
}

/// Whether resolution runs for a distributed transaction or a single
/// non-transactional operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Committed conflicts reject the requester.
    Transaction,
    /// Committed conflicts push the resolution time past them instead.
    Operation,
}

/// Inputs of a single policy decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext {
    pub mode: ResolutionMode,
    pub policy: ConflictManagementPolicy,
    pub requester_priority: TransactionPriority,
    pub resolution_ht: HybridTime,
    /// A wait queue is configured and enabled.
    pub wait_queue_available: bool,
}

/// Outcome of applying the policy to one attempt's conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed { resolution_ht: HybridTime },
    RejectConflict(ConflictDetail),
    RejectSkip(ConflictDetail),
    /// Abort every victim; proceed at `resolution_ht` if all acknowledge.
    AbortThenProceed {
        victims: Vec<TransactionId>,
        resolution_ht: HybridTime,
    },
    /// Suspend until every blocker reaches a terminal status.
    Wait { blockers: Vec<TransactionId> },
}

/// Applies `ctx.policy` to `conflicts`.
///
/// Pure: performs no I/O. The only error is a configuration error for
/// `WaitOnConflict` without a usable wait queue.
pub fn decide(conflicts: &ConflictingTransactions, ctx: &DecisionContext) -> Result<Decision> {
    let mut resolution_ht = ctx.resolution_ht;
    if let Some(max_commit_ht) = conflicts.max_commit_ht() {
        match ctx.mode {
            ResolutionMode::Transaction => {
                debug!("Conflict with committed data at {max_commit_ht}");
                let detail = conflicts.detail();
                return Ok(match ctx.policy {
                    ConflictManagementPolicy::SkipOnConflict => Decision::RejectSkip(detail),
                    _ => Decision::RejectConflict(detail),
                });
            }
            ResolutionMode::Operation => resolution_ht = resolution_ht.max(max_commit_ht),
        }
    }

    let pending: Vec<(TransactionId, TransactionPriority)> = conflicts.pending().collect();
    if pending.is_empty() {
        return Ok(Decision::Proceed { resolution_ht });
    }

    match ctx.policy {
        ConflictManagementPolicy::SkipOnConflict => Ok(Decision::RejectSkip(conflicts.detail())),
        ConflictManagementPolicy::FailOnConflict => {
            if pending
                .iter()
                .all(|(_, priority)| ctx.requester_priority > *priority)
            {
                Ok(Decision::AbortThenProceed {
                    victims: pending.into_iter().map(|(id, _)| id).collect(),
                    resolution_ht,
                })
            } else {
                debug!(
                    "Requester priority {} does not exceed every pending conflict",
                    ctx.requester_priority
                );
                Ok(Decision::RejectConflict(conflicts.detail()))
            }
        }
        ConflictManagementPolicy::WaitOnConflict => {
            if !ctx.wait_queue_available {
                return Err(MaatError::Configuration(
                    "WAIT_ON_CONFLICT requires an enabled wait queue".to_string(),
                ));
            }
            Ok(Decision::Wait {
                blockers: pending.into_iter().map(|(id, _)| id).collect(),
            })
        }
    }
}

/// Where a resolution attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Init,
    Scanning,
    AwaitingStatus,
    Deciding,
    Suspended,
    Proceed,
    Reject,
}

impl ResolverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResolverState::Proceed | ResolverState::Reject)
    }
}

impl fmt::Display for ResolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolverState::Init => "INIT",
            ResolverState::Scanning => "SCANNING",
            ResolverState::AwaitingStatus => "AWAITING_STATUS",
            ResolverState::Deciding => "DECIDING",
            ResolverState::Suspended => "SUSPENDED",
            ResolverState::Proceed => "PROCEED",
            ResolverState::Reject => "REJECT",
        };
        f.write_str(name)
    }
}
