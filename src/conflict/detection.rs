use ahash::AHashMap as HashMap;
use log::trace;

use crate::data_store::DocDb;
use crate::errors::Result;
use crate::hybrid_time::HybridTime;
use crate::intent::codec::{
    HYBRID_TIME_MARKER, INTENT_TYPE_MARKER, debug_intent_key_to_string, decode_intent_value,
    intent_prefix_for, parse_intent_key, parse_regular_key,
};
use crate::intent::doc_path::{DocPath, PathRelation, expand_key_intents};
use crate::intent::types::IntentTypeSet;
use crate::transaction_id::TransactionId;

/// One access the caller is about to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Row, column, or key prefix (range) being accessed.
    pub path: DocPath,
    /// Strong intent types requested on `path`.
    pub intent_types: IntentTypeSet,
}

impl WriteRequest {
    pub fn new(path: DocPath, intent_types: IntentTypeSet) -> Self {
        Self { path, intent_types }
    }

    /// A regular write of `path`.
    pub fn write(path: DocPath) -> Self {
        Self::new(path, IntentTypeSet::strong_write())
    }

    /// A shared row lock on `path`.
    pub fn read_lock(path: DocPath) -> Self {
        Self::new(path, IntentTypeSet::strong_read())
    }
}

/// Parameters of one scan pass.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Intents owned by this transaction are never conflicts.
    pub requester: Option<TransactionId>,
    /// Committed values newer than this are conflicts. `None` skips the
    /// regular key space entirely (operation writes).
    pub read_time: Option<HybridTime>,
    /// Upper bound for committed values taken into account.
    pub resolution_ht: HybridTime,
    pub partial_range_key_intents: bool,
}

/// Everything a scan pass found overlapping the write set.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Conflicting transaction to the union of intent types it holds on the
    /// overlapping keys. Never contains the requester.
    pub intents: HashMap<TransactionId, IntentTypeSet>,
    /// Newest committed regular value overlapping the write set.
    pub committed_values_max_ht: Option<HybridTime>,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty() && self.committed_values_max_ht.is_none()
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.intents.keys().copied()
    }

    fn record_intent(&mut self, transaction_id: TransactionId, types: IntentTypeSet) {
        let entry = self.intents.entry(transaction_id).or_default();
        *entry = entry.union(types);
    }

    fn record_committed_value(&mut self, ht: HybridTime) {
        self.committed_values_max_ht = Some(self.committed_values_max_ht.map_or(ht, |m| m.max(ht)));
    }
}

/// Finds every intent and committed value overlapping `write_set`.
///
/// Overlap is structural: an intent on the requested path, on one of its
/// ancestors, or on one of its descendants is checked against the requested
/// intent types (weakened for ancestors and descendants) using the intent
/// conflict matrix. The traversal is read-only; storage errors abort the scan.
pub fn scan_conflicts(
    doc_db: &DocDb,
    write_set: &[WriteRequest],
    options: &ScanOptions,
) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    for request in write_set {
        for (path, types) in
            expand_key_intents(&request.path, request.intent_types, options.partial_range_key_intents)
        {
            let encoded = path.encode();
            if path == request.path {
                scan_subtree_intents(doc_db, &path, &encoded, types, options, &mut result)?;
                if let Some(read_time) = options.read_time {
                    scan_committed(doc_db, &encoded, read_time, options, &mut result)?;
                }
            } else {
                scan_exact_intents(doc_db, &encoded, types, options, &mut result)?;
                if let Some(read_time) = options.read_time {
                    let mut prefix = encoded;
                    prefix.push(HYBRID_TIME_MARKER);
                    scan_committed(doc_db, &prefix, read_time, options, &mut result)?;
                }
            }
        }
    }
    Ok(result)
}

/// Intents on `path` itself and on every descendant.
fn scan_subtree_intents(
    doc_db: &DocDb,
    path: &DocPath,
    encoded: &[u8],
    types: IntentTypeSet,
    options: &ScanOptions,
    result: &mut ScanResult,
) -> Result<()> {
    doc_db
        .intents
        .for_each_with_prefix(&intent_prefix_for(encoded), &mut |key, value| {
            let parsed = parse_intent_key(key, value)?;
            let relation = path.relation(&parsed.decoded_doc_path()?);
            let theirs = match relation {
                PathRelation::Equal => parsed.types,
                PathRelation::Ancestor => parsed.types.weakened(),
                PathRelation::Descendant | PathRelation::Disjoint => return Ok(true),
            };
            check_intent(key, value, types, theirs, options, result)?;
            Ok(true)
        })
}

/// Intents whose doc path is exactly the ancestor encoded as `encoded`.
fn scan_exact_intents(
    doc_db: &DocDb,
    encoded: &[u8],
    types: IntentTypeSet,
    options: &ScanOptions,
    result: &mut ScanResult,
) -> Result<()> {
    let mut prefix = intent_prefix_for(encoded);
    prefix.push(INTENT_TYPE_MARKER);
    doc_db
        .intents
        .for_each_with_prefix(&prefix, &mut |key, value| {
            let parsed = parse_intent_key(key, value)?;
            check_intent(key, value, types, parsed.types, options, result)?;
            Ok(true)
        })
}

fn check_intent(
    key: &[u8],
    value: &[u8],
    ours: IntentTypeSet,
    theirs: IntentTypeSet,
    options: &ScanOptions,
    result: &mut ScanResult,
) -> Result<()> {
    if !ours.conflicts_with(theirs) {
        return Ok(());
    }
    let owner = decode_intent_value(value)?.transaction_id;
    if Some(owner) == options.requester {
        return Ok(());
    }
    trace!(
        "Conflicting intent of {}: {}",
        owner,
        debug_intent_key_to_string(key)
    );
    result.record_intent(owner, theirs);
    Ok(())
}

fn scan_committed(
    doc_db: &DocDb,
    prefix: &[u8],
    read_time: HybridTime,
    options: &ScanOptions,
    result: &mut ScanResult,
) -> Result<()> {
    doc_db.regular.for_each_with_prefix(prefix, &mut |key, _value| {
        let (_, doc_ht) = parse_regular_key(key)?;
        let ht = doc_ht.hybrid_time;
        if ht > read_time && ht <= options.resolution_ht {
            trace!("Committed value at {} newer than read time {}", ht, read_time);
            result.record_committed_value(ht);
        }
        Ok(true)
    })
}
