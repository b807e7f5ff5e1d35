//! Common utilities for Maat integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use maat::errors::Result;
use maat::intent::doc_path::{ColocationId, expand_key_intents};
use maat::intent::lock_info::{TableInfo, TableInfoProvider};
use maat::prelude::*;
use maat::status::AbortOutcome;

pub const TABLE: ColocationId = 16384;

/// Hybrid time with the given physical microseconds.
pub fn ht(micros: u64) -> HybridTime {
    HybridTime::from_micros(micros, 0)
}

/// Full row `k` of the test table.
pub fn row(key: &str) -> DocPath {
    DocPath::row(Some(TABLE), [key])
}

/// Column `column` of row `key`.
pub fn column(key: &str, column: u32) -> DocPath {
    row(key).with_subkey(column.to_be_bytes())
}

/// Everything a resolution needs, wired together the way a tablet would.
pub struct Fixture {
    pub doc_db: DocDb,
    pub authority: Arc<InMemoryStatusAuthority>,
    pub queue: Arc<WaitQueue>,
    pub locks: Arc<SharedLockManager>,
    pub resolver: Arc<ConflictResolver<InMemoryStatusAuthority>>,
}

pub fn setup() -> Fixture {
    setup_with_config(ResolverConfig::default())
}

pub fn setup_with_config(config: ResolverConfig) -> Fixture {
    let doc_db = DocDb::in_memory();
    let authority = InMemoryStatusAuthority::new();
    let queue = WaitQueue::new(config.clone());
    authority.attach_wait_queue(Arc::clone(&queue));
    let resolver = ConflictResolver::new(
        doc_db.clone(),
        Arc::clone(&authority),
        Some(Arc::clone(&queue)),
        config,
    )
    .expect("valid config");
    Fixture {
        doc_db,
        authority,
        queue,
        locks: SharedLockManager::new(),
        resolver: Arc::new(resolver),
    }
}

impl Fixture {
    /// Registers a pending transaction and writes its intents on `paths`,
    /// weak ones on the ancestors included.
    pub fn pending_writer(&self, paths: &[DocPath], priority: u64, write_ht: HybridTime) -> TransactionId {
        let id = TransactionId::generate();
        self.authority.register(id, priority);
        write_intents(&self.doc_db, id, paths, write_ht);
        id
    }

    pub async fn lock(&self, owner: Option<TransactionId>, write_set: &[WriteRequest]) -> LockBatch {
        self.locks
            .lock(owner, LockEntry::for_write_set(write_set, false), None)
            .await
            .expect("lock batch")
    }
}

pub fn write_intents(doc_db: &DocDb, id: TransactionId, paths: &[DocPath], write_ht: HybridTime) {
    for (write_id, path) in paths.iter().enumerate() {
        for (key, types) in expand_key_intents(path, IntentTypeSet::strong_write(), false) {
            doc_db
                .put_intent(
                    &key,
                    types,
                    DocHybridTime::new(write_ht, write_id as u32),
                    id,
                    b"value",
                )
                .expect("intent written");
        }
    }
}

pub fn writes(paths: &[DocPath]) -> Vec<WriteRequest> {
    paths.iter().cloned().map(WriteRequest::write).collect()
}

pub fn txn_request(
    transaction: TransactionMetadata,
    policy: ConflictManagementPolicy,
    write_set: Vec<WriteRequest>,
    read_time: HybridTime,
) -> TransactionConflictRequest {
    TransactionConflictRequest {
        transaction,
        policy,
        write_set,
        initial_resolution_ht: ht(1_000),
        read_time,
        partial_range_key_intents: false,
        deadline: None,
    }
}

pub fn op_request(policy: ConflictManagementPolicy, write_set: Vec<WriteRequest>) -> OperationConflictRequest {
    OperationConflictRequest {
        policy,
        write_set,
        initial_resolution_ht: ht(1_000),
        partial_range_key_intents: false,
        deadline: None,
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// --- Test doubles ---

/// Table catalog with a single two-column table.
pub struct TestTables;

impl TableInfoProvider for TestTables {
    fn table_info(&self, colocation_id: ColocationId) -> Result<Arc<TableInfo>> {
        if colocation_id != TABLE {
            return Err(MaatError::Internal(format!("unknown table {colocation_id}")));
        }
        let mut columns = HashMap::new();
        columns.insert(1, "balance".to_string());
        columns.insert(2, "owner".to_string());
        Ok(Arc::new(TableInfo {
            table_id: "000033e1000030008000000000004000".to_string(),
            table_name: "accounts".to_string(),
            key_columns: vec!["id".to_string()],
            columns,
        }))
    }
}

/// Status authority whose victims always win the abort race: every abort
/// request commits the victim at `commit_ht` first.
pub struct RacingCommitAuthority {
    pub inner: Arc<InMemoryStatusAuthority>,
    pub commit_ht: HybridTime,
}

impl TransactionStatusManager for RacingCommitAuthority {
    fn request_statuses(
        &self,
        ids: Vec<TransactionId>,
        read_ht: HybridTime,
    ) -> impl Future<Output = Result<Vec<(TransactionId, StatusResponse)>>> + Send {
        self.inner.request_statuses(ids, read_ht)
    }

    fn abort_transaction(
        &self,
        victim: TransactionId,
        requester: Option<TransactionId>,
    ) -> impl Future<Output = Result<AbortOutcome>> + Send {
        self.inner.commit(victim, self.commit_ht);
        self.inner.abort_transaction(victim, requester)
    }
}

/// Status authority that counts round-trips and answers every id as pending.
#[derive(Default)]
pub struct CountingAuthority {
    pub round_trips: AtomicU32,
    pub largest_batch: AtomicU32,
}

impl TransactionStatusManager for CountingAuthority {
    fn request_statuses(
        &self,
        ids: Vec<TransactionId>,
        _read_ht: HybridTime,
    ) -> impl Future<Output = Result<Vec<(TransactionId, StatusResponse)>>> + Send {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.largest_batch
            .fetch_max(ids.len() as u32, Ordering::SeqCst);
        let answer = ids
            .into_iter()
            .map(|id| (id, StatusResponse::Pending { priority: 1 }))
            .collect();
        futures::future::ready(Ok(answer))
    }

    fn abort_transaction(
        &self,
        _victim: TransactionId,
        _requester: Option<TransactionId>,
    ) -> impl Future<Output = Result<AbortOutcome>> + Send {
        futures::future::ready(Ok(AbortOutcome::Aborted))
    }
}
