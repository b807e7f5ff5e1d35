/// Ordered key-space abstraction and its in-memory implementation.
pub mod key_space;
/// RocksDB-backed key spaces.
#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::sync::Arc;

use log::debug;

use crate::errors::Result;
use crate::hybrid_time::DocHybridTime;
use crate::intent::codec::{
    INTENT_PREFIX, decode_intent_value, encode_intent_key, encode_intent_value,
    encode_regular_key, parse_intent_key,
};
use crate::intent::doc_path::DocPath;
use crate::intent::lock_info::{LockInfo, TableInfoProvider, populate_lock_info_from_parsed_intent};
use crate::intent::types::IntentTypeSet;
use crate::transaction_id::TransactionId;
use key_space::{KeySpace, MemoryKeySpace};

/// Handle to a tablet's data: committed records and provisional intents live
/// in separate key spaces.
#[derive(Clone)]
pub struct DocDb {
    pub regular: Arc<dyn KeySpace>,
    pub intents: Arc<dyn KeySpace>,
}

impl DocDb {
    pub fn new(regular: Arc<dyn KeySpace>, intents: Arc<dyn KeySpace>) -> Self {
        Self { regular, intents }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryKeySpace::new()),
            Arc::new(MemoryKeySpace::new()),
        )
    }

    /// Opens a RocksDB instance with `regular` and `intents` column families.
    #[cfg(feature = "rocksdb")]
    pub fn open_rocksdb(path: &std::path::Path) -> Result<Self> {
        let db = rocks::open(path)?;
        Ok(Self::new(
            Arc::new(rocks::RocksKeySpace::new(Arc::clone(&db), rocks::REGULAR_CF)),
            Arc::new(rocks::RocksKeySpace::new(db, rocks::INTENTS_CF)),
        ))
    }

    /// Writes one provisional record owned by `transaction_id`.
    pub fn put_intent(
        &self,
        path: &DocPath,
        types: IntentTypeSet,
        doc_ht: DocHybridTime,
        transaction_id: TransactionId,
        body: &[u8],
    ) -> Result<()> {
        let key = encode_intent_key(&path.encode(), types, doc_ht);
        let value = encode_intent_value(transaction_id, doc_ht.write_id, body);
        self.intents.put(key, value)
    }

    /// Writes one committed record.
    pub fn put_regular(&self, path: &DocPath, doc_ht: DocHybridTime, value: &[u8]) -> Result<()> {
        self.regular
            .put(encode_regular_key(&path.encode(), doc_ht), value.to_vec())
    }

    /// Deletes every intent owned by `transaction_id`, returning how many were
    /// removed. Called once a transaction has been applied or rolled back.
    pub fn remove_intents_of(&self, transaction_id: TransactionId) -> Result<usize> {
        let mut doomed = Vec::new();
        self.intents
            .for_each_with_prefix(&[INTENT_PREFIX], &mut |key, value| {
                if decode_intent_value(value)?.transaction_id == transaction_id {
                    doomed.push(key.to_vec());
                }
                Ok(true)
            })?;
        for key in &doomed {
            self.intents.delete(key)?;
        }
        debug!(
            "Removed {} intents of transaction {}",
            doomed.len(),
            transaction_id
        );
        Ok(doomed.len())
    }

    /// Renders every stored intent as a lock info record.
    pub fn intent_lock_infos(&self, tables: &dyn TableInfoProvider) -> Result<Vec<LockInfo>> {
        let mut out = Vec::new();
        self.intents
            .for_each_with_prefix(&[INTENT_PREFIX], &mut |key, value| {
                let parsed = parse_intent_key(key, value)?;
                let decoded = decode_intent_value(value)?;
                let mut info = LockInfo::default();
                populate_lock_info_from_parsed_intent(&parsed, Some(&decoded), tables, &mut info, true)?;
                out.push(info);
                Ok(true)
            })?;
        Ok(out)
    }
}
