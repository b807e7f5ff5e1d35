//! Diagnostic lock records for "show locks" style introspection.

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{MaatError, Result};
use crate::hybrid_time::HybridTime;
use crate::intent::codec::{DecodedIntentValue, ParsedIntent};
use crate::intent::doc_path::ColocationId;
use crate::intent::types::IntentType;
use crate::transaction_id::TransactionId;

/// Colocation id used for paths that carry no table prefix.
pub const PRIMARY_TABLE_COLOCATION_ID: ColocationId = 0;

/// Table metadata needed to render a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub table_id: String,
    pub table_name: String,
    /// Names of the hash and range key columns, in key order.
    pub key_columns: Vec<String>,
    /// Column id (as stored in the first sub-key) to column name.
    pub columns: HashMap<u32, String>,
}

/// Looks up table metadata by colocation id.
pub trait TableInfoProvider: Send + Sync {
    fn table_info(&self, colocation_id: ColocationId) -> Result<Arc<TableInfo>>;
}

/// [`TableInfoProvider`] backed by the tablet's catalog snapshot.
#[derive(Default)]
pub struct CatalogTableInfoProvider {
    tables: RwLock<HashMap<ColocationId, Arc<TableInfo>>>,
}

impl CatalogTableInfoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the table stored under `colocation_id`.
    pub fn register(&self, colocation_id: ColocationId, info: TableInfo) {
        self.tables.write().insert(colocation_id, Arc::new(info));
    }

    pub fn remove(&self, colocation_id: ColocationId) -> Option<Arc<TableInfo>> {
        self.tables.write().remove(&colocation_id)
    }
}

impl TableInfoProvider for CatalogTableInfoProvider {
    fn table_info(&self, colocation_id: ColocationId) -> Result<Arc<TableInfo>> {
        self.tables
            .read()
            .get(&colocation_id)
            .cloned()
            .ok_or_else(|| {
                MaatError::Internal(format!("no table with colocation id {colocation_id}"))
            })
    }
}

/// One lock as shown to an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub transaction_id: Option<TransactionId>,
    pub write_id: u32,
    pub table_id: String,
    pub table_name: String,
    /// `(column name, rendered value)` for every key component present.
    pub key_values: Vec<(String, String)>,
    /// Column name when the lock is below row level.
    pub column: Option<String>,
    pub is_full_row: bool,
    pub modes: Vec<IntentType>,
    pub hybrid_time: Option<HybridTime>,
}

/// Fills `lock_info` from a parsed intent and its decoded value.
///
/// The intent is expected to carry a hybrid time unless `intent_has_ht` is
/// false, in which case a missing time is not an error. In-memory locks have
/// no stored value; for those `decoded_value` is `None` and the owner fields
/// of `lock_info` are left untouched.
pub fn populate_lock_info_from_parsed_intent(
    parsed_intent: &ParsedIntent<'_>,
    decoded_value: Option<&DecodedIntentValue<'_>>,
    table_info_provider: &dyn TableInfoProvider,
    lock_info: &mut LockInfo,
    intent_has_ht: bool,
) -> Result<()> {
    if intent_has_ht && parsed_intent.doc_ht.is_none() {
        return Err(MaatError::Internal(
            "intent is expected to carry a hybrid time".to_string(),
        ));
    }
    let path = parsed_intent.decoded_doc_path()?;
    let colocation_id = path.colocation_id().unwrap_or(PRIMARY_TABLE_COLOCATION_ID);
    let table = table_info_provider.table_info(colocation_id)?;

    if let Some(value) = decoded_value {
        lock_info.transaction_id = Some(value.transaction_id);
        lock_info.write_id = value.write_id;
    }
    lock_info.table_id = table.table_id.clone();
    lock_info.table_name = table.table_name.clone();
    lock_info.key_values = path
        .key_components()
        .enumerate()
        .map(|(idx, value)| {
            let name = table
                .key_columns
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("key_{idx}"));
            (name, render_value(value))
        })
        .collect();
    lock_info.column = path.subkeys().next().map(|subkey| column_name(&table, subkey));
    lock_info.is_full_row = path.is_full_row();
    lock_info.modes = parsed_intent.types.iter().collect();
    lock_info.hybrid_time = parsed_intent.doc_ht.map(|doc_ht| doc_ht.hybrid_time);
    Ok(())
}

fn column_name(table: &TableInfo, subkey: &[u8]) -> String {
    let id = <[u8; 4]>::try_from(subkey).ok().map(u32::from_be_bytes);
    match id.and_then(|id| table.columns.get(&id)) {
        Some(name) => name.clone(),
        None => render_value(subkey),
    }
}

fn render_value(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", hex::encode(bytes)),
    }
}
