use std::path::Path;
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options};

use crate::data_store::key_space::{KeySpace, Visitor};
use crate::errors::{MaatError, Result};

pub const REGULAR_CF: &str = "regular";
pub const INTENTS_CF: &str = "intents";

fn storage_error(e: rocksdb::Error) -> MaatError {
    MaatError::Storage(e.to_string())
}

/// Opens (creating if missing) a RocksDB instance holding both key spaces.
pub fn open(path: &Path) -> Result<Arc<DB>> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let cfs = [REGULAR_CF, INTENTS_CF]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
    DB::open_cf_descriptors(&opts, path, cfs)
        .map(Arc::new)
        .map_err(storage_error)
}

/// [`KeySpace`] stored in one RocksDB column family.
pub struct RocksKeySpace {
    db: Arc<DB>,
    cf_name: &'static str,
}

impl RocksKeySpace {
    pub fn new(db: Arc<DB>, cf_name: &'static str) -> Self {
        Self { db, cf_name }
    }

    fn cf(&self) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(self.cf_name)
            .ok_or_else(|| MaatError::Storage(format!("missing column family {}", self.cf_name)))
    }
}

impl KeySpace for RocksKeySpace {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let cf = self.cf()?;
        self.db.put_cf(&cf, key, value).map_err(storage_error)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let cf = self.cf()?;
        self.db.delete_cf(&cf, key).map_err(storage_error)
    }

    fn for_each_with_prefix(&self, prefix: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(storage_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}
