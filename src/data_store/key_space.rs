use std::ops::Bound;

use crossbeam_skiplist::SkipMap;

use crate::errors::Result;

/// Callback invoked for each record of a prefix scan. Returning `Ok(false)`
/// stops the scan early.
pub type Visitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<bool> + 'a;

/// An ordered byte-keyed store: one of the storage engine's key spaces.
///
/// Implementations must be `Send` and `Sync`; concurrent scans and writes are
/// allowed and a scan observes some consistent-per-key view of the data.
pub trait KeySpace: Send + Sync {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Visits, in key order, every record whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `MaatError::Storage` if the underlying read fails, or whatever
    /// error `visit` returns.
    fn for_each_with_prefix(&self, prefix: &[u8], visit: &mut Visitor<'_>) -> Result<()>;
}

/// In-memory [`KeySpace`] built on a lock-free skip list.
pub struct MemoryKeySpace {
    data: SkipMap<Vec<u8>, Vec<u8>>,
}

impl Default for MemoryKeySpace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeySpace {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KeySpace for MemoryKeySpace {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn for_each_with_prefix(&self, prefix: &[u8], visit: &mut Visitor<'_>) -> Result<()> {
        let range = self
            .data
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded));
        for entry in range {
            if !entry.key().starts_with(prefix) {
                break;
            }
            if !visit(entry.key(), entry.value())? {
                break;
            }
        }
        Ok(())
    }
}
