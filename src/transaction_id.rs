use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MaatError, Result};

/// Identifier of a distributed transaction. Always 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub const ENCODED_LEN: usize = 16;

    pub fn generate() -> Self {
        TransactionId(Uuid::new_v4())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(Uuid::from_bytes(bytes))
    }

    /// Decodes the id from the first 16 bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::ENCODED_LEN] = bytes
            .get(..Self::ENCODED_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                MaatError::decode(
                    format!("transaction id needs {} bytes", Self::ENCODED_LEN),
                    bytes,
                    bytes,
                )
            })?;
        Ok(Self::from_bytes(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority used only to break ties between pending conflicting transactions
/// under `FAIL_ON_CONFLICT`.
pub type TransactionPriority = u64;

/// Priority implicitly held by non-transactional (operation) writes.
pub const OPERATION_PRIORITY: TransactionPriority = TransactionPriority::MAX;

/// What the resolver needs to know about the requesting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: TransactionId,
    pub priority: TransactionPriority,
}

impl TransactionMetadata {
    pub fn new(transaction_id: TransactionId, priority: TransactionPriority) -> Self {
        Self {
            transaction_id,
            priority,
        }
    }
}
