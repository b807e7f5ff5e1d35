use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{MaatError, Result};

/// Number of bits of a [`HybridTime`] reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 12;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A logical clock value combining wall-clock microseconds and a counter.
///
/// The physical component occupies the high 52 bits, the logical counter the
/// low [`LOGICAL_BITS`]. Ordering is the ordering of the packed `u64`, so a
/// hybrid time with a larger physical part is always later regardless of its
/// logical part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX);

    pub const fn from_raw(raw: u64) -> Self {
        HybridTime(raw)
    }

    pub fn from_micros(physical_micros: u64, logical: u64) -> Self {
        HybridTime((physical_micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// The smallest hybrid time strictly greater than `self`.
    pub fn incremented(self) -> Self {
        HybridTime(self.0.saturating_add(1))
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HybridTime::MAX => write!(f, "<max>"),
            ht if ht.logical() == 0 => write!(f, "{{ physical: {} }}", ht.physical_micros()),
            ht => write!(
                f,
                "{{ physical: {} logical: {} }}",
                ht.physical_micros(),
                ht.logical()
            ),
        }
    }
}

/// The write time stamped on a record: hybrid time plus the index of the
/// write within the batch that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocHybridTime {
    pub hybrid_time: HybridTime,
    pub write_id: u32,
}

impl DocHybridTime {
    /// Size of the fixed-width binary form.
    pub const ENCODED_LEN: usize = 12;

    pub fn new(hybrid_time: HybridTime, write_id: u32) -> Self {
        Self {
            hybrid_time,
            write_id,
        }
    }

    pub fn append_encoded(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hybrid_time.raw().to_be_bytes());
        out.extend_from_slice(&self.write_id.to_be_bytes());
    }

    pub fn encoded(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.hybrid_time.raw().to_be_bytes());
        out[8..].copy_from_slice(&self.write_id.to_be_bytes());
        out
    }

    /// Decodes exactly [`Self::ENCODED_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(MaatError::decode(
                format!(
                    "doc hybrid time must be {} bytes, got {}",
                    Self::ENCODED_LEN,
                    bytes.len()
                ),
                bytes,
                &[],
            ));
        }
        let mut ht = [0u8; 8];
        ht.copy_from_slice(&bytes[..8]);
        let mut write_id = [0u8; 4];
        write_id.copy_from_slice(&bytes[8..]);
        Ok(Self {
            hybrid_time: HybridTime::from_raw(u64::from_be_bytes(ht)),
            write_id: u32::from_be_bytes(write_id),
        })
    }
}

impl fmt::Display for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.write_id == 0 {
            write!(f, "HT{}", self.hybrid_time)
        } else {
            write!(f, "HT{} w: {}", self.hybrid_time, self.write_id)
        }
    }
}
