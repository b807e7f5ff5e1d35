use std::fmt;

use serde::{Deserialize, Serialize};

const STRONG_FLAG: u8 = 0b10;
const WRITE_FLAG: u8 = 0b01;

/// Kind of access an intent represents on a single doc path.
///
/// Strong intents are taken on the path actually being read or written; weak
/// intents are taken on every ancestor of that path so that a row-level or
/// table-level access notices column-level ones and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum IntentType {
    WeakRead = 0,
    WeakWrite = WRITE_FLAG,
    StrongRead = STRONG_FLAG,
    StrongWrite = STRONG_FLAG | WRITE_FLAG,
}

impl IntentType {
    pub const ALL: [IntentType; 4] = [
        IntentType::WeakRead,
        IntentType::WeakWrite,
        IntentType::StrongRead,
        IntentType::StrongWrite,
    ];

    pub fn is_strong(self) -> bool {
        (self as u8) & STRONG_FLAG != 0
    }

    pub fn is_write(self) -> bool {
        (self as u8) & WRITE_FLAG != 0
    }

    /// The weak counterpart, used for ancestors of a strongly locked path.
    pub fn weakened(self) -> IntentType {
        if self.is_write() {
            IntentType::WeakWrite
        } else {
            IntentType::WeakRead
        }
    }

    /// Two intents conflict iff at least one is strong and exactly one of
    /// them is a write.
    pub fn conflicts_with(self, other: IntentType) -> bool {
        (self.is_strong() || other.is_strong()) && (self.is_write() != other.is_write())
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A set of [`IntentType`]s, stored as a 4-bit mask.
///
/// The mask is also the on-disk intent type byte, so `0` and anything above
/// `0x0f` are not valid encodings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntentTypeSet(u8);

impl IntentTypeSet {
    pub const EMPTY: IntentTypeSet = IntentTypeSet(0);
    const VALID_MASK: u8 = 0x0f;

    pub fn from_byte(byte: u8) -> Option<Self> {
        if byte == 0 || byte & !Self::VALID_MASK != 0 {
            None
        } else {
            Some(IntentTypeSet(byte))
        }
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Intent types taken by a snapshot-isolation write: the strong read half
    /// makes two writers of the same path conflict with each other.
    pub fn strong_write() -> Self {
        [IntentType::StrongRead, IntentType::StrongWrite]
            .into_iter()
            .collect()
    }

    /// Intent types taken by a row lock such as `SELECT ... FOR SHARE`.
    pub fn strong_read() -> Self {
        IntentType::StrongRead.into()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, ty: IntentType) -> bool {
        self.0 & ty.bit() != 0
    }

    pub fn insert(&mut self, ty: IntentType) {
        self.0 |= ty.bit();
    }

    pub fn union(self, other: IntentTypeSet) -> IntentTypeSet {
        IntentTypeSet(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = IntentType> {
        IntentType::ALL.into_iter().filter(move |ty| self.contains(*ty))
    }

    pub fn has_strong(self) -> bool {
        self.iter().any(IntentType::is_strong)
    }

    pub fn has_write(self) -> bool {
        self.iter().any(IntentType::is_write)
    }

    /// Replaces every strong type by its weak counterpart.
    pub fn weakened(self) -> IntentTypeSet {
        self.iter().map(IntentType::weakened).collect()
    }

    pub fn conflicts_with(self, other: IntentTypeSet) -> bool {
        self.iter()
            .any(|lhs| other.iter().any(|rhs| lhs.conflicts_with(rhs)))
    }
}

impl From<IntentType> for IntentTypeSet {
    fn from(ty: IntentType) -> Self {
        IntentTypeSet(ty.bit())
    }
}

impl FromIterator<IntentType> for IntentTypeSet {
    fn from_iter<I: IntoIterator<Item = IntentType>>(iter: I) -> Self {
        let mut set = IntentTypeSet::EMPTY;
        for ty in iter {
            set.insert(ty);
        }
        set
    }
}

impl fmt::Debug for IntentTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
