//! Structured document paths and their prefix-compatible binary encoding.
//!
//! A doc path is a sequence of [`KeyEntry`] components:
//!
//! ```text
//! [Colocation(id)] Key(k1) .. Key(kn) GroupEnd Subkey(s1) .. Subkey(sm)
//! ```
//!
//! Every component is written as a one-byte tag followed by its payload, so
//! the encoding of a path is a byte prefix of the encoding of each of its
//! descendants. Variable-length payloads escape `0x00` as `0x00 0x01` and end
//! with `0x00 0x00`.

use std::fmt;

use crate::errors::{MaatError, Result};
use crate::intent::types::IntentTypeSet;

pub type ColocationId = u32;

const TAG_COLOCATION: u8 = b'C';
const TAG_KEY: u8 = b'$';
const TAG_GROUP_END: u8 = b'!';
const TAG_SUBKEY: u8 = b's';

/// One component of a [`DocPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyEntry {
    /// Table prefix inside a colocated tablet.
    Colocation(ColocationId),
    /// One hash or range column of the row key.
    Key(Vec<u8>),
    /// Closes the row key.
    GroupEnd,
    /// Column id or nested sub-document key below the row.
    Subkey(Vec<u8>),
}

/// How two doc paths relate to each other structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRelation {
    Equal,
    /// The left path is a proper prefix of the right one.
    Ancestor,
    /// The right path is a proper prefix of the left one.
    Descendant,
    Disjoint,
}

impl PathRelation {
    pub fn overlaps(self) -> bool {
        self != PathRelation::Disjoint
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DocPath {
    entries: Vec<KeyEntry>,
}

impl DocPath {
    /// The whole table identified by `colocation_id`.
    pub fn table(colocation_id: ColocationId) -> Self {
        Self {
            entries: vec![KeyEntry::Colocation(colocation_id)],
        }
    }

    /// A complete row key.
    pub fn row<I, K>(colocation_id: Option<ColocationId>, key: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        let mut path = Self::key_prefix(colocation_id, key);
        path.entries.push(KeyEntry::GroupEnd);
        path
    }

    /// A row key that is not closed, i.e. the range covering every row whose
    /// key starts with the given components.
    pub fn key_prefix<I, K>(colocation_id: Option<ColocationId>, key: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        let mut entries: Vec<KeyEntry> = colocation_id
            .map(KeyEntry::Colocation)
            .into_iter()
            .collect();
        entries.extend(key.into_iter().map(|k| KeyEntry::Key(k.into())));
        Self { entries }
    }

    /// Appends a sub-key below a row. The row key must be complete.
    pub fn with_subkey(mut self, subkey: impl Into<Vec<u8>>) -> Self {
        debug_assert!(self.is_row_or_below());
        self.entries.push(KeyEntry::Subkey(subkey.into()));
        self
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn colocation_id(&self) -> Option<ColocationId> {
        match self.entries.first() {
            Some(KeyEntry::Colocation(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn key_components(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().filter_map(|entry| match entry {
            KeyEntry::Key(k) => Some(k.as_slice()),
            _ => None,
        })
    }

    pub fn subkeys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().filter_map(|entry| match entry {
            KeyEntry::Subkey(s) => Some(s.as_slice()),
            _ => None,
        })
    }

    fn is_row_or_below(&self) -> bool {
        self.entries.contains(&KeyEntry::GroupEnd)
    }

    /// True when the path names exactly one complete row.
    pub fn is_full_row(&self) -> bool {
        matches!(self.entries.last(), Some(KeyEntry::GroupEnd))
    }

    pub fn relation(&self, other: &DocPath) -> PathRelation {
        let (a, b) = (&self.entries, &other.entries);
        if a == b {
            PathRelation::Equal
        } else if a.len() < b.len() && b.starts_with(a) {
            PathRelation::Ancestor
        } else if b.len() < a.len() && a.starts_with(b) {
            PathRelation::Descendant
        } else {
            PathRelation::Disjoint
        }
    }

    /// Proper ancestors that receive weak intents when this path is accessed.
    ///
    /// Partial row-key prefixes are only included when
    /// `partial_range_key_intents` is set.
    pub fn ancestors(&self, partial_range_key_intents: bool) -> Vec<DocPath> {
        let mut out = Vec::new();
        for len in 1..self.entries.len() {
            let include = match &self.entries[len - 1] {
                KeyEntry::Colocation(_) | KeyEntry::GroupEnd | KeyEntry::Subkey(_) => true,
                KeyEntry::Key(_) => {
                    partial_range_key_intents
                        && matches!(self.entries[len], KeyEntry::Key(_))
                }
            };
            if include {
                out.push(DocPath {
                    entries: self.entries[..len].to_vec(),
                });
            }
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.append_encoded(&mut out);
        out
    }

    pub fn append_encoded(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            match entry {
                KeyEntry::Colocation(id) => {
                    out.push(TAG_COLOCATION);
                    out.extend_from_slice(&id.to_be_bytes());
                }
                KeyEntry::Key(bytes) => {
                    out.push(TAG_KEY);
                    append_escaped(bytes, out);
                }
                KeyEntry::GroupEnd => out.push(TAG_GROUP_END),
                KeyEntry::Subkey(bytes) => {
                    out.push(TAG_SUBKEY);
                    append_escaped(bytes, out);
                }
            }
        }
    }

    /// Decodes the longest doc path at the start of `bytes`, returning it with
    /// the number of bytes consumed. Stops at the first byte that is not a
    /// component tag.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(DocPath, usize)> {
        let mut entries = Vec::new();
        let mut pos = 0;
        let mut seen_group_end = false;
        while let Some(&tag) = bytes.get(pos) {
            let entry = match tag {
                TAG_COLOCATION => {
                    if !entries.is_empty() {
                        return Err(MaatError::decode(
                            "colocation id must be the first path component",
                            bytes,
                            &[],
                        ));
                    }
                    let raw: [u8; 4] = bytes
                        .get(pos + 1..pos + 5)
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(|| {
                            MaatError::decode("truncated colocation id", bytes, &[])
                        })?;
                    pos += 5;
                    KeyEntry::Colocation(ColocationId::from_be_bytes(raw))
                }
                TAG_KEY | TAG_SUBKEY => {
                    if (tag == TAG_KEY) == seen_group_end {
                        return Err(MaatError::decode(
                            "key component on the wrong side of the group end",
                            bytes,
                            &[],
                        ));
                    }
                    let (payload, used) = read_escaped(&bytes[pos + 1..]).ok_or_else(|| {
                        MaatError::decode("unterminated path component", bytes, &[])
                    })?;
                    pos += 1 + used;
                    if tag == TAG_KEY {
                        KeyEntry::Key(payload)
                    } else {
                        KeyEntry::Subkey(payload)
                    }
                }
                TAG_GROUP_END => {
                    if seen_group_end {
                        return Err(MaatError::decode("duplicate group end", bytes, &[]));
                    }
                    seen_group_end = true;
                    pos += 1;
                    KeyEntry::GroupEnd
                }
                _ => break,
            };
            entries.push(entry);
        }
        Ok((DocPath { entries }, pos))
    }

    /// Decodes a buffer that must contain exactly one doc path.
    pub fn decode(bytes: &[u8]) -> Result<DocPath> {
        let (path, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(MaatError::decode(
                format!("{} trailing bytes after doc path", bytes.len() - used),
                bytes,
                &[],
            ));
        }
        Ok(path)
    }
}

/// Expands a strong access on `path` into the full list of keys to check or
/// lock: the path itself with `strong_types`, and every ancestor with the
/// weak counterparts.
pub fn expand_key_intents(
    path: &DocPath,
    strong_types: IntentTypeSet,
    partial_range_key_intents: bool,
) -> Vec<(DocPath, IntentTypeSet)> {
    let weak = strong_types.weakened();
    let mut out: Vec<(DocPath, IntentTypeSet)> = path
        .ancestors(partial_range_key_intents)
        .into_iter()
        .map(|ancestor| (ancestor, weak))
        .collect();
    out.push((path.clone(), strong_types));
    out
}

fn append_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0 {
            out.push(1);
        }
    }
    out.extend_from_slice(&[0, 0]);
}

fn read_escaped(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    let mut pos = 0;
    loop {
        match *bytes.get(pos)? {
            0 => match *bytes.get(pos + 1)? {
                0 => return Some((payload, pos + 2)),
                1 => {
                    payload.push(0);
                    pos += 2;
                }
                _ => return None,
            },
            b => {
                payload.push(b);
                pos += 1;
            }
        }
    }
}

fn fmt_component(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s:?}"),
        _ => write!(f, "0x{}", hex::encode(bytes)),
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match entry {
                KeyEntry::Colocation(id) => write!(f, "ColocationId={id}")?,
                KeyEntry::Key(k) => fmt_component(k, f)?,
                KeyEntry::GroupEnd => write!(f, ";")?,
                KeyEntry::Subkey(s) => {
                    write!(f, "SubKey(")?;
                    fmt_component(s, f)?;
                    write!(f, ")")?;
                }
            }
        }
        write!(f, "]")
    }
}

impl fmt::Debug for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocPath{self}")
    }
}
