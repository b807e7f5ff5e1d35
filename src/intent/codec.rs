use log::trace;

use crate::errors::{MaatError, Result};
use crate::hybrid_time::DocHybridTime;
use crate::intent::doc_path::DocPath;
use crate::intent::types::IntentTypeSet;
use crate::transaction_id::TransactionId;

/// First byte of every intent record key.
pub const INTENT_PREFIX: u8 = b'I';
/// Precedes the intent type byte.
pub const INTENT_TYPE_MARKER: u8 = b'l';
/// Precedes an encoded [`DocHybridTime`], in intent and regular keys alike.
pub const HYBRID_TIME_MARKER: u8 = b'#';
/// Precedes the owning transaction id in an intent value.
pub const TRANSACTION_ID_MARKER: u8 = b'x';
/// Precedes the write id in an intent value.
pub const WRITE_ID_MARKER: u8 = b'w';

/// A decoded view of one intent record key.
///
/// Borrows the doc path from the key it was parsed from; it lives for a
/// single scan pass and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedIntent<'a> {
    /// Encoded doc path of the row or sub-document the intent covers.
    pub doc_path: &'a [u8],
    /// Never empty.
    pub types: IntentTypeSet,
    /// `None` only for lock-table entries that have no write time.
    pub doc_ht: Option<DocHybridTime>,
}

impl<'a> ParsedIntent<'a> {
    /// An intent for an in-memory lock that carries no write time.
    pub fn without_hybrid_time(doc_path: &'a [u8], types: IntentTypeSet) -> Self {
        Self {
            doc_path,
            types,
            doc_ht: None,
        }
    }

    pub fn decoded_doc_path(&self) -> Result<DocPath> {
        DocPath::decode(self.doc_path)
    }

    /// Re-encodes the envelope. `None` if the intent has no hybrid time.
    pub fn encode(&self) -> Option<Vec<u8>> {
        self.doc_ht
            .map(|doc_ht| encode_intent_key(self.doc_path, self.types, doc_ht))
    }
}

/// The decoded value stored under an intent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedIntentValue<'a> {
    pub transaction_id: TransactionId,
    pub write_id: u32,
    pub body: &'a [u8],
}

/// Builds an intent key: `prefix | doc_path | 'l' types | '#' doc_ht`.
pub fn encode_intent_key(doc_path: &[u8], types: IntentTypeSet, doc_ht: DocHybridTime) -> Vec<u8> {
    let mut out = Vec::with_capacity(doc_path.len() + 4 + DocHybridTime::ENCODED_LEN);
    out.push(INTENT_PREFIX);
    out.extend_from_slice(doc_path);
    out.push(INTENT_TYPE_MARKER);
    out.push(types.to_byte());
    out.push(HYBRID_TIME_MARKER);
    doc_ht.append_encoded(&mut out);
    out
}

/// Key prefix under which every intent on `doc_path` or its descendants lives.
pub fn intent_prefix_for(doc_path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(doc_path.len() + 1);
    out.push(INTENT_PREFIX);
    out.extend_from_slice(doc_path);
    out
}

/// Parses an intent key.
///
/// `transaction_id_source` is only used to enrich error messages; it may be
/// longer than a transaction id.
pub fn parse_intent_key<'a>(
    intent_key: &'a [u8],
    transaction_id_source: &[u8],
) -> Result<ParsedIntent<'a>> {
    let err = |message: &str| MaatError::decode(message, intent_key, transaction_id_source);

    if intent_key.first() != Some(&INTENT_PREFIX) {
        return Err(err("missing intent prefix"));
    }
    let body = &intent_key[1..];
    let (_, path_len) = DocPath::decode_prefix(body)?;
    if path_len == 0 {
        return Err(err("empty doc path"));
    }
    let doc_path = &body[..path_len];
    let rest = &body[path_len..];

    let (types, rest) = match rest {
        [INTENT_TYPE_MARKER, byte, rest @ ..] => {
            let types = IntentTypeSet::from_byte(*byte)
                .ok_or_else(|| err(&format!("unknown intent type byte 0x{byte:02x}")))?;
            (types, rest)
        }
        [INTENT_TYPE_MARKER] | [] => return Err(err("truncated before intent type")),
        _ => return Err(err("expected intent type marker")),
    };

    let doc_ht = match rest {
        [HYBRID_TIME_MARKER, encoded @ ..] if encoded.len() == DocHybridTime::ENCODED_LEN => {
            DocHybridTime::decode(encoded)?
        }
        [HYBRID_TIME_MARKER, encoded @ ..] if encoded.len() < DocHybridTime::ENCODED_LEN => {
            return Err(err("truncated doc hybrid time"));
        }
        [HYBRID_TIME_MARKER, ..] => return Err(err("trailing bytes after doc hybrid time")),
        [] => return Err(err("truncated before doc hybrid time")),
        _ => return Err(err("expected hybrid time marker")),
    };

    trace!("Parsed intent key with types {:?} at {}", types, doc_ht);
    Ok(ParsedIntent {
        doc_path,
        types,
        doc_ht: Some(doc_ht),
    })
}

pub fn encode_intent_value(transaction_id: TransactionId, write_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + TransactionId::ENCODED_LEN + 5 + body.len());
    out.push(TRANSACTION_ID_MARKER);
    out.extend_from_slice(transaction_id.as_bytes());
    out.push(WRITE_ID_MARKER);
    out.extend_from_slice(&write_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_intent_value(value: &[u8]) -> Result<DecodedIntentValue<'_>> {
    let err = |message: &str| MaatError::decode(message, value, value);
    let rest = match value {
        [TRANSACTION_ID_MARKER, rest @ ..] => rest,
        _ => return Err(err("intent value must start with a transaction id")),
    };
    let transaction_id = TransactionId::from_slice(rest)?;
    let rest = &rest[TransactionId::ENCODED_LEN..];
    match rest {
        [WRITE_ID_MARKER, a, b, c, d, body @ ..] => Ok(DecodedIntentValue {
            transaction_id,
            write_id: u32::from_be_bytes([*a, *b, *c, *d]),
            body,
        }),
        _ => Err(err("missing write id in intent value")),
    }
}

/// Builds a regular (committed) record key: `doc_path | '#' doc_ht`.
pub fn encode_regular_key(doc_path: &[u8], doc_ht: DocHybridTime) -> Vec<u8> {
    let mut out = Vec::with_capacity(doc_path.len() + 1 + DocHybridTime::ENCODED_LEN);
    out.extend_from_slice(doc_path);
    out.push(HYBRID_TIME_MARKER);
    doc_ht.append_encoded(&mut out);
    out
}

/// Splits a regular record key into its doc path and write time.
pub fn parse_regular_key(key: &[u8]) -> Result<(&[u8], DocHybridTime)> {
    let (_, path_len) = DocPath::decode_prefix(key)?;
    match &key[path_len..] {
        [HYBRID_TIME_MARKER, encoded @ ..] => Ok((&key[..path_len], DocHybridTime::decode(encoded)?)),
        _ => Err(MaatError::decode(
            "regular key must end with a doc hybrid time",
            key,
            &[],
        )),
    }
}

/// Renders an intent key for logs. Never fails: undecodable keys come back
/// as hex.
pub fn debug_intent_key_to_string(intent_key: &[u8]) -> String {
    let parsed = match parse_intent_key(intent_key, &[]) {
        Ok(parsed) => parsed,
        Err(_) => return format!("<undecodable intent key 0x{}>", hex::encode(intent_key)),
    };
    let path = match parsed.decoded_doc_path() {
        Ok(path) => path.to_string(),
        Err(_) => format!("0x{}", hex::encode(parsed.doc_path)),
    };
    match parsed.doc_ht {
        Some(doc_ht) => format!("SubDocKey({path}) {:?} {doc_ht}", parsed.types),
        None => format!("SubDocKey({path}) {:?}", parsed.types),
    }
}
