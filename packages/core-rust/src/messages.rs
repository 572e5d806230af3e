//! Wire format for records crossing node boundaries.
//!
//! A record travels as [`RemoteData`]: its define id plus six ordered arrays,
//! one per column kind, in schema slot order. Position carries meaning, so
//! sender and receiver must share the exact schema; there is no schema
//! evolution. Envelopes are serialized as `MsgPack` with named fields.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::record::Record;
use crate::schema::{ColumnKind, SchemaRegistry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from encoding, decoding, or reinterpreting wire records.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode remote message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode remote message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unknown define id {define_id}")]
    UnknownDefine { define_id: u32 },
    #[error("define {define_id} expects {expected} {kind} slots, got {actual}")]
    ShapeMismatch {
        define_id: u32,
        kind: ColumnKind,
        expected: usize,
        actual: usize,
    },
    #[error("record of define {define_id} has no id")]
    MissingId { define_id: u32 },
}

// ---------------------------------------------------------------------------
// RemoteData
// ---------------------------------------------------------------------------

/// Transport-neutral, positional representation of a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteData {
    pub define_id: u32,
    pub data_strings: Vec<Option<String>>,
    pub data_longs: Vec<Option<i64>>,
    pub data_doubles: Vec<Option<f64>>,
    pub data_integers: Vec<Option<i32>>,
    pub data_booleans: Vec<Option<bool>>,
    pub data_bytes: Vec<Option<ByteBuf>>,
}

impl From<&Record> for RemoteData {
    fn from(record: &Record) -> Self {
        Self {
            define_id: record.define_id(),
            data_strings: record.strings.clone(),
            data_longs: record.longs.clone(),
            data_doubles: record.doubles.clone(),
            data_integers: record.integers.clone(),
            data_booleans: record.booleans.clone(),
            data_bytes: record
                .bytes
                .iter()
                .map(|slot| slot.clone().map(ByteBuf::from))
                .collect(),
        }
    }
}

impl RemoteData {
    fn check_len(&self, kind: ColumnKind, expected: usize, actual: usize) -> Result<(), WireError> {
        if expected == actual {
            Ok(())
        } else {
            Err(WireError::ShapeMismatch {
                define_id: self.define_id,
                kind,
                expected,
                actual,
            })
        }
    }

    /// Rebuilds the record using the schema registered for `define_id`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownDefine`] if no schema is registered for the
    /// define id, [`WireError::ShapeMismatch`] if any slot array length differs
    /// from the schema's capacity, and [`WireError::MissingId`] if the id slot
    /// is unset.
    pub fn into_record(self, schemas: &SchemaRegistry) -> Result<Record, WireError> {
        let schema = schemas
            .get(self.define_id)
            .ok_or(WireError::UnknownDefine {
                define_id: self.define_id,
            })?;

        let lengths = [
            (ColumnKind::String, self.data_strings.len()),
            (ColumnKind::Long, self.data_longs.len()),
            (ColumnKind::Double, self.data_doubles.len()),
            (ColumnKind::Integer, self.data_integers.len()),
            (ColumnKind::Boolean, self.data_booleans.len()),
            (ColumnKind::Bytes, self.data_bytes.len()),
        ];
        for (kind, actual) in lengths {
            self.check_len(kind, schema.capacity(kind), actual)?;
        }
        if self.data_strings.first().map_or(true, Option::is_none) {
            return Err(WireError::MissingId {
                define_id: self.define_id,
            });
        }

        let mut record = Record::empty(std::sync::Arc::clone(schema));
        record.strings = self.data_strings;
        record.longs = self.data_longs;
        record.doubles = self.data_doubles;
        record.integers = self.data_integers;
        record.booleans = self.data_booleans;
        record.bytes = self
            .data_bytes
            .into_iter()
            .map(|slot| slot.map(ByteBuf::into_vec))
            .collect();
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// RemoteMessage
// ---------------------------------------------------------------------------

/// Delivery semantics requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
    /// Fire-and-forget: the receiver acknowledges once the record is queued.
    Tell,
    /// Request/response: the receiver acknowledges once the record is processed.
    Ask,
}

/// Envelope of one record sent to the worker of `role` on a peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub role: String,
    pub mode: DispatchMode,
    pub data: RemoteData,
}

impl RemoteMessage {
    #[must_use]
    pub fn new(role: impl Into<String>, mode: DispatchMode, record: &Record) -> Self {
        Self {
            role: role.into(),
            mode,
            data: RemoteData::from(record),
        }
    }

    /// Serializes the envelope as named-field `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Parses an envelope produced by [`RemoteMessage::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
