//! Generic typed record and its merge semantics.
//!
//! A [`Record`] is a row of typed slot arrays whose layout is fixed by its
//! [`Schema`]. Every slot may be unset. Two records with the same id are
//! combined with [`Record::merge`], which applies each column's
//! [`MergeOperation`] and then recomputes formula columns.

use std::sync::Arc;

use crate::schema::{Column, ColumnKind, MergeOperation, ResolvedFormula, Schema};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Dynamically typed slot value used for name-based access.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Integer(i32),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ColumnKind {
        match self {
            Self::String(_) => ColumnKind::String,
            Self::Long(_) => ColumnKind::Long,
            Self::Double(_) => ColumnKind::Double,
            Self::Integer(_) => ColumnKind::Integer,
            Self::Boolean(_) => ColumnKind::Boolean,
            Self::Bytes(_) => ColumnKind::Bytes,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from name-based record access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("schema {schema} has no column {column}")]
    UnknownColumn { schema: String, column: String },
    #[error("column {column} holds {expected} values, got {actual}")]
    TypeMismatch {
        column: String,
        expected: ColumnKind,
        actual: ColumnKind,
    },
}

/// Errors from merging two records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge record of define {incoming} into record of define {existing}")]
    SchemaMismatch { existing: u32, incoming: u32 },
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A row of typed slots laid out by a shared [`Schema`].
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    pub(crate) strings: Vec<Option<String>>,
    pub(crate) longs: Vec<Option<i64>>,
    pub(crate) doubles: Vec<Option<f64>>,
    pub(crate) integers: Vec<Option<i32>>,
    pub(crate) booleans: Vec<Option<bool>>,
    pub(crate) bytes: Vec<Option<Vec<u8>>>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.define_id() == other.schema.define_id()
            && self.strings == other.strings
            && self.longs == other.longs
            && self.doubles == other.doubles
            && self.integers == other.integers
            && self.booleans == other.booleans
            && self.bytes == other.bytes
    }
}

macro_rules! copy_slot_accessors {
    ($field:ident, $ty:ty, $get:ident, $get_opt:ident, $set:ident) => {
        /// Slot value, or the type's zero value when unset.
        ///
        /// # Panics
        ///
        /// Panics if `pos` is outside the schema's capacity for this kind.
        #[must_use]
        pub fn $get(&self, pos: usize) -> $ty {
            self.$field[pos].unwrap_or_default()
        }

        /// Slot value, `None` when unset.
        ///
        /// # Panics
        ///
        /// Panics if `pos` is outside the schema's capacity for this kind.
        #[must_use]
        pub fn $get_opt(&self, pos: usize) -> Option<$ty> {
            self.$field[pos]
        }

        /// # Panics
        ///
        /// Panics if `pos` is outside the schema's capacity for this kind.
        pub fn $set(&mut self, pos: usize, value: $ty) {
            self.$field[pos] = Some(value);
        }
    };
}

impl Record {
    /// Creates a record with every slot unset except the id.
    #[must_use]
    pub fn new(schema: Arc<Schema>, id: impl Into<String>) -> Self {
        let mut record = Self::empty(schema);
        record.strings[0] = Some(id.into());
        record
    }

    /// Creates a record with every slot unset, the id included.
    #[must_use]
    pub(crate) fn empty(schema: Arc<Schema>) -> Self {
        Self {
            strings: vec![None; schema.capacity(ColumnKind::String)],
            longs: vec![None; schema.capacity(ColumnKind::Long)],
            doubles: vec![None; schema.capacity(ColumnKind::Double)],
            integers: vec![None; schema.capacity(ColumnKind::Integer)],
            booleans: vec![None; schema.capacity(ColumnKind::Boolean)],
            bytes: vec![None; schema.capacity(ColumnKind::Bytes)],
            schema,
        }
    }

    /// Aggregation key of this record.
    #[must_use]
    pub fn id(&self) -> &str {
        self.strings.first().and_then(Option::as_deref).unwrap_or_default()
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn define_id(&self) -> u32 {
        self.schema.define_id()
    }

    /// # Panics
    ///
    /// Panics if `pos` is outside the schema's string capacity.
    #[must_use]
    pub fn string(&self, pos: usize) -> Option<&str> {
        self.strings[pos].as_deref()
    }

    /// # Panics
    ///
    /// Panics if `pos` is outside the schema's string capacity.
    pub fn set_string(&mut self, pos: usize, value: impl Into<String>) {
        self.strings[pos] = Some(value.into());
    }

    /// # Panics
    ///
    /// Panics if `pos` is outside the schema's bytes capacity.
    #[must_use]
    pub fn bytes(&self, pos: usize) -> Option<&[u8]> {
        self.bytes[pos].as_deref()
    }

    /// # Panics
    ///
    /// Panics if `pos` is outside the schema's bytes capacity.
    pub fn set_bytes(&mut self, pos: usize, value: Vec<u8>) {
        self.bytes[pos] = Some(value);
    }

    copy_slot_accessors!(longs, i64, long, long_opt, set_long);
    copy_slot_accessors!(doubles, f64, double, double_opt, set_double);
    copy_slot_accessors!(integers, i32, integer, integer_opt, set_integer);
    copy_slot_accessors!(booleans, bool, boolean, boolean_opt, set_boolean);

    // -----------------------------------------------------------------------
    // Name-based access
    // -----------------------------------------------------------------------

    fn resolve(&self, column: &str) -> Result<(ColumnKind, usize), RecordError> {
        self.schema
            .position(column)
            .ok_or_else(|| RecordError::UnknownColumn {
                schema: self.schema.name().to_string(),
                column: column.to_string(),
            })
    }

    /// Sets a column by name.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::UnknownColumn`] if the schema has no such column
    /// and [`RecordError::TypeMismatch`] if the value kind differs from the
    /// column kind.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<(), RecordError> {
        let value = value.into();
        let (kind, pos) = self.resolve(column)?;
        match value {
            Value::String(v) if kind == ColumnKind::String => self.strings[pos] = Some(v),
            Value::Long(v) if kind == ColumnKind::Long => self.longs[pos] = Some(v),
            Value::Double(v) if kind == ColumnKind::Double => self.doubles[pos] = Some(v),
            Value::Integer(v) if kind == ColumnKind::Integer => self.integers[pos] = Some(v),
            Value::Boolean(v) if kind == ColumnKind::Boolean => self.booleans[pos] = Some(v),
            Value::Bytes(v) if kind == ColumnKind::Bytes => self.bytes[pos] = Some(v),
            other => {
                return Err(RecordError::TypeMismatch {
                    column: column.to_string(),
                    expected: kind,
                    actual: other.kind(),
                })
            }
        }
        Ok(())
    }

    /// Chaining form of [`Record::set`].
    ///
    /// # Errors
    ///
    /// Same as [`Record::set`].
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Result<Self, RecordError> {
        self.set(column, value)?;
        Ok(self)
    }

    /// Reads a column by name; `Ok(None)` when the slot is unset.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::UnknownColumn`] if the schema has no such column.
    pub fn get(&self, column: &str) -> Result<Option<Value>, RecordError> {
        let (kind, pos) = self.resolve(column)?;
        Ok(match kind {
            ColumnKind::String => self.strings[pos].clone().map(Value::String),
            ColumnKind::Long => self.longs[pos].map(Value::Long),
            ColumnKind::Double => self.doubles[pos].map(Value::Double),
            ColumnKind::Integer => self.integers[pos].map(Value::Integer),
            ColumnKind::Boolean => self.booleans[pos].map(Value::Boolean),
            ColumnKind::Bytes => self.bytes[pos].clone().map(Value::Bytes),
        })
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Folds `incoming` into `self` column by column, then recomputes
    /// formula columns.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::SchemaMismatch`] if the records belong to
    /// different schemas. `self` is left untouched in that case.
    pub fn merge(&mut self, incoming: &Record) -> Result<(), MergeError> {
        if self.define_id() != incoming.define_id() {
            return Err(MergeError::SchemaMismatch {
                existing: self.define_id(),
                incoming: incoming.define_id(),
            });
        }
        let schema = Arc::clone(&self.schema);

        merge_slots(&mut self.strings, &incoming.strings, schema.columns(ColumnKind::String), None);
        merge_slots(
            &mut self.longs,
            &incoming.longs,
            schema.columns(ColumnKind::Long),
            Some(i64::saturating_add),
        );
        merge_slots(
            &mut self.doubles,
            &incoming.doubles,
            schema.columns(ColumnKind::Double),
            Some(|a: f64, b: f64| a + b),
        );
        merge_slots(
            &mut self.integers,
            &incoming.integers,
            schema.columns(ColumnKind::Integer),
            Some(i32::saturating_add),
        );
        merge_slots(&mut self.booleans, &incoming.booleans, schema.columns(ColumnKind::Boolean), None);
        merge_slots(&mut self.bytes, &incoming.bytes, schema.columns(ColumnKind::Bytes), None);

        self.calculate_formulas();
        Ok(())
    }

    /// Recomputes every formula column from its inputs.
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_formulas(&mut self) {
        let schema = Arc::clone(&self.schema);
        for slot in schema.formulas() {
            let ResolvedFormula::Average { sum, count } = slot.formula;
            let sum = self.long(sum);
            let count = self.long(count);
            match slot.kind {
                ColumnKind::Long => {
                    // checked_div covers a zero count and i64::MIN / -1.
                    self.longs[slot.position] = Some(sum.checked_div(count).unwrap_or(0));
                }
                ColumnKind::Double => {
                    self.doubles[slot.position] =
                        Some(if count == 0 { 0.0 } else { sum as f64 / count as f64 });
                }
                _ => {}
            }
        }
    }
}

/// Applies each column's merge operation slot by slot.
///
/// `add` is `None` for non-numeric kinds; schema validation guarantees those
/// never carry [`MergeOperation::Accumulate`].
fn merge_slots<T: Clone>(
    existing: &mut [Option<T>],
    incoming: &[Option<T>],
    columns: &[Column],
    add: Option<fn(T, T) -> T>,
) {
    for ((slot, new), column) in existing.iter_mut().zip(incoming).zip(columns) {
        match column.operation {
            MergeOperation::NonOperation => {
                if slot.is_none() {
                    slot.clone_from(new);
                }
            }
            MergeOperation::Cover => {
                if new.is_some() {
                    slot.clone_from(new);
                }
            }
            MergeOperation::Accumulate => {
                *slot = match (slot.take(), new.clone()) {
                    (Some(a), Some(b)) => Some(match add {
                        Some(add) => add(a, b),
                        None => b,
                    }),
                    (a, b) => a.or(b),
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
