//! Record schemas ("data defines").
//!
//! A schema declares, per column kind, the ordered list of columns a record
//! carries and the merge operation applied to each of them. Schemas are built
//! once through [`SchemaBuilder`], validated eagerly, and shared immutably as
//! `Arc<Schema>` by every record of that type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Name of the identity column that every schema carries in string slot 0.
pub const ID_COLUMN: &str = "id";

// ---------------------------------------------------------------------------
// Column kinds and merge operations
// ---------------------------------------------------------------------------

/// Storage kind of a column. Each kind maps to its own ordered slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    String,
    Long,
    Double,
    Integer,
    Boolean,
    Bytes,
}

impl ColumnKind {
    /// All kinds in wire order.
    pub const ALL: [ColumnKind; 6] = [
        ColumnKind::String,
        ColumnKind::Long,
        ColumnKind::Double,
        ColumnKind::Integer,
        ColumnKind::Boolean,
        ColumnKind::Bytes,
    ];

    /// Whether values of this kind can be accumulated.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Long | Self::Double | Self::Integer)
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Long => "long",
            Self::Double => "double",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// How an incoming slot value combines with the value already held for the
/// same record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOperation {
    /// Keep the existing value; take the incoming one only if nothing is held.
    NonOperation,
    /// Last writer wins.
    Cover,
    /// Sum of existing and incoming. Numeric columns only.
    Accumulate,
}

/// Derived value recomputed after every merge.
///
/// Inputs are referenced by long-column name and resolved to slot positions
/// when the schema is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Formula {
    /// `sum / count`, or 0 when `count` is unset or zero.
    Average { sum: String, count: String },
}

impl Formula {
    /// Convenience constructor for [`Formula::Average`].
    #[must_use]
    pub fn average(sum: impl Into<String>, count: impl Into<String>) -> Self {
        Self::Average {
            sum: sum.into(),
            count: count.into(),
        }
    }
}

/// A formula whose inputs have been resolved to long slot positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedFormula {
    Average { sum: usize, count: usize },
}

/// Target slot of a resolved formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FormulaSlot {
    pub kind: ColumnKind,
    pub position: usize,
    pub formula: ResolvedFormula,
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub operation: MergeOperation,
    pub formula: Option<Formula>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while declaring or registering schemas.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("column {column} of {schema}: accumulate requires a numeric column, got {kind}")]
    NonNumericAccumulate {
        schema: String,
        column: String,
        kind: ColumnKind,
    },
    #[error("column {column} declared twice in {schema}")]
    DuplicateColumn { schema: String, column: String },
    #[error("formula column {column} of {schema} must be long or double, got {kind}")]
    NonNumericFormula {
        schema: String,
        column: String,
        kind: ColumnKind,
    },
    #[error("formula column {column} of {schema} references unknown long column {input}")]
    UnknownFormulaInput {
        schema: String,
        column: String,
        input: String,
    },
    #[error("define id {define_id} is already registered")]
    DuplicateDefine { define_id: u32 },
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Immutable column layout of one record type.
#[derive(Debug)]
pub struct Schema {
    define_id: u32,
    name: String,
    columns: [Vec<Column>; 6],
    index: HashMap<String, (ColumnKind, usize)>,
    formulas: Vec<FormulaSlot>,
}

fn kind_index(kind: ColumnKind) -> usize {
    match kind {
        ColumnKind::String => 0,
        ColumnKind::Long => 1,
        ColumnKind::Double => 2,
        ColumnKind::Integer => 3,
        ColumnKind::Boolean => 4,
        ColumnKind::Bytes => 5,
    }
}

impl Schema {
    /// Numeric identifier carried on the wire.
    #[must_use]
    pub fn define_id(&self) -> u32 {
        self.define_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns of one kind, in slot order.
    #[must_use]
    pub fn columns(&self, kind: ColumnKind) -> &[Column] {
        &self.columns[kind_index(kind)]
    }

    /// Number of slots of one kind.
    #[must_use]
    pub fn capacity(&self, kind: ColumnKind) -> usize {
        self.columns(kind).len()
    }

    /// Resolves a column name to its kind and slot position.
    #[must_use]
    pub fn position(&self, column: &str) -> Option<(ColumnKind, usize)> {
        self.index.get(column).copied()
    }

    pub(crate) fn formulas(&self) -> &[FormulaSlot] {
        &self.formulas
    }

    /// Creates an empty record of this schema with the given id.
    #[must_use]
    pub fn build(self: &Arc<Self>, id: impl Into<String>) -> Record {
        Record::new(Arc::clone(self), id)
    }
}

// ---------------------------------------------------------------------------
// SchemaBuilder
// ---------------------------------------------------------------------------

/// Declares a schema column by column.
///
/// The `id` column is added automatically as string slot 0 with
/// [`MergeOperation::NonOperation`].
#[derive(Debug)]
pub struct SchemaBuilder {
    define_id: u32,
    name: String,
    columns: Vec<Column>,
}

impl SchemaBuilder {
    #[must_use]
    pub fn new(define_id: u32, name: impl Into<String>) -> Self {
        Self {
            define_id,
            name: name.into(),
            columns: vec![Column {
                name: ID_COLUMN.to_string(),
                kind: ColumnKind::String,
                operation: MergeOperation::NonOperation,
                formula: None,
            }],
        }
    }

    /// Appends a plain column.
    #[must_use]
    pub fn column(
        mut self,
        name: impl Into<String>,
        kind: ColumnKind,
        operation: MergeOperation,
    ) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            operation,
            formula: None,
        });
        self
    }

    /// Appends a derived column recomputed after every merge.
    #[must_use]
    pub fn formula(mut self, name: impl Into<String>, kind: ColumnKind, formula: Formula) -> Self {
        self.columns.push(Column {
            name: name.into(),
            kind,
            operation: MergeOperation::Cover,
            formula: Some(formula),
        });
        self
    }

    /// Validates the declaration and freezes it.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] when a column is declared twice, when
    /// `Accumulate` is declared on a non-numeric column, or when a formula is
    /// declared on a non-numeric column or references an unknown long column.
    pub fn build(self) -> Result<Arc<Schema>, SchemaError> {
        let mut columns: [Vec<Column>; 6] = Default::default();
        let mut index = HashMap::with_capacity(self.columns.len());

        for column in self.columns {
            if index.contains_key(&column.name) {
                return Err(SchemaError::DuplicateColumn {
                    schema: self.name,
                    column: column.name,
                });
            }
            if column.operation == MergeOperation::Accumulate && !column.kind.is_numeric() {
                return Err(SchemaError::NonNumericAccumulate {
                    schema: self.name,
                    column: column.name,
                    kind: column.kind,
                });
            }
            if column.formula.is_some()
                && !matches!(column.kind, ColumnKind::Long | ColumnKind::Double)
            {
                return Err(SchemaError::NonNumericFormula {
                    schema: self.name,
                    column: column.name,
                    kind: column.kind,
                });
            }
            let slots = &mut columns[kind_index(column.kind)];
            index.insert(column.name.clone(), (column.kind, slots.len()));
            slots.push(column);
        }

        let mut formulas = Vec::new();
        for kind in [ColumnKind::Long, ColumnKind::Double] {
            for (position, column) in columns[kind_index(kind)].iter().enumerate() {
                let Some(Formula::Average { sum, count }) = &column.formula else {
                    continue;
                };
                let resolve = |input: &String| match index.get(input) {
                    Some((ColumnKind::Long, pos)) => Ok(*pos),
                    _ => Err(SchemaError::UnknownFormulaInput {
                        schema: self.name.clone(),
                        column: column.name.clone(),
                        input: input.clone(),
                    }),
                };
                formulas.push(FormulaSlot {
                    kind,
                    position,
                    formula: ResolvedFormula::Average {
                        sum: resolve(sum)?,
                        count: resolve(count)?,
                    },
                });
            }
        }

        Ok(Arc::new(Schema {
            define_id: self.define_id,
            name: self.name,
            columns,
            index,
            formulas,
        }))
    }
}

// ---------------------------------------------------------------------------
// SchemaRegistry
// ---------------------------------------------------------------------------

/// Lookup of schemas by define id, populated at startup.
///
/// Used to reinterpret positional wire records, which carry only the define id.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    by_id: HashMap<u32, Arc<Schema>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DuplicateDefine`] if the define id is taken.
    pub fn register(&mut self, schema: Arc<Schema>) -> Result<(), SchemaError> {
        let define_id = schema.define_id();
        if self.by_id.contains_key(&define_id) {
            return Err(SchemaError::DuplicateDefine { define_id });
        }
        tracing::debug!(define_id, name = schema.name(), "registered schema");
        self.by_id.insert(define_id, schema);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, define_id: u32) -> Option<&Arc<Schema>> {
        self.by_id.get(&define_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
