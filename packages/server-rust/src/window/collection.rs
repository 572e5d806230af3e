//! One generation of a [`Window`](super::Window).

use ahash::AHashMap;
use apm_core::{MergeError, Record};

/// Lifecycle phase of a generation, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Current write target.
    Active,
    /// Swapped out and owned by the persistence worker until drained.
    Frozen,
    /// Neither written nor read; next swap target.
    Idle,
}

/// Records of one generation keyed by record id, plus the `writing` and
/// `reading` flags marking its phase.
///
/// Writing and reading are never both set.
#[derive(Debug, Default)]
pub struct AggregationCollection {
    records: AHashMap<String, Record>,
    writing: bool,
    reading: bool,
}

impl AggregationCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing
    }

    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    #[must_use]
    pub fn state(&self) -> GenerationState {
        match (self.writing, self.reading) {
            (true, _) => GenerationState::Active,
            (false, true) => GenerationState::Frozen,
            (false, false) => GenerationState::Idle,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Inserts `record`, or merges it into the record already held for its id.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::SchemaMismatch`] if a record with the same id but
    /// a different schema is already held; the held record is unchanged.
    pub fn put(&mut self, mut record: Record) -> Result<(), MergeError> {
        if let Some(existing) = self.records.get_mut(record.id()) {
            return existing.merge(&record);
        }
        record.calculate_formulas();
        self.records.insert(record.id().to_string(), record);
        Ok(())
    }

    pub(crate) fn begin_writing(&mut self) {
        self.reading = false;
        self.writing = true;
    }

    pub(crate) fn begin_reading(&mut self) {
        self.writing = false;
        self.reading = true;
    }

    /// Moves every record out, keeping the map's allocation for reuse.
    pub(crate) fn drain(&mut self) -> Vec<Record> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    /// Empties the generation and returns it to idle.
    pub(crate) fn release(&mut self) {
        self.records.clear();
        self.writing = false;
        self.reading = false;
    }
}
