//! Double-buffered aggregation window.
//!
//! A [`Window`] holds two generations of [`AggregationCollection`]. Exactly one
//! is the active write target. [`Window::swap_and_lock`] freezes it, points
//! writers at the other one, and hands the frozen generation to the caller as
//! a [`Drain`]. Dropping or finishing the drain returns the generation to idle,
//! so the next swap can reuse it.
//!
//! Writers resolve the active index, lock that generation, and check its
//! `writing` flag. A writer that raced a swap finds the flag cleared and
//! retries on the new active generation, so no write is lost.

pub mod collection;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use apm_core::{MergeError, Record};
use parking_lot::Mutex;

pub use collection::{AggregationCollection, GenerationState};

/// Errors from window generation management.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("previous generation is still draining")]
    DrainInProgress,
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Two fixed generations with an active-generation index.
#[derive(Debug)]
pub struct Window {
    generations: [Mutex<AggregationCollection>; 2],
    active: AtomicUsize,
    draining: AtomicBool,
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    #[must_use]
    pub fn new() -> Self {
        let mut first = AggregationCollection::new();
        first.begin_writing();
        Self {
            generations: [Mutex::new(first), Mutex::new(AggregationCollection::new())],
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Inserts or merges `record` into the active generation.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::SchemaMismatch`] if a record with the same id but
    /// a different schema is already held.
    pub fn write(&self, record: Record) -> Result<(), MergeError> {
        loop {
            let index = self.active.load(Ordering::Acquire);
            let mut generation = self.generations[index].lock();
            if generation.is_writing() {
                return generation.put(record);
            }
            // Swapped between the index load and the lock; retry.
        }
    }

    /// Number of distinct ids in the active generation.
    #[must_use]
    pub fn active_len(&self) -> usize {
        let index = self.active.load(Ordering::Acquire);
        self.generations[index].lock().len()
    }

    /// Copy of the record currently aggregated for `id` in the active
    /// generation.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<Record> {
        let index = self.active.load(Ordering::Acquire);
        self.generations[index].lock().get(id).cloned()
    }

    #[must_use]
    pub fn generation_states(&self) -> [GenerationState; 2] {
        [
            self.generations[0].lock().state(),
            self.generations[1].lock().state(),
        ]
    }

    /// Freezes the active generation and redirects writers to the other one.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::DrainInProgress`] if the generation frozen by the
    /// previous swap has not been released yet.
    pub(crate) fn swap_and_lock(&self) -> Result<Drain<'_>, WindowError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WindowError::DrainInProgress);
        }

        let current = self.active.load(Ordering::Acquire);
        let next = 1 - current;

        self.generations[next].lock().begin_writing();
        self.active.store(next, Ordering::Release);
        // Writers holding the old index either finished under this lock or
        // will observe the cleared writing flag and retry.
        self.generations[current].lock().begin_reading();

        Ok(Drain {
            window: self,
            generation: current,
            released: false,
        })
    }

    fn finish_draining(&self, generation: usize) {
        self.generations[generation].lock().release();
        self.draining.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// Exclusive handle on a frozen generation.
///
/// The generation is released exactly once: by [`Drain::finish_draining`] or,
/// failing that, on drop.
#[derive(Debug)]
pub struct Drain<'a> {
    window: &'a Window,
    generation: usize,
    released: bool,
}

impl Drain<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.generations[self.generation].lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the frozen records out. Later calls return nothing.
    pub fn take_records(&mut self) -> Vec<Record> {
        self.window.generations[self.generation].lock().drain()
    }

    /// Releases the frozen generation back to idle.
    pub fn finish_draining(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.window.finish_draining(self.generation);
        }
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apm_core::{ColumnKind, MergeOperation, Schema, SchemaBuilder};

    use super::*;

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new(1, "service_metric")
            .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
            .column("error_calls", ColumnKind::Long, MergeOperation::Accumulate)
            .column("avg_latency", ColumnKind::Long, MergeOperation::Cover)
            .build()
            .unwrap()
    }

    fn calls(schema: &Arc<Schema>, id: &str, calls: i64) -> Record {
        schema.build(id).with("calls", calls).unwrap()
    }

    #[test]
    fn new_window_has_one_active_generation() {
        let window = Window::new();
        assert_eq!(
            window.generation_states(),
            [GenerationState::Active, GenerationState::Idle]
        );
    }

    #[test]
    fn writes_merge_into_the_active_generation() {
        let schema = schema();
        let window = Window::new();
        window.write(calls(&schema, "a", 1)).unwrap();
        window.write(calls(&schema, "a", 2)).unwrap();
        assert_eq!(window.active_len(), 1);
        assert_eq!(window.snapshot("a").unwrap().long(0), 3);
    }

    #[test]
    fn swap_freezes_and_redirects_writes() {
        let schema = schema();
        let window = Window::new();
        window.write(calls(&schema, "a", 1)).unwrap();

        let mut drain = window.swap_and_lock().unwrap();
        assert_eq!(
            window.generation_states(),
            [GenerationState::Frozen, GenerationState::Active]
        );

        window.write(calls(&schema, "a", 10)).unwrap();
        let frozen = drain.take_records();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].long(0), 1);
        assert_eq!(window.snapshot("a").unwrap().long(0), 10);

        drain.finish_draining();
        assert_eq!(
            window.generation_states(),
            [GenerationState::Idle, GenerationState::Active]
        );
    }

    #[test]
    fn second_swap_requires_release() {
        let window = Window::new();
        let drain = window.swap_and_lock().unwrap();
        assert_eq!(window.swap_and_lock().unwrap_err(), WindowError::DrainInProgress);
        drop(drain);
        assert!(window.swap_and_lock().is_ok());
    }

    #[test]
    fn dropping_a_drain_releases_the_generation() {
        let schema = schema();
        let window = Window::new();
        window.write(calls(&schema, "a", 1)).unwrap();
        {
            let drain = window.swap_and_lock().unwrap();
            assert_eq!(drain.len(), 1);
        }
        assert_eq!(
            window.generation_states(),
            [GenerationState::Idle, GenerationState::Active]
        );
        // The untaken record was discarded with the generation.
        let drain = window.swap_and_lock().unwrap();
        assert!(drain.is_empty());
    }

    #[test]
    fn generations_alternate() {
        let schema = schema();
        let window = Window::new();
        for round in 0..4_i64 {
            window.write(calls(&schema, "a", round)).unwrap();
            let mut drain = window.swap_and_lock().unwrap();
            let records = drain.take_records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].long(0), round);
            drain.finish_draining();
        }
    }

    #[test]
    fn concurrent_scenario_last_cover_wins() {
        let schema = schema();
        let window = Window::new();
        for (errors, latency) in [(0_i64, 50_i64), (1, 80), (0, 65)] {
            let record = schema
                .build("svc-1_2024010100")
                .with("calls", 1_i64)
                .unwrap()
                .with("error_calls", errors)
                .unwrap()
                .with("avg_latency", latency)
                .unwrap();
            window.write(record).unwrap();
        }
        let merged = window.snapshot("svc-1_2024010100").unwrap();
        assert_eq!(merged.long(0), 3);
        assert_eq!(merged.long(1), 1);
        assert_eq!(merged.long(2), 65);
    }

    #[test]
    fn no_write_is_lost_across_swaps() {
        const WRITERS: i64 = 4;
        const WRITES: i64 = 2_000;

        let schema = schema();
        let window = Window::new();
        let mut drained_total = 0_i64;

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let window = &window;
                let schema = &schema;
                scope.spawn(move || {
                    for i in 0..WRITES {
                        let id = format!("k{}", (w + i) % 7);
                        window.write(calls(schema, &id, 1)).unwrap();
                    }
                });
            }

            for _ in 0..50 {
                let mut drain = window.swap_and_lock().unwrap();
                drained_total += drain.take_records().iter().map(|r| r.long(0)).sum::<i64>();
                drain.finish_draining();
                std::thread::yield_now();
            }
        });

        let mut drain = window.swap_and_lock().unwrap();
        drained_total += drain.take_records().iter().map(|r| r.long(0)).sum::<i64>();
        drain.finish_draining();

        assert_eq!(drained_total, WRITERS * WRITES);
    }
}
