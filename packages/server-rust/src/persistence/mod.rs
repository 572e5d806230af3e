//! Persistence workers: flush aggregation windows into storage.
//!
//! One flush cycle walks `Idle -> Draining -> Reconciling -> Writing -> Idle`:
//! swap the window and take the frozen records, merge each with its stored
//! value (when reconciliation is enabled), then submit one batch. The frozen
//! generation is released whatever the outcome, and nothing is retried.

pub mod dao;
pub mod memory;
pub mod scheduler;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use apm_core::Record;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, warn};

use crate::error::WorkerError;
use crate::window::Window;

pub use dao::PersistenceDao;
pub use memory::MemoryDao;
pub use scheduler::FlushScheduler;

/// Stored-value lookups in flight at once during reconciliation.
const LOOKUP_CONCURRENCY: usize = 32;

// ---------------------------------------------------------------------------
// State and report
// ---------------------------------------------------------------------------

/// Phase of a persistence worker's flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PersistenceState {
    Idle = 0,
    Draining = 1,
    Reconciling = 2,
    Writing = 3,
}

impl PersistenceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::Reconciling,
            3 => Self::Writing,
            _ => Self::Idle,
        }
    }
}

/// Outcome of one successful flush cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records taken from the frozen generation.
    pub drained: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Records dropped because their stored value could not be read or merged.
    pub skipped: usize,
}

impl FlushReport {
    #[must_use]
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Object-safe handle on a persistence worker, used by the flush scheduler.
#[async_trait]
pub trait Flush: Send + Sync + 'static {
    fn role(&self) -> &str;

    /// Runs one complete flush cycle.
    async fn flush(&self) -> Result<FlushReport, WorkerError>;
}

// ---------------------------------------------------------------------------
// PersistenceWorker
// ---------------------------------------------------------------------------

/// Flushes one window into one DAO.
///
/// The worker is the only caller of the window's swap, so at most one frozen
/// generation exists at a time.
pub struct PersistenceWorker<D: PersistenceDao> {
    role: String,
    window: Arc<Window>,
    dao: Arc<D>,
    need_merge_db_data: bool,
    state: AtomicU8,
}

impl<D: PersistenceDao> PersistenceWorker<D> {
    /// `need_merge_db_data` enables reading stored values before writing.
    /// Without it every drained record is written as an insert.
    #[must_use]
    pub fn new(role: impl Into<String>, window: Arc<Window>, dao: Arc<D>, need_merge_db_data: bool) -> Self {
        Self {
            role: role.into(),
            window,
            dao,
            need_merge_db_data,
            state: AtomicU8::new(PersistenceState::Idle as u8),
        }
    }

    #[must_use]
    pub fn state(&self) -> PersistenceState {
        PersistenceState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn set_state(&self, state: PersistenceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Swaps the window and persists the frozen generation.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Window`] if a previous drain is still
    /// outstanding and [`WorkerError::PersistenceBatch`] if the batch write
    /// fails. The frozen generation is released in both cases.
    pub async fn flush(&self) -> Result<FlushReport, WorkerError> {
        let started = Instant::now();
        self.set_state(PersistenceState::Draining);

        let mut drain = match self.window.swap_and_lock() {
            Ok(drain) => drain,
            Err(err) => {
                self.set_state(PersistenceState::Idle);
                return Err(err.into());
            }
        };
        let records = drain.take_records();
        let result = self.persist(records).await;
        drain.finish_draining();
        self.set_state(PersistenceState::Idle);

        let elapsed = started.elapsed();
        metrics::histogram!("apm_flush_duration_seconds", "role" => self.role.clone())
            .record(elapsed.as_secs_f64());
        match &result {
            Ok(report) => {
                metrics::counter!("apm_flush_total", "role" => self.role.clone(), "outcome" => "ok")
                    .increment(1);
                metrics::counter!("apm_flush_records_total", "role" => self.role.clone())
                    .increment(report.written() as u64);
                if report.drained > 0 {
                    debug!(
                        role = %self.role,
                        drained = report.drained,
                        inserted = report.inserted,
                        updated = report.updated,
                        skipped = report.skipped,
                        elapsed_ms = elapsed.as_millis(),
                        "flush complete"
                    );
                }
            }
            Err(err) => {
                metrics::counter!("apm_flush_total", "role" => self.role.clone(), "outcome" => "error")
                    .increment(1);
                error!(role = %self.role, error = %err, elapsed_ms = elapsed.as_millis(), "flush failed");
            }
        }
        result
    }

    async fn persist(&self, records: Vec<Record>) -> Result<FlushReport, WorkerError> {
        let mut report = FlushReport {
            drained: records.len(),
            ..FlushReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        self.set_state(PersistenceState::Reconciling);
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        if self.need_merge_db_data {
            let lookups: Vec<(Record, anyhow::Result<Option<Record>>)> = stream::iter(records)
                .map(|record| async move {
                    let stored = self.dao.get(record.id(), record.schema()).await;
                    (record, stored)
                })
                .buffered(LOOKUP_CONCURRENCY)
                .collect()
                .await;

            for (record, stored) in lookups {
                match stored {
                    Ok(None) => inserts.push(self.dao.prepare_batch_insert(record)),
                    Ok(Some(mut stored)) => match stored.merge(&record) {
                        Ok(()) => updates.push(self.dao.prepare_batch_update(stored)),
                        Err(err) => {
                            report.skipped += 1;
                            warn!(role = %self.role, id = record.id(), error = %err, "skipping record: stored value does not merge");
                        }
                    },
                    Err(err) => {
                        report.skipped += 1;
                        warn!(role = %self.role, id = record.id(), error = %format!("{err:#}"), "skipping record: stored value lookup failed");
                    }
                }
            }
        } else {
            inserts.extend(records.into_iter().map(|record| self.dao.prepare_batch_insert(record)));
        }

        report.inserted = inserts.len();
        report.updated = updates.len();
        if report.written() == 0 {
            return Ok(report);
        }

        self.set_state(PersistenceState::Writing);
        self.dao
            .execute_batch(inserts, updates)
            .await
            .map_err(|source| WorkerError::PersistenceBatch {
                role: self.role.clone(),
                records: report.written(),
                source,
            })?;
        Ok(report)
    }
}

#[async_trait]
impl<D: PersistenceDao> Flush for PersistenceWorker<D> {
    fn role(&self) -> &str {
        &self.role
    }

    async fn flush(&self) -> Result<FlushReport, WorkerError> {
        PersistenceWorker::flush(self).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
