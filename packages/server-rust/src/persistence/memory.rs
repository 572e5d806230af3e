//! In-memory [`PersistenceDao`] backed by a `DashMap`.
//!
//! Behaves like a table with a primary key on `(define id, record id)`: an
//! insert of an existing key or an update of a missing key rejects the whole
//! batch, and a batch is validated before any of it is applied. Batches are
//! applied one at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apm_core::{Record, Schema};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::dao::PersistenceDao;

type RowKey = (u32, String);

fn row_key(record: &Record) -> RowKey {
    (record.define_id(), record.id().to_string())
}

/// Shared in-memory store, usable by every role of every node in a process.
#[derive(Debug, Default)]
pub struct MemoryDao {
    rows: DashMap<RowKey, Record>,
    batches: AtomicU64,
    /// Held from validation to the last write of a batch.
    batch_lock: Mutex<()>,
}

impl MemoryDao {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for `id` of `define_id`.
    #[must_use]
    pub fn stored(&self, define_id: u32, id: &str) -> Option<Record> {
        self.rows
            .get(&(define_id, id.to_string()))
            .map(|row| row.value().clone())
    }

    /// All stored records of one define.
    #[must_use]
    pub fn rows_of(&self, define_id: u32) -> Vec<Record> {
        self.rows
            .iter()
            .filter(|row| row.key().0 == define_id)
            .map(|row| row.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of successfully applied batches.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PersistenceDao for MemoryDao {
    type InsertOp = Record;
    type UpdateOp = Record;

    async fn get(&self, id: &str, schema: &Arc<Schema>) -> anyhow::Result<Option<Record>> {
        Ok(self.stored(schema.define_id(), id))
    }

    fn prepare_batch_insert(&self, record: Record) -> Record {
        record
    }

    fn prepare_batch_update(&self, record: Record) -> Record {
        record
    }

    async fn execute_batch(&self, inserts: Vec<Record>, updates: Vec<Record>) -> anyhow::Result<()> {
        let _batch = self.batch_lock.lock();
        for record in &inserts {
            let key = row_key(record);
            if self.rows.contains_key(&key) {
                anyhow::bail!("duplicate key {}:{}", key.0, key.1);
            }
        }
        for record in &updates {
            let key = row_key(record);
            if !self.rows.contains_key(&key) {
                anyhow::bail!("no row to update for {}:{}", key.0, key.1);
            }
        }
        for record in inserts.into_iter().chain(updates) {
            self.rows.insert(row_key(&record), record);
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
