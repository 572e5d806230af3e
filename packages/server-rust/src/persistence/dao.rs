//! Storage contract used by persistence workers.

use std::sync::Arc;

use apm_core::{Record, Schema};
use async_trait::async_trait;

/// Backend-specific storage access for one record type.
///
/// A flush cycle reads stored values with [`get`](PersistenceDao::get),
/// turns every record into an insert or update operation, and submits all of
/// them in a single [`execute_batch`](PersistenceDao::execute_batch) call.
/// The operation types are whatever the backend batches natively (SQL
/// statements, bulk-index actions, ...).
#[async_trait]
pub trait PersistenceDao: Send + Sync + 'static {
    type InsertOp: Send + 'static;
    type UpdateOp: Send + 'static;

    /// Loads the stored record for `id`, or `None` if absent.
    async fn get(&self, id: &str, schema: &Arc<Schema>) -> anyhow::Result<Option<Record>>;

    fn prepare_batch_insert(&self, record: Record) -> Self::InsertOp;

    /// Prepares an update addressed by the record's id.
    fn prepare_batch_update(&self, record: Record) -> Self::UpdateOp;

    /// Applies one cycle's operations.
    async fn execute_batch(
        &self,
        inserts: Vec<Self::InsertOp>,
        updates: Vec<Self::UpdateOp>,
    ) -> anyhow::Result<()>;
}
