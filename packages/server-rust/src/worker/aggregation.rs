//! Aggregation workers: merge records into a window that a persistence worker
//! flushes.

use std::sync::Arc;

use apm_core::{Record, Schema};
use async_trait::async_trait;
use tokio::sync::Notify;

use super::{LocalInstance, Role, Worker, WorkerFactory};
use crate::config::CollectorConfig;
use crate::error::WorkerError;
use crate::persistence::{PersistenceDao, PersistenceWorker};
use crate::window::Window;

/// Merges records of one schema into its window and raises the backlog
/// signal once the active generation reaches the threshold.
pub struct AggregationWorker {
    role: Role,
    schema: Arc<Schema>,
    window: Arc<Window>,
    backlog: Arc<Notify>,
    backlog_threshold: usize,
}

impl AggregationWorker {
    #[must_use]
    pub fn new(
        role: Role,
        schema: Arc<Schema>,
        window: Arc<Window>,
        backlog: Arc<Notify>,
        backlog_threshold: usize,
    ) -> Self {
        Self {
            role,
            schema,
            window,
            backlog,
            backlog_threshold,
        }
    }

    #[must_use]
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

#[async_trait]
impl Worker for AggregationWorker {
    async fn on_work(&self, record: Record) -> anyhow::Result<()> {
        if record.define_id() != self.schema.define_id() {
            return Err(WorkerError::SchemaMismatch {
                role: self.role.name().to_string(),
                expected: self.schema.define_id(),
                actual: record.define_id(),
            }
            .into());
        }
        self.window.write(record)?;
        if self.window.active_len() >= self.backlog_threshold {
            self.backlog.notify_one();
        }
        Ok(())
    }
}

/// Builds an aggregation worker, its window, and its persistence worker for
/// every local instance of a role.
pub struct AggregationWorkerFactory<D: PersistenceDao> {
    schema: Arc<Schema>,
    dao: Arc<D>,
    need_merge_db_data: bool,
}

impl<D: PersistenceDao> AggregationWorkerFactory<D> {
    /// Factory whose persistence reconciles with stored values.
    #[must_use]
    pub fn new(schema: Arc<Schema>, dao: Arc<D>) -> Self {
        Self {
            schema,
            dao,
            need_merge_db_data: true,
        }
    }

    /// Skips reading stored values and writes every drained record as an
    /// insert. Only for records that are written once, whose ids never
    /// recur across flush cycles.
    #[must_use]
    pub fn write_once(mut self) -> Self {
        self.need_merge_db_data = false;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }
}

impl<D: PersistenceDao> WorkerFactory for AggregationWorkerFactory<D> {
    fn create(&self, role: &Role, config: &CollectorConfig) -> LocalInstance {
        let window = Arc::new(Window::new());
        let backlog = Arc::new(Notify::new());
        let worker = AggregationWorker::new(
            role.clone(),
            Arc::clone(&self.schema),
            Arc::clone(&window),
            Arc::clone(&backlog),
            config.backlog_threshold,
        );
        let persistence = PersistenceWorker::new(
            role.name(),
            window,
            Arc::clone(&self.dao),
            self.need_merge_db_data,
        );
        LocalInstance {
            worker: Arc::new(worker),
            persistence: Some(Arc::new(persistence)),
            backlog,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use apm_core::{ColumnKind, MergeOperation, SchemaBuilder};

    use super::*;
    use crate::persistence::MemoryDao;
    use crate::worker::Selector;

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new(11, "service_metric")
            .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
            .build()
            .unwrap()
    }

    fn worker(threshold: usize) -> (AggregationWorker, Arc<Notify>) {
        let backlog = Arc::new(Notify::new());
        let worker = AggregationWorker::new(
            Role::new("service_metric_agg", Selector::hash_code()),
            schema(),
            Arc::new(Window::new()),
            Arc::clone(&backlog),
            threshold,
        );
        (worker, backlog)
    }

    #[tokio::test]
    async fn on_work_aggregates_into_the_window() {
        let (worker, _) = worker(100);
        let schema = schema();
        worker.on_work(schema.build("a").with("calls", 2_i64).unwrap()).await.unwrap();
        worker.on_work(schema.build("a").with("calls", 3_i64).unwrap()).await.unwrap();
        assert_eq!(worker.window().snapshot("a").unwrap().long(0), 5);
    }

    #[tokio::test]
    async fn foreign_schema_is_rejected() {
        let (worker, _) = worker(100);
        let other = SchemaBuilder::new(12, "other").build().unwrap();
        let err = worker.on_work(other.build("a")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkerError>(),
            Some(WorkerError::SchemaMismatch { expected: 11, actual: 12, .. })
        ));
    }

    #[tokio::test]
    async fn backlog_signal_fires_at_threshold() {
        let (worker, backlog) = worker(2);
        let schema = schema();
        worker.on_work(schema.build("a")).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(20), backlog.notified()).await;
        assert!(early.is_err());

        worker.on_work(schema.build("b")).await.unwrap();
        let signalled = tokio::time::timeout(Duration::from_millis(20), backlog.notified()).await;
        assert!(signalled.is_ok());
    }

    #[tokio::test]
    async fn factory_wires_worker_window_and_persistence() {
        let dao = Arc::new(MemoryDao::new());
        let factory = AggregationWorkerFactory::new(schema(), Arc::clone(&dao));
        let role = Role::new("service_metric_agg", Selector::hash_code());
        let instance = factory.create(&role, &CollectorConfig::default());

        instance
            .worker
            .on_work(schema().build("a").with("calls", 4_i64).unwrap())
            .await
            .unwrap();
        let persistence = instance.persistence.unwrap();
        assert_eq!(persistence.role(), "service_metric_agg");
        let report = persistence.flush().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(dao.stored(11, "a").unwrap().long(0), 4);
    }
}
