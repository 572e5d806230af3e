//! Local member of a role: a bounded inbox consumed by one task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apm_core::{Address, Record};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LocalInstance, Role, Worker};
use crate::config::CollectorConfig;
use crate::error::WorkerError;
use crate::persistence::{FlushReport, FlushScheduler};

struct Envelope {
    record: Record,
    /// Present for `ask`; receives the processing result.
    reply: Option<oneshot::Sender<Result<(), WorkerError>>>,
}

struct Runtime {
    shutdown_tx: oneshot::Sender<()>,
    inbox_task: JoinHandle<()>,
    scheduler: Option<FlushScheduler>,
}

struct LocalInner {
    role: Role,
    address: Address,
    inbox: mpsc::Sender<Envelope>,
    ask_timeout: Duration,
    invoke_failures: Arc<AtomicU64>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

/// Cloneable reference to the running local member of a role.
#[derive(Clone)]
pub struct LocalWorkerRef {
    inner: Arc<LocalInner>,
}

impl LocalWorkerRef {
    /// Starts the inbox task and, if the instance persists, its flush
    /// scheduler.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(role: Role, address: Address, instance: LocalInstance, config: &CollectorConfig) -> Self {
        let (inbox, mut inbox_rx) = mpsc::channel::<Envelope>(config.inbox_capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let invoke_failures = Arc::new(AtomicU64::new(0));

        let worker = instance.worker;
        let task_role = role.clone();
        let task_failures = Arc::clone(&invoke_failures);
        let inbox_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbox_rx.recv() => match envelope {
                        Some(envelope) => deliver(&*worker, &task_role, &task_failures, envelope).await,
                        None => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            // Process whatever was queued before the shutdown.
            inbox_rx.close();
            while let Some(envelope) = inbox_rx.recv().await {
                deliver(&*worker, &task_role, &task_failures, envelope).await;
            }
            debug!(role = %task_role, "local worker stopped");
        });

        let scheduler = instance.persistence.map(|persistence| {
            FlushScheduler::start(persistence, instance.backlog, config.persistence_interval())
        });

        Self {
            inner: Arc::new(LocalInner {
                role,
                address,
                inbox,
                ask_timeout: config.remote_timeout(),
                invoke_failures,
                runtime: tokio::sync::Mutex::new(Some(Runtime {
                    shutdown_tx,
                    inbox_task,
                    scheduler,
                })),
            }),
        }
    }

    #[must_use]
    pub fn role(&self) -> &Role {
        &self.inner.role
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Records whose processing failed since the worker started.
    #[must_use]
    pub fn invoke_failures(&self) -> u64 {
        self.inner.invoke_failures.load(Ordering::Relaxed)
    }

    fn stopped(&self) -> WorkerError {
        WorkerError::WorkerStopped {
            role: self.inner.role.name().to_string(),
        }
    }

    /// Queues `record`. Waits only for inbox capacity.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerStopped`] after shutdown.
    pub async fn tell(&self, record: Record) -> Result<(), WorkerError> {
        self.inner
            .inbox
            .send(Envelope { record, reply: None })
            .await
            .map_err(|_| self.stopped())
    }

    /// Queues `record` and waits until it has been processed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerInvoke`] if processing failed,
    /// [`WorkerError::AskTimeout`] if no result arrived in time, and
    /// [`WorkerError::WorkerStopped`] after shutdown.
    pub async fn ask(&self, record: Record) -> Result<(), WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.inner
                .inbox
                .send(Envelope {
                    record,
                    reply: Some(reply_tx),
                })
                .await
                .map_err(|_| self.stopped())?;
            reply_rx.await.map_err(|_| self.stopped())?
        };
        let timeout = self.inner.ask_timeout;
        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| WorkerError::AskTimeout {
                role: self.inner.role.name().to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Runs a flush cycle now. `Ok(None)` if this worker does not persist.
    ///
    /// # Errors
    ///
    /// Returns the cycle's error, or [`WorkerError::WorkerStopped`] after
    /// shutdown.
    pub async fn flush_now(&self) -> Result<Option<FlushReport>, WorkerError> {
        let runtime = self.inner.runtime.lock().await;
        match runtime.as_ref() {
            None => Err(self.stopped()),
            Some(Runtime { scheduler: None, .. }) => Ok(None),
            Some(Runtime {
                scheduler: Some(scheduler),
                ..
            }) => scheduler.flush_now(self.inner.role.name()).await.map(Some),
        }
    }

    /// Stops accepting records, processes the queued ones, then runs a final
    /// flush. Later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return;
        };
        let _ = runtime.shutdown_tx.send(());
        let _ = runtime.inbox_task.await;
        if let Some(mut scheduler) = runtime.scheduler {
            scheduler.stop().await;
        }
    }
}

async fn deliver(worker: &dyn Worker, role: &Role, failures: &AtomicU64, envelope: Envelope) {
    let result = worker
        .on_work(envelope.record)
        .await
        .map_err(|source| WorkerError::WorkerInvoke {
            role: role.name().to_string(),
            source,
        });

    if result.is_err() {
        failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("apm_worker_invoke_failures_total", "role" => role.name().to_string())
            .increment(1);
    }

    match envelope.reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(err) = result {
                warn!(role = %role, error = %err, "dropping record after worker failure");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use apm_core::{Schema, SchemaBuilder};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::persistence::{MemoryDao, PersistenceWorker};
    use crate::window::Window;
    use crate::worker::Selector;

    #[derive(Default)]
    struct RecordingWorker {
        seen: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Worker for RecordingWorker {
        async fn on_work(&self, record: Record) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if record.id().starts_with("bad") {
                anyhow::bail!("cannot handle {}", record.id());
            }
            self.seen.lock().push(record.id().to_string());
            Ok(())
        }
    }

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new(1, "plain").build().unwrap()
    }

    fn spawn(worker: Arc<RecordingWorker>, config: &CollectorConfig) -> LocalWorkerRef {
        LocalWorkerRef::spawn(
            Role::new("plain", Selector::hash_code()),
            config.local_address.clone(),
            LocalInstance {
                worker,
                persistence: None,
                backlog: Arc::new(Notify::new()),
            },
            config,
        )
    }

    #[tokio::test]
    async fn tell_delivers_in_order() {
        let worker = Arc::new(RecordingWorker::default());
        let local = spawn(Arc::clone(&worker), &CollectorConfig::default());
        for id in ["a", "b", "c"] {
            local.tell(schema().build(id)).await.unwrap();
        }
        local.shutdown().await;
        assert_eq!(*worker.seen.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_tell_is_counted_and_dropped() {
        let worker = Arc::new(RecordingWorker::default());
        let local = spawn(Arc::clone(&worker), &CollectorConfig::default());
        local.tell(schema().build("bad-1")).await.unwrap();
        local.tell(schema().build("ok")).await.unwrap();
        local.ask(schema().build("ok-2")).await.unwrap();

        assert_eq!(local.invoke_failures(), 1);
        assert_eq!(*worker.seen.lock(), vec!["ok", "ok-2"]);
        local.shutdown().await;
    }

    #[tokio::test]
    async fn ask_reports_worker_failure() {
        let local = spawn(Arc::new(RecordingWorker::default()), &CollectorConfig::default());
        let err = local.ask(schema().build("bad-2")).await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkerInvoke { ref role, .. } if role == "plain"));
        local.shutdown().await;
    }

    #[tokio::test]
    async fn ask_is_bounded_by_the_timeout() {
        let config = CollectorConfig {
            remote_timeout_ms: 20,
            ..CollectorConfig::default()
        };
        let worker = Arc::new(RecordingWorker {
            delay: Some(Duration::from_millis(500)),
            ..RecordingWorker::default()
        });
        let local = spawn(worker, &config);
        let err = local.ask(schema().build("slow")).await.unwrap_err();
        assert!(matches!(err, WorkerError::AskTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_records() {
        let local = spawn(Arc::new(RecordingWorker::default()), &CollectorConfig::default());
        local.shutdown().await;
        local.shutdown().await;
        assert!(matches!(
            local.tell(schema().build("late")).await,
            Err(WorkerError::WorkerStopped { .. })
        ));
        assert!(matches!(local.flush_now().await, Err(WorkerError::WorkerStopped { .. })));
    }

    #[tokio::test]
    async fn flush_now_without_persistence_is_none() {
        let local = spawn(Arc::new(RecordingWorker::default()), &CollectorConfig::default());
        assert_eq!(local.flush_now().await.unwrap(), None);
        local.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_runs_a_final_flush() {
        struct WindowWorker(Arc<Window>);

        #[async_trait]
        impl Worker for WindowWorker {
            async fn on_work(&self, record: Record) -> anyhow::Result<()> {
                Ok(self.0.write(record)?)
            }
        }

        let window = Arc::new(Window::new());
        let dao = Arc::new(MemoryDao::new());
        let persistence = PersistenceWorker::new("plain", Arc::clone(&window), Arc::clone(&dao), true);
        let config = CollectorConfig::default();
        let local = LocalWorkerRef::spawn(
            Role::new("plain", Selector::hash_code()),
            config.local_address.clone(),
            LocalInstance {
                worker: Arc::new(WindowWorker(window)),
                persistence: Some(Arc::new(persistence)),
                backlog: Arc::new(Notify::new()),
            },
            &config,
        );

        local.tell(schema().build("a")).await.unwrap();
        local.tell(schema().build("b")).await.unwrap();
        local.shutdown().await;
        assert_eq!(dao.len(), 2);
    }

    #[tokio::test]
    async fn extreme_averages_do_not_stop_the_worker() {
        use apm_core::{ColumnKind, Formula, MergeOperation};

        use crate::worker::{AggregationWorkerFactory, WorkerFactory};

        let schema = SchemaBuilder::new(3, "latency")
            .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
            .column("latency_sum", ColumnKind::Long, MergeOperation::Accumulate)
            .formula("avg_latency", ColumnKind::Long, Formula::average("latency_sum", "calls"))
            .build()
            .unwrap();
        let dao = Arc::new(MemoryDao::new());
        let config = CollectorConfig::default();
        let role = Role::new("latency", Selector::hash_code());
        let instance = AggregationWorkerFactory::new(Arc::clone(&schema), Arc::clone(&dao))
            .create(&role, &config);
        let local = LocalWorkerRef::spawn(role, config.local_address.clone(), instance, &config);

        let first = schema
            .build("a")
            .with("calls", -1_i64)
            .unwrap()
            .with("latency_sum", i64::MIN + 1)
            .unwrap();
        local.tell(first).await.unwrap();
        local.tell(schema.build("a").with("latency_sum", -1_i64).unwrap()).await.unwrap();
        local.ask(schema.build("b").with("calls", 1_i64).unwrap()).await.unwrap();

        local.flush_now().await.unwrap();
        assert_eq!(dao.stored(3, "a").unwrap().long(2), 0);
        assert_eq!(dao.stored(3, "b").unwrap().long(0), 1);
        local.shutdown().await;
    }
}
