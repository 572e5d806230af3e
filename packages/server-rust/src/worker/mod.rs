//! Role-addressed workers.
//!
//! A role has at most one worker per node. Callers never hold workers
//! directly: they address a role through the
//! [`ClusterWorkerContext`], which selects a member and hands back a
//! [`WorkerRef`]. That reference is either the node's own local worker or a
//! remote reference that ships the record to a peer.

pub mod aggregation;
pub mod context;
pub mod local;
pub mod remote;
pub mod role;

use std::sync::Arc;

use apm_core::{Address, Record};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::CollectorConfig;
use crate::error::WorkerError;
use crate::persistence::Flush;

// Re-exports: flat public API
pub use aggregation::{AggregationWorker, AggregationWorkerFactory};
pub use context::{ClusterWorkerContext, MembershipEvent};
pub use local::LocalWorkerRef;
pub use remote::{LoopbackTransport, RemoteTransport, RemoteWorkerRef};
pub use role::{Role, Selector};

// ---------------------------------------------------------------------------
// Worker traits
// ---------------------------------------------------------------------------

/// Processes records delivered to the local member of a role.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn on_work(&self, record: Record) -> anyhow::Result<()>;
}

/// Parts of a role's local member on this node.
pub struct LocalInstance {
    pub worker: Arc<dyn Worker>,
    /// Flushes the worker's aggregation window, if it has one.
    pub persistence: Option<Arc<dyn Flush>>,
    /// Raised by the worker to request an early flush.
    pub backlog: Arc<Notify>,
}

/// Builds the local member of a role when this node joins the cluster.
pub trait WorkerFactory: Send + Sync + 'static {
    fn create(&self, role: &Role, config: &CollectorConfig) -> LocalInstance;
}

// ---------------------------------------------------------------------------
// WorkerRef
// ---------------------------------------------------------------------------

/// One member of a role: the local worker or a reference to a peer's.
#[derive(Clone)]
pub enum WorkerRef {
    Local(LocalWorkerRef),
    Remote(RemoteWorkerRef),
}

impl std::fmt::Debug for WorkerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(local) => write!(f, "Local({})", local.address()),
            Self::Remote(remote) => write!(f, "Remote({})", remote.address()),
        }
    }
}

impl WorkerRef {
    #[must_use]
    pub fn address(&self) -> &Address {
        match self {
            Self::Local(local) => local.address(),
            Self::Remote(remote) => remote.address(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Fire-and-forget delivery.
    ///
    /// # Errors
    ///
    /// Local: [`WorkerError::WorkerStopped`]. Remote:
    /// [`WorkerError::RemoteDispatch`].
    pub async fn tell(&self, record: Record) -> Result<(), WorkerError> {
        match self {
            Self::Local(local) => local.tell(record).await,
            Self::Remote(remote) => remote.tell(record).await,
        }
    }

    /// Delivery that completes once the target worker has processed the
    /// record, bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// Local: [`WorkerError::WorkerInvoke`], [`WorkerError::AskTimeout`] or
    /// [`WorkerError::WorkerStopped`]. Remote: [`WorkerError::RemoteDispatch`].
    pub async fn ask(&self, record: Record) -> Result<(), WorkerError> {
        match self {
            Self::Local(local) => local.ask(record).await,
            Self::Remote(remote) => remote.ask(record).await,
        }
    }
}
