//! Failure taxonomy of dispatch and persistence.
//!
//! None of these errors is retried internally. Dispatch failures are reported
//! to the caller, worker failures inside fire-and-forget delivery are logged
//! and dropped, and persistence failures surface once per flush cycle.

use apm_core::{Address, WireError};

use crate::window::WindowError;

/// Errors from role dispatch, worker execution, and persistence.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Role unknown, or no member currently available for it.
    #[error("no worker available for role {role}")]
    WorkerNotFound { role: String },
    #[error("role {role} is already registered")]
    DuplicateRole { role: String },
    /// The worker's own processing failed.
    #[error("worker for role {role} failed: {source:#}")]
    WorkerInvoke {
        role: String,
        #[source]
        source: anyhow::Error,
    },
    /// Serialization or RPC to a peer failed. The record is not re-routed.
    #[error("dispatch of role {role} to {address} failed: {source:#}")]
    RemoteDispatch {
        role: String,
        address: Address,
        #[source]
        source: anyhow::Error,
    },
    /// The batch write of one flush cycle failed. The drained generation is
    /// released regardless.
    #[error("persistence batch of role {role} failed for {records} records: {source:#}")]
    PersistenceBatch {
        role: String,
        records: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("record of define {actual} sent to role {role} expecting define {expected}")]
    SchemaMismatch {
        role: String,
        expected: u32,
        actual: u32,
    },
    #[error("local worker for role {role} is stopped")]
    WorkerStopped { role: String },
    #[error("ask to role {role} timed out after {timeout_ms}ms")]
    AskTimeout { role: String, timeout_ms: u64 },
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl WorkerError {
    /// Role the error belongs to, when it has one.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        match self {
            Self::WorkerNotFound { role }
            | Self::DuplicateRole { role }
            | Self::WorkerInvoke { role, .. }
            | Self::RemoteDispatch { role, .. }
            | Self::PersistenceBatch { role, .. }
            | Self::SchemaMismatch { role, .. }
            | Self::WorkerStopped { role }
            | Self::AskTimeout { role, .. } => Some(role),
            Self::Window(_) | Self::Wire(_) => None,
        }
    }
}
