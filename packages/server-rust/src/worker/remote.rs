//! Remote worker references and the transport they deliver through.

use std::sync::{Arc, Weak};
use std::time::Duration;

use apm_core::{Address, DispatchMode, Record, RemoteMessage};
use async_trait::async_trait;
use dashmap::DashMap;

use super::context::ClusterWorkerContext;
use super::Role;
use crate::error::WorkerError;

/// Carries role-addressed records to the inbound handler of a peer.
///
/// For [`DispatchMode::Tell`] the delivery completes once the peer has queued
/// the record; for [`DispatchMode::Ask`] once the peer has processed it.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    async fn deliver(&self, address: &Address, message: RemoteMessage) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// RemoteWorkerRef
// ---------------------------------------------------------------------------

/// Member of a role living on a peer node.
#[derive(Clone)]
pub struct RemoteWorkerRef {
    role: Role,
    address: Address,
    transport: Arc<dyn RemoteTransport>,
    timeout: Duration,
}

impl RemoteWorkerRef {
    #[must_use]
    pub fn new(role: Role, address: Address, transport: Arc<dyn RemoteTransport>, timeout: Duration) -> Self {
        Self {
            role,
            address,
            transport,
            timeout,
        }
    }

    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[must_use]
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// # Errors
    ///
    /// Returns [`WorkerError::RemoteDispatch`] if the peer could not be
    /// reached, rejected the record, or did not answer in time.
    pub async fn tell(&self, record: Record) -> Result<(), WorkerError> {
        self.dispatch(DispatchMode::Tell, &record).await
    }

    /// # Errors
    ///
    /// Same as [`RemoteWorkerRef::tell`], including failures of the peer's
    /// worker.
    pub async fn ask(&self, record: Record) -> Result<(), WorkerError> {
        self.dispatch(DispatchMode::Ask, &record).await
    }

    async fn dispatch(&self, mode: DispatchMode, record: &Record) -> Result<(), WorkerError> {
        let message = RemoteMessage::new(self.role.name(), mode, record);
        let outcome = match tokio::time::timeout(self.timeout, self.transport.deliver(&self.address, message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!(
                "no answer within {}ms",
                self.timeout.as_millis()
            )),
        };
        outcome.map_err(|source| {
            metrics::counter!("apm_remote_dispatch_failures_total", "role" => self.role.name().to_string())
                .increment(1);
            WorkerError::RemoteDispatch {
                role: self.role.name().to_string(),
                address: self.address.clone(),
                source,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// LoopbackTransport
// ---------------------------------------------------------------------------

/// In-process transport between contexts of the same process.
///
/// Messages are encoded and decoded exactly as on a network hop.
#[derive(Default)]
pub struct LoopbackTransport {
    peers: DashMap<Address, Weak<ClusterWorkerContext>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `context` reachable at its local address.
    pub fn attach(&self, context: &Arc<ClusterWorkerContext>) {
        self.peers
            .insert(context.local_address().clone(), Arc::downgrade(context));
    }

    /// Makes `address` unreachable, simulating a crashed peer.
    pub fn detach(&self, address: &Address) {
        self.peers.remove(address);
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn deliver(&self, address: &Address, message: RemoteMessage) -> anyhow::Result<()> {
        let bytes = message.encode()?;
        let peer = self
            .peers
            .get(address)
            .and_then(|peer| peer.upgrade())
            .ok_or_else(|| anyhow::anyhow!("peer {address} unreachable"))?;
        let message = RemoteMessage::decode(&bytes)?;
        peer.receive(message).await?;
        Ok(())
    }
}
