//! Cluster-wide role registry and dispatch.
//!
//! The context maps every registered role to its member list: one
//! [`WorkerRef`] per live cluster node, sorted by address. Member lists are
//! replaced atomically on membership change, so dispatch reads them without
//! locking while joins and leaves rebuild them one role at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use apm_core::{Address, DispatchMode, Record, RemoteMessage, SchemaRegistry};
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::local::LocalWorkerRef;
use super::remote::{RemoteTransport, RemoteWorkerRef};
use super::{Role, WorkerFactory, WorkerRef};
use crate::config::CollectorConfig;
use crate::error::WorkerError;
use crate::persistence::FlushReport;

/// Membership change reported by the cluster coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(Address),
    Left(Address),
}

struct RoleEntry {
    role: Role,
    factory: Arc<dyn WorkerFactory>,
    members: ArcSwap<Vec<WorkerRef>>,
    local: Mutex<Option<LocalWorkerRef>>,
}

/// Registry of roles and their members across the cluster, scoped to one
/// node.
pub struct ClusterWorkerContext {
    config: CollectorConfig,
    schemas: Arc<SchemaRegistry>,
    transport: Arc<dyn RemoteTransport>,
    roles: DashMap<String, Arc<RoleEntry>>,
    /// Known live addresses. Held while member lists are rebuilt, which
    /// serializes membership changes.
    members: Mutex<BTreeSet<Address>>,
}

impl ClusterWorkerContext {
    #[must_use]
    pub fn new(
        config: CollectorConfig,
        schemas: Arc<SchemaRegistry>,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        Self {
            config,
            schemas,
            transport,
            roles: DashMap::new(),
            members: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn local_address(&self) -> &Address {
        &self.config.local_address
    }

    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Live addresses, sorted.
    #[must_use]
    pub fn members(&self) -> Vec<Address> {
        self.members.lock().iter().cloned().collect()
    }

    /// Registered role names, sorted.
    #[must_use]
    pub fn role_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Registration and membership
    // -----------------------------------------------------------------------

    /// Registers a role whose local members are built by `factory`.
    ///
    /// Members already known are applied immediately.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::DuplicateRole`] if the name is taken.
    ///
    /// # Panics
    ///
    /// Panics if the local address is already a member and this is called
    /// outside a Tokio runtime.
    pub fn register(&self, role: Role, factory: Arc<dyn WorkerFactory>) -> Result<(), WorkerError> {
        let members = self.members.lock();
        let entry = Arc::new(RoleEntry {
            role: role.clone(),
            factory,
            members: ArcSwap::from_pointee(Vec::new()),
            local: Mutex::new(None),
        });
        match self.roles.entry(role.name().to_string()) {
            Entry::Occupied(_) => {
                return Err(WorkerError::DuplicateRole {
                    role: role.name().to_string(),
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }
        // Nothing to stop: no local member existed before registration.
        let _ = self.rebuild(&entry, &members);
        info!(role = %role, "registered role");
        Ok(())
    }

    /// Applies a node joining. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if `address` is the local address and this is called outside a
    /// Tokio runtime.
    pub fn on_member_join(&self, address: Address) {
        let mut members = self.members.lock();
        if !members.insert(address.clone()) {
            debug!(%address, "member already known");
            return;
        }
        for entry in self.entries() {
            // A join never removes the local member.
            let _ = self.rebuild(&entry, &members);
        }
        report_size(&members);
        info!(%address, members = members.len(), "member joined");
    }

    /// Applies a node leaving. Records already in flight to it are not
    /// re-routed. If the local node leaves, its local members are stopped
    /// after a final flush.
    pub async fn on_member_leave(&self, address: &Address) {
        let stopped: Vec<LocalWorkerRef> = {
            let mut members = self.members.lock();
            if !members.remove(address) {
                debug!(%address, "member already gone");
                return;
            }
            report_size(&members);
            info!(%address, members = members.len(), "member left");
            self.entries()
                .iter()
                .filter_map(|entry| self.rebuild(entry, &members))
                .collect()
        };
        for local in stopped {
            local.shutdown().await;
        }
    }

    /// Consumes membership events until the sender is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_membership_listener(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> JoinHandle<()> {
        let context = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MembershipEvent::Joined(address) => context.on_member_join(address),
                    MembershipEvent::Left(address) => context.on_member_leave(&address).await,
                }
            }
        })
    }

    fn entries(&self) -> Vec<Arc<RoleEntry>> {
        self.roles.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Recomputes one role's member list from the live address set and
    /// publishes it. Returns the local member if it has to be stopped.
    fn rebuild(&self, entry: &RoleEntry, members: &BTreeSet<Address>) -> Option<LocalWorkerRef> {
        let mut local = entry.local.lock();
        let local_is_member = members.contains(&self.config.local_address);

        let mut refs = Vec::with_capacity(members.len());
        for address in members {
            if *address == self.config.local_address {
                let worker = local.get_or_insert_with(|| {
                    let instance = entry.factory.create(&entry.role, &self.config);
                    debug!(role = %entry.role, "started local worker");
                    LocalWorkerRef::spawn(entry.role.clone(), address.clone(), instance, &self.config)
                });
                refs.push(WorkerRef::Local(worker.clone()));
            } else {
                refs.push(WorkerRef::Remote(RemoteWorkerRef::new(
                    entry.role.clone(),
                    address.clone(),
                    Arc::clone(&self.transport),
                    self.config.remote_timeout(),
                )));
            }
        }
        entry.members.store(Arc::new(refs));

        if local_is_member {
            None
        } else {
            local.take()
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn entry(&self, role: &str) -> Result<Arc<RoleEntry>, WorkerError> {
        self.roles
            .get(role)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| WorkerError::WorkerNotFound {
                role: role.to_string(),
            })
    }

    /// Current members of `role`, sorted by address. May be empty.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerNotFound`] if the role is not registered.
    pub fn lookup(&self, role: &str) -> Result<Arc<Vec<WorkerRef>>, WorkerError> {
        Ok(self.entry(role)?.members.load_full())
    }

    /// Member of `role` responsible for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerNotFound`] if the role is not registered
    /// or has no members.
    pub fn select(&self, role: &str, key: &str) -> Result<WorkerRef, WorkerError> {
        let entry = self.entry(role)?;
        let members = entry.members.load();
        entry
            .role
            .selector()
            .select(&members, key)
            .cloned()
            .ok_or_else(|| WorkerError::WorkerNotFound {
                role: role.to_string(),
            })
    }

    /// Routes `record` by its id and delivers it fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerNotFound`] if no member is available, or
    /// the delivery error of the selected member.
    pub async fn tell(&self, role: &str, record: Record) -> Result<(), WorkerError> {
        let target = self.select(role, record.id())?;
        target.tell(record).await
    }

    /// Routes `record` by its id and waits until it has been processed.
    ///
    /// # Errors
    ///
    /// Same as [`ClusterWorkerContext::tell`], plus processing failures.
    pub async fn ask(&self, role: &str, record: Record) -> Result<(), WorkerError> {
        let target = self.select(role, record.id())?;
        target.ask(record).await
    }

    /// Inbound handler for records sent by peers. Delivers to the local
    /// member only; a record is never forwarded a second time.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WorkerNotFound`] if the role has no local
    /// member here, [`WorkerError::Wire`] if the record does not match its
    /// schema, or the local delivery error.
    pub async fn receive(&self, message: RemoteMessage) -> Result<(), WorkerError> {
        let local = self.local_worker(&message.role).ok_or_else(|| WorkerError::WorkerNotFound {
            role: message.role.clone(),
        })?;
        let record = message.data.into_record(&self.schemas)?;
        match message.mode {
            DispatchMode::Tell => local.tell(record).await,
            DispatchMode::Ask => local.ask(record).await,
        }
    }

    /// Local member of `role`, if this node is a member.
    #[must_use]
    pub fn local_worker(&self, role: &str) -> Option<LocalWorkerRef> {
        self.roles.get(role)?.local.lock().clone()
    }

    /// Runs a flush cycle on every local member now.
    ///
    /// Returns one result per role that persists, keyed by role name.
    pub async fn flush_all(&self) -> Vec<(String, Result<FlushReport, WorkerError>)> {
        let mut results = Vec::new();
        for entry in self.entries() {
            let local = entry.local.lock().clone();
            let Some(local) = local else {
                continue;
            };
            match local.flush_now().await {
                Ok(None) => {}
                Ok(Some(report)) => results.push((entry.role.name().to_string(), Ok(report))),
                Err(err) => results.push((entry.role.name().to_string(), Err(err))),
            }
        }
        results
    }

    /// Stops every local member after a final flush. Member lists keep
    /// their references; dispatch to a stopped local member fails with
    /// [`WorkerError::WorkerStopped`].
    pub async fn shutdown(&self) {
        for entry in self.entries() {
            let local = entry.local.lock().clone();
            if let Some(local) = local {
                local.shutdown().await;
            }
        }
        info!(address = %self.config.local_address, "worker context stopped");
    }
}

#[allow(clippy::cast_precision_loss)]
fn report_size(members: &BTreeSet<Address>) {
    metrics::gauge!("apm_cluster_members").set(members.len() as f64);
}

#[cfg(test)]
mod tests {
    use apm_core::{ColumnKind, MergeOperation, Schema, SchemaBuilder};

    use super::*;
    use crate::persistence::MemoryDao;
    use crate::worker::{AggregationWorkerFactory, LoopbackTransport, Selector};

    const ROLE: &str = "service_metric_agg";

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new(3, "service_metric")
            .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
            .build()
            .unwrap()
    }

    fn context(port: u16) -> ClusterWorkerContext {
        let mut schemas = SchemaRegistry::new();
        schemas.register(schema()).unwrap();
        let config = CollectorConfig {
            local_address: Address::new("127.0.0.1", port),
            ..CollectorConfig::default()
        };
        ClusterWorkerContext::new(config, Arc::new(schemas), Arc::new(LoopbackTransport::new()))
    }

    fn register(context: &ClusterWorkerContext, dao: &Arc<MemoryDao>) {
        context
            .register(
                Role::new(ROLE, Selector::hash_code()),
                Arc::new(AggregationWorkerFactory::new(schema(), Arc::clone(dao))),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_role_is_rejected() {
        let context = context(1);
        let dao = Arc::new(MemoryDao::new());
        register(&context, &dao);
        let err = context
            .register(
                Role::new(ROLE, Selector::round_robin()),
                Arc::new(AggregationWorkerFactory::new(schema(), dao)),
            )
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateRole { ref role } if role == ROLE));
    }

    #[tokio::test]
    async fn unknown_role_is_not_found() {
        let context = context(1);
        assert!(matches!(
            context.lookup("nope"),
            Err(WorkerError::WorkerNotFound { ref role }) if role == "nope"
        ));
        let err = context.tell("nope", schema().build("a")).await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkerNotFound { .. }));
    }

    #[tokio::test]
    async fn role_without_members_is_not_found_on_dispatch() {
        let context = context(1);
        register(&context, &Arc::new(MemoryDao::new()));
        assert!(context.lookup(ROLE).unwrap().is_empty());
        let err = context.ask(ROLE, schema().build("a")).await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkerNotFound { .. }));
    }

    #[tokio::test]
    async fn members_are_sorted_with_one_local_entry() {
        let context = context(2);
        register(&context, &Arc::new(MemoryDao::new()));
        context.on_member_join(Address::new("127.0.0.1", 3));
        context.on_member_join(Address::new("127.0.0.1", 2));
        context.on_member_join(Address::new("127.0.0.1", 1));
        context.on_member_join(Address::new("127.0.0.1", 3));

        let members = context.lookup(ROLE).unwrap();
        let ports: Vec<u16> = members.iter().map(|m| m.address().port).collect();
        assert_eq!(ports, vec![1, 2, 3]);
        let local: Vec<bool> = members.iter().map(WorkerRef::is_local).collect();
        assert_eq!(local, vec![false, true, false]);
        assert_eq!(context.members().len(), 3);
        context.shutdown().await;
    }

    #[tokio::test]
    async fn role_registered_after_join_sees_current_members() {
        let context = context(1);
        context.on_member_join(Address::new("127.0.0.1", 1));
        context.on_member_join(Address::new("127.0.0.1", 2));
        register(&context, &Arc::new(MemoryDao::new()));
        assert_eq!(context.lookup(ROLE).unwrap().len(), 2);
        assert!(context.local_worker(ROLE).is_some());
        context.shutdown().await;
    }

    #[tokio::test]
    async fn local_join_and_leave_keep_the_same_local_worker_until_removed() {
        let context = context(1);
        register(&context, &Arc::new(MemoryDao::new()));
        context.on_member_join(Address::new("127.0.0.1", 1));
        let first = context.local_worker(ROLE).unwrap();

        context.on_member_join(Address::new("127.0.0.1", 2));
        context.on_member_leave(&Address::new("127.0.0.1", 2)).await;
        let same = context.local_worker(ROLE).unwrap();
        first.tell(schema().build("a")).await.unwrap();
        same.tell(schema().build("b")).await.unwrap();
        assert_eq!(context.lookup(ROLE).unwrap().len(), 1);
        context.shutdown().await;
    }

    #[tokio::test]
    async fn leaving_stops_the_local_worker_after_a_final_flush() {
        let context = context(1);
        let dao = Arc::new(MemoryDao::new());
        register(&context, &dao);
        let own = Address::new("127.0.0.1", 1);
        context.on_member_join(own.clone());

        let local = context.local_worker(ROLE).unwrap();
        context
            .tell(ROLE, schema().build("svc").with("calls", 7_i64).unwrap())
            .await
            .unwrap();
        context.on_member_leave(&own).await;

        assert!(context.local_worker(ROLE).is_none());
        assert!(context.lookup(ROLE).unwrap().is_empty());
        assert_eq!(dao.stored(3, "svc").unwrap().long(0), 7);
        assert!(matches!(
            local.tell(schema().build("late")).await,
            Err(WorkerError::WorkerStopped { .. })
        ));
    }

    #[tokio::test]
    async fn receive_requires_a_local_member() {
        let context = context(1);
        register(&context, &Arc::new(MemoryDao::new()));
        context.on_member_join(Address::new("127.0.0.1", 2));
        let message = RemoteMessage::new(ROLE, DispatchMode::Ask, &schema().build("a"));
        let err = context.receive(message).await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkerNotFound { .. }));
    }

    #[tokio::test]
    async fn receive_rejects_unknown_defines() {
        let context = context(1);
        register(&context, &Arc::new(MemoryDao::new()));
        context.on_member_join(Address::new("127.0.0.1", 1));
        let foreign = SchemaBuilder::new(99, "foreign").build().unwrap();
        let message = RemoteMessage::new(ROLE, DispatchMode::Tell, &foreign.build("a"));
        let err = context.receive(message).await.unwrap_err();
        assert!(matches!(err, WorkerError::Wire(_)));
        context.shutdown().await;
    }

    #[tokio::test]
    async fn flush_all_reports_per_role() {
        let context = context(1);
        let dao = Arc::new(MemoryDao::new());
        register(&context, &dao);
        context.on_member_join(Address::new("127.0.0.1", 1));
        context
            .ask(ROLE, schema().build("svc").with("calls", 2_i64).unwrap())
            .await
            .unwrap();

        let results = context.flush_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, ROLE);
        assert_eq!(results[0].1.as_ref().unwrap().inserted, 1);
        assert_eq!(dao.stored(3, "svc").unwrap().long(0), 2);
        context.shutdown().await;
    }

    #[tokio::test]
    async fn membership_listener_applies_events_in_order() {
        let context = Arc::new(context(1));
        register(&context, &Arc::new(MemoryDao::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = context.spawn_membership_listener(rx);

        tx.send(MembershipEvent::Joined(Address::new("127.0.0.1", 1))).unwrap();
        tx.send(MembershipEvent::Joined(Address::new("127.0.0.1", 2))).unwrap();
        tx.send(MembershipEvent::Left(Address::new("127.0.0.1", 2))).unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(context.members(), vec![Address::new("127.0.0.1", 1)]);
        assert!(context.local_worker(ROLE).is_some());
        context.shutdown().await;
    }
}
