//! APM collector server: aggregation windows, role-addressed workers,
//! cluster dispatch, and persistence.

pub mod config;
pub mod error;
pub mod network;
pub mod persistence;
pub mod window;
pub mod worker;

// Re-exports: flat public API
pub use config::CollectorConfig;
pub use error::WorkerError;
pub use network::{remote_router, HttpTransport};
pub use persistence::{
    Flush, FlushReport, FlushScheduler, MemoryDao, PersistenceDao, PersistenceState,
    PersistenceWorker,
};
pub use window::{AggregationCollection, Window, WindowError};
pub use worker::{
    AggregationWorker, AggregationWorkerFactory, ClusterWorkerContext, LocalInstance,
    LocalWorkerRef, LoopbackTransport, MembershipEvent, RemoteTransport, RemoteWorkerRef, Role,
    Selector, Worker, WorkerFactory, WorkerRef,
};

#[cfg(test)]
mod integration_tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use apm_core::{Address, ColumnKind, MergeOperation, Record, Schema, SchemaBuilder, SchemaRegistry};

    use super::*;

    const ROLE: &str = "service_metric_agg";
    const DEFINE_ID: u32 = 1;

    fn schema() -> Arc<Schema> {
        SchemaBuilder::new(DEFINE_ID, "service_metric")
            .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
            .column("error_calls", ColumnKind::Long, MergeOperation::Accumulate)
            .column("avg_latency", ColumnKind::Long, MergeOperation::Cover)
            .build()
            .unwrap()
    }

    fn call(id: &str, calls: i64, errors: i64, latency: i64) -> Record {
        schema()
            .build(id)
            .with("calls", calls)
            .unwrap()
            .with("error_calls", errors)
            .unwrap()
            .with("avg_latency", latency)
            .unwrap()
    }

    struct Cluster {
        nodes: Vec<Arc<ClusterWorkerContext>>,
        transport: Arc<LoopbackTransport>,
        dao: Arc<MemoryDao>,
    }

    impl Cluster {
        fn start(ports: &[u16]) -> Self {
            let mut schemas = SchemaRegistry::new();
            schemas.register(schema()).unwrap();
            let schemas = Arc::new(schemas);
            let transport = Arc::new(LoopbackTransport::new());
            let dao = Arc::new(MemoryDao::new());

            let nodes: Vec<Arc<ClusterWorkerContext>> = ports
                .iter()
                .map(|&port| {
                    let config = CollectorConfig {
                        local_address: Address::new("127.0.0.1", port),
                        ..CollectorConfig::default()
                    };
                    let shared: Arc<dyn RemoteTransport> = transport.clone();
                    let node = Arc::new(ClusterWorkerContext::new(config, Arc::clone(&schemas), shared));
                    transport.attach(&node);
                    node.register(
                        Role::new(ROLE, Selector::hash_code()),
                        Arc::new(AggregationWorkerFactory::new(schema(), Arc::clone(&dao))),
                    )
                    .unwrap();
                    node
                })
                .collect();

            for node in &nodes {
                for &port in ports {
                    node.on_member_join(Address::new("127.0.0.1", port));
                }
            }
            Self { nodes, transport, dao }
        }

        async fn flush(&self) {
            for node in &self.nodes {
                for (role, result) in node.flush_all().await {
                    result.unwrap_or_else(|err| panic!("flush of {role} failed: {err}"));
                }
            }
        }

        async fn leave(&self, index: usize) {
            let address = self.nodes[index].local_address().clone();
            for node in &self.nodes {
                node.on_member_leave(&address).await;
            }
            self.transport.detach(&address);
        }

        async fn stop(self) {
            for node in &self.nodes {
                node.shutdown().await;
            }
        }
    }

    #[tokio::test]
    async fn every_node_routes_a_key_to_the_same_owner() {
        let cluster = Cluster::start(&[11800, 11801, 11802]);
        let mut owners = BTreeSet::new();
        for i in 0..60 {
            let key = format!("svc-{i}_2024010100");
            let chosen: BTreeSet<Address> = cluster
                .nodes
                .iter()
                .map(|node| node.select(ROLE, &key).unwrap().address().clone())
                .collect();
            assert_eq!(chosen.len(), 1, "key {key} has more than one owner");
            owners.extend(chosen);
        }
        assert_eq!(owners.len(), 3);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn calls_from_every_node_aggregate_on_the_owner() {
        let cluster = Cluster::start(&[11800, 11801, 11802]);
        let id = "svc-1_2024010100";

        cluster.nodes[0].ask(ROLE, call(id, 1, 0, 50)).await.unwrap();
        cluster.nodes[1].ask(ROLE, call(id, 1, 1, 80)).await.unwrap();
        cluster.nodes[2].ask(ROLE, call(id, 1, 0, 65)).await.unwrap();
        cluster.flush().await;

        assert_eq!(cluster.dao.len(), 1);
        let stored = cluster.dao.stored(DEFINE_ID, id).unwrap();
        assert_eq!(stored.long(0), 3);
        assert_eq!(stored.long(1), 1);
        assert_eq!(stored.long(2), 65);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn stored_values_accumulate_across_flush_cycles() {
        let cluster = Cluster::start(&[11800, 11801]);
        let id = "X";

        cluster.nodes[0]
            .ask(ROLE, schema().build(id).with("calls", 5_i64).unwrap())
            .await
            .unwrap();
        cluster.flush().await;
        assert_eq!(cluster.dao.stored(DEFINE_ID, id).unwrap().long(0), 5);

        cluster.nodes[1]
            .ask(ROLE, schema().build(id).with("calls", 3_i64).unwrap())
            .await
            .unwrap();
        cluster.flush().await;
        assert_eq!(cluster.dao.stored(DEFINE_ID, id).unwrap().long(0), 8);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn departed_node_is_no_longer_selected() {
        let cluster = Cluster::start(&[11800, 11801, 11802]);
        let gone = cluster.nodes[2].local_address().clone();
        cluster.leave(2).await;

        for node in &cluster.nodes[..2] {
            assert_eq!(node.lookup(ROLE).unwrap().len(), 2);
        }
        assert!(cluster.nodes[2].local_worker(ROLE).is_none());

        for i in 0..30 {
            let key = format!("svc-{i}");
            let owner = cluster.nodes[0].select(ROLE, &key).unwrap();
            assert_ne!(owner.address(), &gone);
            cluster.nodes[1].ask(ROLE, call(&key, 1, 0, 10)).await.unwrap();
        }
        cluster.flush().await;
        assert_eq!(cluster.dao.len(), 30);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_remote_dispatch_error() {
        let cluster = Cluster::start(&[11800, 11801]);
        let peer = cluster.nodes[1].local_address().clone();
        cluster.transport.detach(&peer);

        let key = (0..)
            .map(|i| format!("svc-{i}"))
            .find(|key| cluster.nodes[0].select(ROLE, key).unwrap().address() == &peer)
            .unwrap();
        let err = cluster.nodes[0].tell(ROLE, call(&key, 1, 0, 1)).await.unwrap_err();
        assert!(matches!(err, WorkerError::RemoteDispatch { ref address, .. } if *address == peer));
        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatch_and_flushes_lose_no_updates() {
        let cluster = Arc::new(Cluster::start(&[11800, 11801, 11802]));
        let mut tasks = Vec::new();
        for n in 0..cluster.nodes.len() {
            let cluster = Arc::clone(&cluster);
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let key = format!("svc-{}", i % 17);
                    cluster.nodes[n].ask(ROLE, call(&key, 1, 0, i)).await.unwrap();
                }
            }));
        }
        let flusher = {
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                for _ in 0..10 {
                    cluster.flush().await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for task in tasks {
            task.await.unwrap();
        }
        flusher.await.unwrap();
        cluster.flush().await;

        let total: i64 = cluster.dao.rows_of(DEFINE_ID).iter().map(|r| r.long(0)).sum();
        assert_eq!(total, 600);
        assert_eq!(cluster.dao.len(), 17);
        for node in &cluster.nodes {
            node.shutdown().await;
        }
    }
}
