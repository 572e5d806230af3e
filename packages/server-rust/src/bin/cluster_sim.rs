//! Runs an in-process collector cluster against a shared in-memory store and
//! checks that every call is persisted exactly once.
//!
//! Usage:
//! ```bash
//! cargo run --bin cluster-sim -- --nodes 3 --services 20 --calls 500 --transport http
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{ensure, Context as _};
use apm_core::{
    record_id, Address, ColumnKind, Formula, MergeOperation, Record, Schema, SchemaBuilder,
    SchemaRegistry, TimeBucket, Value,
};
use apm_server::network::serve;
use apm_server::{
    AggregationWorkerFactory, ClusterWorkerContext, CollectorConfig, HttpTransport,
    LoopbackTransport, MemoryDao, MembershipEvent, RemoteTransport, Role, Selector,
};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ROLE: &str = "service_metric_agg";
const DEFINE_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// In-process delivery through the wire encoding.
    Loopback,
    /// HTTP between listeners bound on 127.0.0.1.
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "cluster-sim", about)]
struct Args {
    /// Collector nodes in the cluster.
    #[arg(long, env = "APM_SIM_NODES", default_value_t = 3)]
    nodes: usize,

    /// Distinct services reporting calls.
    #[arg(long, env = "APM_SIM_SERVICES", default_value_t = 20)]
    services: usize,

    /// Calls reported per service, spread over all nodes.
    #[arg(long, env = "APM_SIM_CALLS", default_value_t = 200)]
    calls: usize,

    /// Scheduled flush interval of every persistence worker.
    #[arg(long, env = "APM_SIM_FLUSH_INTERVAL_MS", default_value_t = 200)]
    flush_interval_ms: u64,

    #[arg(long, value_enum, default_value_t = TransportKind::Loopback)]
    transport: TransportKind,

    /// First port of the loopback cluster. HTTP nodes bind ephemeral ports.
    #[arg(long, default_value_t = 11800)]
    base_port: u16,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "APM_SIM_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Default)]
struct Expected {
    errors: AtomicI64,
    latency: AtomicI64,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn service_schema() -> anyhow::Result<Arc<Schema>> {
    Ok(SchemaBuilder::new(DEFINE_ID, "service_metric")
        .column("service", ColumnKind::String, MergeOperation::NonOperation)
        .column("calls", ColumnKind::Long, MergeOperation::Accumulate)
        .column("error_calls", ColumnKind::Long, MergeOperation::Accumulate)
        .column("latency_sum", ColumnKind::Long, MergeOperation::Accumulate)
        .column("last_latency", ColumnKind::Long, MergeOperation::Cover)
        .formula("avg_latency", ColumnKind::Long, Formula::average("latency_sum", "calls"))
        .build()?)
}

fn long(record: &Record, column: &str) -> i64 {
    match record.get(column) {
        Ok(Some(Value::Long(value))) => value,
        _ => 0,
    }
}

async fn bind_nodes(args: &Args) -> anyhow::Result<(Vec<Address>, Vec<Option<TcpListener>>)> {
    let mut addresses = Vec::with_capacity(args.nodes);
    let mut listeners = Vec::with_capacity(args.nodes);
    for n in 0..args.nodes {
        match args.transport {
            TransportKind::Loopback => {
                let port = args
                    .base_port
                    .checked_add(u16::try_from(n)?)
                    .context("port range overflows")?;
                addresses.push(Address::new("127.0.0.1", port));
                listeners.push(None);
            }
            TransportKind::Http => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                addresses.push(Address::new("127.0.0.1", port));
                listeners.push(Some(listener));
            }
        }
    }
    Ok((addresses, listeners))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    ensure!(args.nodes > 0, "at least one node is required");

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "prometheus exporter listening");
    }

    let schema = service_schema()?;
    let mut registry = SchemaRegistry::new();
    registry.register(Arc::clone(&schema))?;
    let schemas = Arc::new(registry);
    let dao = Arc::new(MemoryDao::new());

    let (addresses, listeners) = bind_nodes(&args).await?;
    let loopback = Arc::new(LoopbackTransport::new());
    let transport: Arc<dyn RemoteTransport> = match args.transport {
        TransportKind::Loopback => loopback.clone(),
        TransportKind::Http => Arc::new(HttpTransport::new(Duration::from_secs(5))?),
    };

    // -- Nodes --------------------------------------------------------------
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut nodes = Vec::with_capacity(args.nodes);
    let mut servers = Vec::new();
    for (address, listener) in addresses.iter().zip(listeners) {
        let config = CollectorConfig {
            local_address: address.clone(),
            persistence_interval_ms: args.flush_interval_ms,
            ..CollectorConfig::default()
        };
        let node = Arc::new(ClusterWorkerContext::new(
            config,
            Arc::clone(&schemas),
            Arc::clone(&transport),
        ));
        node.register(
            Role::new(ROLE, Selector::hash_code()),
            Arc::new(AggregationWorkerFactory::new(Arc::clone(&schema), Arc::clone(&dao))),
        )?;
        loopback.attach(&node);
        if let Some(listener) = listener {
            let mut stop = stop_rx.clone();
            servers.push(tokio::spawn(serve(listener, Arc::clone(&node), async move {
                let _ = stop.changed().await;
            })));
        }
        nodes.push(node);
    }

    for node in &nodes {
        let (events, rx) = mpsc::unbounded_channel();
        let listener = node.spawn_membership_listener(rx);
        for address in &addresses {
            events.send(MembershipEvent::Joined(address.clone()))?;
        }
        drop(events);
        listener.await?;
    }
    info!(nodes = nodes.len(), transport = ?args.transport, "cluster formed");

    // -- Traffic ------------------------------------------------------------
    let now_ms = i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())?;
    let bucket = TimeBucket::Minute
        .bucket(now_ms)
        .context("timestamp out of range")?;
    let expected = Arc::new(Expected::default());
    let started = Instant::now();

    let mut senders = Vec::with_capacity(nodes.len());
    for (n, node) in nodes.iter().enumerate() {
        let node = Arc::clone(node);
        let schema = Arc::clone(&schema);
        let expected = Arc::clone(&expected);
        let (services, calls, node_count) = (args.services, args.calls, args.nodes);
        senders.push(tokio::spawn(async move {
            let mut failures = 0_u64;
            for service in 0..services {
                let entity = format!("svc-{service}");
                for _ in (n..calls).step_by(node_count) {
                    let latency: i64 = rand::random_range(5..250);
                    let errors = i64::from(latency > 220);
                    let record = schema
                        .build(record_id(&entity, bucket))
                        .with("service", entity.as_str())
                        .and_then(|r| r.with("calls", 1_i64))
                        .and_then(|r| r.with("error_calls", errors))
                        .and_then(|r| r.with("latency_sum", latency))
                        .and_then(|r| r.with("last_latency", latency));
                    let record = match record {
                        Ok(record) => record,
                        Err(err) => {
                            warn!(error = %err, "invalid record");
                            failures += 1;
                            continue;
                        }
                    };
                    match node.ask(ROLE, record).await {
                        Ok(()) => {
                            expected.errors.fetch_add(errors, Ordering::Relaxed);
                            expected.latency.fetch_add(latency, Ordering::Relaxed);
                        }
                        Err(err) => {
                            warn!(error = %err, "dispatch failed");
                            failures += 1;
                        }
                    }
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for sender in senders {
        failures += sender.await?;
    }
    ensure!(failures == 0, "{failures} calls were not delivered");
    info!(elapsed_ms = started.elapsed().as_millis(), "traffic sent");

    // -- Drain and verify ---------------------------------------------------
    for node in &nodes {
        for (role, result) in node.flush_all().await {
            result.with_context(|| format!("final flush of {role} failed"))?;
        }
    }
    for node in &nodes {
        node.shutdown().await;
    }
    let _ = stop_tx.send(true);
    for server in servers {
        server.await??;
    }

    let rows = dao.rows_of(DEFINE_ID);
    ensure!(
        rows.len() == args.services,
        "expected {} rows, found {}",
        args.services,
        rows.len()
    );
    let expected_calls = i64::try_from(args.calls)?;
    for row in &rows {
        ensure!(
            long(row, "calls") == expected_calls,
            "{} stored {} calls, expected {expected_calls}",
            row.id(),
            long(row, "calls")
        );
    }
    let errors: i64 = rows.iter().map(|row| long(row, "error_calls")).sum();
    let latency: i64 = rows.iter().map(|row| long(row, "latency_sum")).sum();
    ensure!(errors == expected.errors.load(Ordering::Relaxed), "error calls diverged");
    ensure!(latency == expected.latency.load(Ordering::Relaxed), "latency sum diverged");

    info!(
        rows = rows.len(),
        batches = dao.batches(),
        errors,
        elapsed_ms = started.elapsed().as_millis(),
        "all calls persisted exactly once"
    );
    Ok(())
}
