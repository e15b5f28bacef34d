//! Wiring of the panel's components and background tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use fluxgate_core::Config;
use fluxgate_core::config::TrafficConfig;

use crate::auth::TokenVerifier;
use crate::http::{self, AppState};
use crate::limits::{DailySweep, EnforcementQueue, EnforcementReceiver, LimitEnforcer};
use crate::orchestrator::Orchestrator;
use crate::reconcile::Reconciler;
use crate::registry::SessionRegistry;
use crate::router::{AgentRpc, RpcCorrelator};
use crate::storage::PanelDatabase;
use crate::traffic::{IngestJob, IngestQueue, IngestWorker, TrafficAggregator, run_retention_loop};

/// Enforcement queue depth; checks are deduplicated per scope.
const ENFORCEMENT_QUEUE: usize = 1024;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Receivers handed to the background tasks on `start`.
struct Inputs {
    jobs: mpsc::Receiver<IngestJob>,
    checks: EnforcementReceiver,
    enforcement: EnforcementQueue,
}

/// The assembled control plane.
pub struct Panel {
    pub db: PanelDatabase,
    pub registry: Arc<SessionRegistry>,
    pub correlator: Arc<RpcCorrelator>,
    pub orchestrator: Arc<Orchestrator>,
    pub aggregator: Arc<TrafficAggregator>,
    pub reconciler: Arc<Reconciler>,
    pub enforcer: Arc<LimitEnforcer>,
    ingest: IngestQueue,
    verifier: TokenVerifier,
    outbound_buffer: usize,
    traffic: TrafficConfig,
    shutdown_tx: watch::Sender<bool>,
    inputs: Option<Inputs>,
}

impl Panel {
    pub fn new(db: PanelDatabase, config: &Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(db.clone()));
        let correlator = Arc::new(RpcCorrelator::new(
            Arc::clone(&registry),
            Duration::from_secs(config.agent.rpc_timeout_secs),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            Arc::clone(&correlator) as Arc<dyn AgentRpc>,
        ));
        let (ingest, jobs) = IngestQueue::channel(config.traffic.queue_capacity);
        let (enforcement, checks) = EnforcementQueue::channel(ENFORCEMENT_QUEUE);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            registry,
            correlator,
            aggregator: Arc::new(TrafficAggregator::new()),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&orchestrator))),
            enforcer: Arc::new(LimitEnforcer::new(Arc::clone(&orchestrator))),
            orchestrator,
            ingest,
            verifier: TokenVerifier::new(config.server.jwt_secret.as_bytes()),
            outbound_buffer: config.agent.outbound_buffer,
            traffic: config.traffic.clone(),
            shutdown_tx,
            inputs: Some(Inputs {
                jobs,
                checks,
                enforcement,
            }),
            db,
        }
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn router(&self) -> Router {
        http::router(AppState {
            db: self.db.clone(),
            registry: Arc::clone(&self.registry),
            correlator: Arc::clone(&self.correlator),
            reconciler: Arc::clone(&self.reconciler),
            ingest: self.ingest.clone(),
            verifier: self.verifier.clone(),
            outbound_buffer: self.outbound_buffer,
            shutdown: self.shutdown_signal(),
        })
    }

    /// Spawn the ingestion worker, flush loop, limit enforcer, daily sweep,
    /// and retention task. Only the first call spawns anything.
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let Some(inputs) = self.inputs.take() else {
            return Vec::new();
        };
        let mut tasks = Vec::with_capacity(5);

        // The final flush waits for the worker to drain the queue.
        let (flush_stop, flush_signal) = watch::channel(false);
        let worker = IngestWorker::new(
            self.db.clone(),
            Arc::clone(&self.aggregator),
            inputs.enforcement,
            Arc::clone(&self.reconciler),
        );
        let shutdown = self.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            worker.run(inputs.jobs, shutdown).await;
            flush_stop.send_replace(true);
        }));

        let aggregator = Arc::clone(&self.aggregator);
        let db = self.db.clone();
        let every = Duration::from_secs(self.traffic.flush_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            aggregator.run_flush_loop(db, every, flush_signal).await;
        }));

        let enforcer = Arc::clone(&self.enforcer);
        let shutdown = self.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            enforcer.run(inputs.checks, shutdown).await;
        }));

        let sweep = DailySweep::new(Arc::clone(&self.orchestrator), Arc::clone(&self.enforcer));
        let hour = self.traffic.daily_sweep_hour;
        let shutdown = self.shutdown_signal();
        tasks.push(tokio::spawn(async move {
            sweep.run(hour, shutdown).await;
        }));

        tasks.push(tokio::spawn(run_retention_loop(
            self.db.clone(),
            self.traffic.retention_days,
            RETENTION_INTERVAL,
            self.shutdown_signal(),
        )));

        info!(tasks = tasks.len(), "Background tasks started");
        tasks
    }

    /// Signal shutdown, wait for background tasks, then drop pending calls
    /// and close every node session.
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        self.shutdown_tx.send_replace(true);
        for task in tasks {
            let _ = task.await;
        }
        let cancelled = self.correlator.cancel_all();
        self.registry.close_all().await;
        info!(cancelled, "Panel stopped");
    }
}
