//! Reconciliation background worker.
//!
//! Runs a pass over every declared cluster on a periodic interval. Clusters
//! whose last pass hit a retryable error are retried after a backoff;
//! errors that keep recurring past the retry budget are escalated.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_id::PassId;
use tessera_reconcile::{Backoff, Classify, RetryTracker, Severity};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, instrument};

use crate::controller::ClusterController;
use crate::driver::ClusterStore;
use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: tessera_reconcile::DEFAULT_RECONCILE_INTERVAL,
            max_retries: tessera_reconcile::DEFAULT_MAX_RETRIES,
            retry_window: tessera_reconcile::DEFAULT_RETRY_WINDOW,
            backoff: Backoff::default(),
        }
    }
}

/// Statistics from one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub clusters_reconciled: usize,
    pub clusters_converged: usize,
    pub clusters_requeued: usize,
    pub clusters_failed: usize,
    pub clusters_backing_off: usize,
}

pub struct ReconcileWorker {
    controller: Arc<ClusterController>,
    store: Arc<dyn ClusterStore>,
    config: WorkerConfig,
    retries: Mutex<RetryTracker>,
    next_attempt: Mutex<BTreeMap<String, Instant>>,
}

impl ReconcileWorker {
    pub fn new(
        controller: Arc<ClusterController>,
        store: Arc<dyn ClusterStore>,
        config: WorkerConfig,
    ) -> Self {
        let retries = RetryTracker::new(config.max_retries, config.retry_window);
        Self {
            controller,
            store,
            config,
            retries: Mutex::new(retries),
            next_attempt: Mutex::new(BTreeMap::new()),
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile every declared cluster once.
    pub async fn tick(&self) -> anyhow::Result<TickStats> {
        let mut stats = TickStats::default();

        for topology in self.store.topologies().await? {
            let key = topology.identity.to_string();
            if self.backing_off(&key) {
                stats.clusters_backing_off += 1;
                continue;
            }

            stats.clusters_reconciled += 1;
            match self.reconcile_cluster(&topology).await? {
                Outcome::Converged => stats.clusters_converged += 1,
                Outcome::Converging => {}
                Outcome::Requeued => stats.clusters_requeued += 1,
                Outcome::Failed => stats.clusters_failed += 1,
            }
        }

        if stats != TickStats::default() {
            info!(
                reconciled = stats.clusters_reconciled,
                converged = stats.clusters_converged,
                requeued = stats.clusters_requeued,
                failed = stats.clusters_failed,
                backing_off = stats.clusters_backing_off,
                "Reconcile tick complete"
            );
        }
        Ok(stats)
    }

    async fn reconcile_cluster(&self, topology: &Topology) -> anyhow::Result<Outcome> {
        let identity = &topology.identity;
        let key = identity.to_string();
        let pass_id = PassId::new();

        let mut statuses = self.store.load_status(identity).await?;
        let result = self
            .controller
            .reconcile(pass_id, topology, &mut statuses)
            .await;
        self.store.save_status(identity, &statuses).await?;

        let outcome = match result {
            Ok(report) => {
                self.clear_failures(&key);
                if report.converged() {
                    Outcome::Converged
                } else {
                    Outcome::Converging
                }
            }
            Err(e) => {
                let failures = self.record_failure(&key);
                match e.severity() {
                    Severity::Retryable if self.exhausted(&key) => {
                        error!(cluster = %key, %pass_id, failures, error = %e, "Reconcile keeps failing");
                        Outcome::Requeued
                    }
                    Severity::Retryable => {
                        info!(cluster = %key, %pass_id, failures, reason = %e, "Requeueing cluster");
                        Outcome::Requeued
                    }
                    Severity::Fatal => {
                        error!(cluster = %key, %pass_id, error = %e, "Reconcile failed");
                        Outcome::Failed
                    }
                }
            }
        };
        Ok(outcome)
    }

    fn backing_off(&self, key: &str) -> bool {
        match self.next_attempt.lock() {
            Ok(next) => next.get(key).is_some_and(|at| Instant::now() < *at),
            Err(_) => false,
        }
    }

    fn record_failure(&self, key: &str) -> u32 {
        let failures = match self.retries.lock() {
            Ok(mut retries) => retries.record_failure(key),
            Err(_) => 1,
        };
        let delay = self.config.backoff.delay(failures);
        if let Ok(mut next) = self.next_attempt.lock() {
            next.insert(key.to_string(), Instant::now() + delay);
        }
        failures
    }

    fn exhausted(&self, key: &str) -> bool {
        self.retries
            .lock()
            .map(|retries| retries.is_exhausted(key))
            .unwrap_or(false)
    }

    fn clear_failures(&self, key: &str) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.clear(key);
            retries.prune();
        }
        let recovered = self
            .next_attempt
            .lock()
            .map(|mut next| next.remove(key).is_some())
            .unwrap_or(false);
        if recovered {
            info!(cluster = %key, "Cluster recovered after retries");
        }
    }
}

enum Outcome {
    Converged,
    Converging,
    Requeued,
    Failed,
}
