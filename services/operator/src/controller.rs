//! Reconciles every component of one cluster, in dependency order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tessera_events::EventSink;
use tessera_id::{ComponentKind, PassId};
use tessera_reconcile::ConvergenceStatus;
use tracing::{debug, info, instrument};

use crate::driver::ReplicaSetDriver;
use crate::health_client::ClusterHealthClient;
use crate::member::{component_for, ClusterStatus, MemberError, MemberManager, MemberResult, Phase, Recorder};
use crate::topology::Topology;

/// Outcome of one pass over a cluster.
#[derive(Debug, Default)]
pub struct PassReport {
    pub components: BTreeMap<ComponentKind, ConvergenceStatus>,
}

impl PassReport {
    pub fn converged(&self) -> bool {
        self.components.values().all(ConvergenceStatus::is_converged)
    }
}

pub struct ClusterController {
    driver: Arc<dyn ReplicaSetDriver>,
    sink: Arc<dyn EventSink>,
    managers: BTreeMap<ComponentKind, MemberManager>,
}

impl ClusterController {
    pub fn new(
        driver: Arc<dyn ReplicaSetDriver>,
        client: Arc<dyn ClusterHealthClient>,
        sink: Arc<dyn EventSink>,
        query_timeout: Duration,
    ) -> Self {
        let managers = ComponentKind::ALL
            .into_iter()
            .map(|kind| {
                let component = component_for(kind, client.clone(), query_timeout);
                (kind, MemberManager::new(component))
            })
            .collect();
        Self::with_managers(driver, sink, managers)
    }

    pub fn with_managers(
        driver: Arc<dyn ReplicaSetDriver>,
        sink: Arc<dyn EventSink>,
        managers: BTreeMap<ComponentKind, MemberManager>,
    ) -> Self {
        Self {
            driver,
            sink,
            managers,
        }
    }

    /// Run one pass over every declared component.
    ///
    /// The first error stops the pass. `statuses` keeps whatever was synced
    /// before the error so it can still be persisted.
    #[instrument(skip_all, fields(cluster = %topology.identity, pass_id = %pass_id))]
    pub async fn reconcile(
        &self,
        pass_id: PassId,
        topology: &Topology,
        statuses: &mut BTreeMap<ComponentKind, ClusterStatus>,
    ) -> MemberResult<PassReport> {
        let identity = &topology.identity;
        let mut report = PassReport::default();

        for (kind, manager) in &self.managers {
            if !topology.components.contains_key(kind) {
                continue;
            }

            let Some(observed) = self.driver.observe(identity, *kind).await? else {
                debug!(kind = %kind, "replica set not found");
                report.components.insert(*kind, ConvergenceStatus::Unknown);
                continue;
            };

            let recorder = Recorder::new(self.sink.clone(), pass_id, identity.clone(), *kind);
            let mut status = statuses.remove(kind).unwrap_or_default();
            let result = manager
                .reconcile(&recorder, topology, &observed, &*statuses, &mut status)
                .await;
            let (phase, synced) = (status.phase, status.synced);
            statuses.insert(*kind, status);

            let convergence = match result {
                Ok(Some(desired)) => {
                    self.driver
                        .apply(identity, *kind, &desired)
                        .await
                        .map_err(MemberError::from)?;
                    ConvergenceStatus::Converging
                }
                Ok(None) if synced && phase == Phase::Normal => ConvergenceStatus::Converged,
                Ok(None) => ConvergenceStatus::Converging,
                Err(e) => return Err(e),
            };
            info!(kind = %kind, ?convergence, ?phase, "component reconciled");
            report.components.insert(*kind, convergence);
        }

        Ok(report)
    }
}
