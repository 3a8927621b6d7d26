//! One reconciliation pass for one component.

use tracing::{debug, instrument, warn};

use super::component::Component;
use super::error::MemberResult;
use super::scaler::{scale_step, Scaler};
use super::status::{is_upgrading, ClusterStatus, StatusReconciler, UpgradingPredicate, UpstreamPhase};
use super::upgrader::Upgrader;
use super::Recorder;
use crate::replica_set::ReplicaSet;
use crate::topology::Topology;

pub struct MemberManager {
    component: Box<dyn Component>,
    is_upgrading: UpgradingPredicate,
}

impl MemberManager {
    pub fn new(component: Box<dyn Component>) -> Self {
        Self {
            component,
            is_upgrading,
        }
    }

    pub fn with_predicate(mut self, predicate: UpgradingPredicate) -> Self {
        self.is_upgrading = predicate;
        self
    }

    pub fn component(&self) -> &dyn Component {
        self.component.as_ref()
    }

    /// Sync status, then scale or upgrade by one step.
    ///
    /// Returns the replica set to apply, or `None` when nothing changed.
    /// Status changes are kept in `status` even when an error is returned.
    #[instrument(skip_all, fields(cluster = %topology.identity, kind = %self.component.kind()))]
    pub async fn reconcile(
        &self,
        recorder: &Recorder,
        topology: &Topology,
        observed: &ReplicaSet,
        upstream: &dyn UpstreamPhase,
        status: &mut ClusterStatus,
    ) -> MemberResult<Option<ReplicaSet>> {
        let kind = self.component.kind();
        let Some(mut desired) = topology.desired_replica_set(kind, observed) else {
            debug!("component not declared in topology");
            return Ok(None);
        };

        let reconciler =
            StatusReconciler::new(self.component(), recorder).with_predicate(self.is_upgrading);
        // `status` keeps the previous members when the sync fails.
        if let Err(e) = reconciler
            .sync(&topology.identity, observed, desired.replicas, upstream, status)
            .await
        {
            warn!(error = %e, "failed to sync member status");
            return Err(e);
        }

        let updated = self.component.sync_labels(observed, status).await?;
        if updated > 0 {
            debug!(updated, "member labels synced");
        }

        if scale_step(observed, &desired)?.is_some() {
            Scaler::new(self.component(), recorder)
                .scale(status, observed, &mut desired)
                .await?;
            desired.template = observed.template.clone();
        } else {
            // Same live ordinals; only the scaler rewrites delete slots.
            desired.set_delete_slots(&observed.delete_slots()?);
            if !observed.runs_template(&desired.template) {
                Upgrader::new(self.component(), recorder)
                    .upgrade(topology, upstream, status, observed, &mut desired)
                    .await?;
            }
        }

        Ok((desired != *observed).then_some(desired))
    }
}
