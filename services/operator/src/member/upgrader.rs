//! Rolling upgrades gated on member health and leadership.
//!
//! The replica set restarts every pod at or above the partition onto the
//! update revision. Walking live ordinals from the top, every pod that
//! already runs the update revision must be available and healthy before
//! the partition may drop to the next stale ordinal. A stale ordinal that
//! leads the cluster first hands leadership to someone else.

use std::collections::BTreeSet;

use chrono::Utc;
use tessera_events::MemberEvent;
use tessera_id::{ClusterIdentity, ComponentKind, Ordinal};
use tracing::{debug, error, info, instrument, warn};

use super::component::Component;
use super::error::{MemberError, MemberResult};
use super::status::{ClusterStatus, Phase, UpstreamPhase};
use super::Recorder;
use crate::replica_set::{Pod, ReplicaSet, UpdateStrategy};
use crate::topology::Topology;

pub struct Upgrader<'a> {
    component: &'a dyn Component,
    recorder: &'a Recorder,
}

impl<'a> Upgrader<'a> {
    pub fn new(component: &'a dyn Component, recorder: &'a Recorder) -> Self {
        Self {
            component,
            recorder,
        }
    }

    fn kind(&self) -> ComponentKind {
        self.component.kind()
    }

    fn identity(&self) -> &ClusterIdentity {
        self.recorder.identity()
    }

    /// Advance the rolling upgrade of `observed` toward `desired.template`.
    ///
    /// Only the partition of `desired` is written, or its update strategy
    /// when a manual override is detected. Nothing moves while this component
    /// is scaling or a component it depends on is upgrading.
    #[instrument(skip_all, fields(cluster = %self.identity(), kind = %self.kind()))]
    pub async fn upgrade(
        &self,
        topology: &Topology,
        upstream: &dyn UpstreamPhase,
        status: &mut ClusterStatus,
        observed: &ReplicaSet,
        desired: &mut ReplicaSet,
    ) -> MemberResult<()> {
        if !status.synced {
            return Err(MemberError::StatusNotSynced { kind: self.kind() });
        }

        if status.phase == Phase::Scaling {
            info!("scaling in progress, deferring upgrade");
            desired.template = observed.template.clone();
            return Ok(());
        }

        if let Some(kind) = self
            .kind()
            .upstream()
            .iter()
            .find(|u| upstream.phase(**u) == Some(Phase::Upgrading))
        {
            info!(upstream = %kind, "upstream component is upgrading, deferring upgrade");
            desired.template = observed.template.clone();
            return Ok(());
        }

        status.phase = Phase::Upgrading;
        if observed.runs_template(&desired.template) {
            return Ok(());
        }

        let partition = match &observed.update_strategy {
            UpdateStrategy::RollingUpdate {
                partition: Some(partition),
            } => *partition,
            strategy => {
                warn!(
                    replica_set = %observed.name,
                    strategy = strategy.name(),
                    "update strategy was modified manually, leaving the rollout to the replica set"
                );
                desired.update_strategy = strategy.clone();
                self.recorder.record(MemberEvent::ManualOverrideDetected {
                    strategy: strategy.name().to_string(),
                });
                return Ok(());
            }
        };

        let live = observed.live_ordinals()?;
        if !tessera_reconcile::templates_equal(&observed.template, &desired.template) {
            // New template: hold every ordinal back until the walk reaches it.
            let top = live.last().map_or(0, |ordinal| ordinal + 1);
            info!(partition = top, "starting rollout of a new template");
            desired.set_partition(top);
            return Ok(());
        }

        let min_ready_seconds = topology.min_ready_seconds();
        desired.set_partition(partition);

        let update_revision = observed
            .status
            .as_ref()
            .map(|s| s.update_revision.as_str())
            .ok_or_else(|| MemberError::MissingReplicaSetStatus {
                name: observed.name.clone(),
            })?;

        for &ordinal in live.iter().rev() {
            let pod_name = self.identity().pod_name(self.kind(), ordinal);
            let pod = observed
                .pods
                .get(&ordinal)
                .ok_or_else(|| MemberError::PodNotFound {
                    pod: pod_name.clone(),
                })?;
            let revision = pod
                .revision
                .as_deref()
                .ok_or_else(|| MemberError::MissingRevision {
                    pod: pod_name.clone(),
                })?;

            if revision == update_revision {
                self.check_upgraded(status, ordinal, &pod_name, pod, min_ready_seconds)
                    .await?;
                continue;
            }

            return self
                .upgrade_ordinal(topology, status, &live, desired, ordinal, partition)
                .await;
        }

        debug!(partition, "all live ordinals run the update revision");
        Ok(())
    }

    /// An ordinal already on the update revision must be available and its
    /// member healthy and ready before anything below it is touched.
    async fn check_upgraded(
        &self,
        status: &ClusterStatus,
        ordinal: Ordinal,
        pod_name: &str,
        pod: &Pod,
        min_ready_seconds: u32,
    ) -> MemberResult<()> {
        if !pod.is_available(min_ready_seconds, Utc::now()) {
            if !pod.ready {
                return Err(MemberError::PodNotReady {
                    pod: pod_name.to_string(),
                });
            }
            return Err(MemberError::PodUnavailable {
                pod: pod_name.to_string(),
                min_ready_seconds,
            });
        }

        let member = status
            .healthy_member(pod_name)
            .ok_or_else(|| MemberError::MemberUnhealthy {
                kind: self.kind(),
                member: pod_name.to_string(),
                ordinal,
            })?;

        match self.component.is_member_ready(member).await {
            Ok(true) => {
                debug!(ordinal, pod = %pod_name, "upgraded member is ready");
                Ok(())
            }
            Ok(false) => Err(MemberError::MemberNotReady {
                kind: self.kind(),
                member: member.name.clone(),
                reason: "member reports not ready".to_string(),
            }),
            Err(e) => Err(MemberError::MemberNotReady {
                kind: self.kind(),
                member: member.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn upgrade_ordinal(
        &self,
        topology: &Topology,
        status: &ClusterStatus,
        live: &BTreeSet<Ordinal>,
        desired: &mut ReplicaSet,
        ordinal: Ordinal,
        partition: u32,
    ) -> MemberResult<()> {
        let pod_name = self.identity().pod_name(self.kind(), ordinal);
        let member_name = status
            .members
            .get(&pod_name)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| pod_name.clone());

        if topology.peer_stability_check() {
            let unstable = self
                .component
                .unstable_peer(&member_name)
                .await
                .map_err(MemberError::query("peer health"))?;
            if let Some(reason) = unstable {
                return Err(MemberError::PeersUnstable {
                    kind: self.kind(),
                    reason,
                });
            }
        }

        if status.is_leader(&member_name) || status.is_leader(&pod_name) {
            match self.transfer_target(status, live, ordinal) {
                Some(target) => {
                    if let Err(e) = self.component.transfer_leadership(&target).await {
                        error!(from = %member_name, to = %target, error = %e, "failed to transfer leadership");
                        return Err(MemberError::query("transfer leader")(e));
                    }
                    info!(from = %member_name, to = %target, "transferring leadership before restart");
                    self.recorder.record(MemberEvent::LeaderTransferRequested {
                        from: member_name.clone(),
                        to: target.clone(),
                    });
                    return Err(MemberError::LeaderTransferring {
                        kind: self.kind(),
                        from: member_name,
                        to: target,
                    });
                }
                None => {
                    warn!(
                        member = %member_name,
                        "no healthy member to take over leadership, restarting the leader"
                    );
                }
            }
        }

        let next = partition.min(ordinal);
        desired.set_partition(next);
        if next < partition {
            info!(ordinal, pod = %pod_name, from = partition, partition = next, "advancing partition");
            self.recorder.record(MemberEvent::PartitionAdvanced {
                from: partition,
                to: next,
            });
        }
        Ok(())
    }

    /// Pick who takes leadership from `candidate`: the highest healthy live
    /// ordinal above it (already upgraded), then the lowest healthy one below
    /// it, then any healthy member of another cluster.
    fn transfer_target(
        &self,
        status: &ClusterStatus,
        live: &BTreeSet<Ordinal>,
        candidate: Ordinal,
    ) -> Option<String> {
        let healthy = |ordinal: &Ordinal| {
            let pod = self.identity().pod_name(self.kind(), *ordinal);
            status.healthy_member(&pod).map(|m| m.name.clone())
        };

        let above = candidate
            .checked_add(1)
            .and_then(|start| live.range(start..).rev().find_map(healthy));
        if above.is_some() {
            return above;
        }

        if let Some(below) = live.range(..candidate).find_map(healthy) {
            return Some(below);
        }

        let candidate_pod = self.identity().pod_name(self.kind(), candidate);
        status
            .peer_members
            .values()
            .find(|m| m.health && !m.answers_to(&candidate_pod))
            .map(|m| m.name.clone())
    }
}
