//! One-ordinal-at-a-time scaling.

use tessera_events::MemberEvent;
use tessera_id::Ordinal;
use tracing::{info, instrument};

use super::component::{Component, LeaveProgress};
use super::error::{MemberError, MemberResult};
use super::status::ClusterStatus;
use super::Recorder;
use crate::replica_set::{format_delete_slots, ReplicaSet};

/// The single ordinal change a scale pass makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleStep {
    Out(Ordinal),
    In(Ordinal),
}

/// Next step from `observed` toward `desired`, or `None` when the live
/// ordinals already match. Additions go first, lowest ordinal first;
/// removals go highest ordinal first.
pub fn scale_step(observed: &ReplicaSet, desired: &ReplicaSet) -> MemberResult<Option<ScaleStep>> {
    let current = observed.live_ordinals()?;
    let target = desired.live_ordinals()?;

    if let Some(&ordinal) = target.difference(&current).next() {
        return Ok(Some(ScaleStep::Out(ordinal)));
    }
    Ok(current
        .difference(&target)
        .last()
        .map(|&ordinal| ScaleStep::In(ordinal)))
}

pub struct Scaler<'a> {
    component: &'a dyn Component,
    recorder: &'a Recorder,
}

impl<'a> Scaler<'a> {
    pub fn new(component: &'a dyn Component, recorder: &'a Recorder) -> Self {
        Self {
            component,
            recorder,
        }
    }

    /// Apply at most one [`ScaleStep`] to `desired`.
    ///
    /// `desired` comes back with the observed replica count and delete slots
    /// plus that one step, never more.
    #[instrument(skip_all, fields(cluster = %self.recorder.identity(), kind = %self.component.kind()))]
    pub async fn scale(
        &self,
        status: &ClusterStatus,
        observed: &ReplicaSet,
        desired: &mut ReplicaSet,
    ) -> MemberResult<()> {
        let Some(step) = scale_step(observed, desired)? else {
            return Ok(());
        };

        let mut slots = observed.delete_slots()?;
        desired.replicas = observed.replicas;
        desired.set_delete_slots(&slots);

        if !status.synced {
            return Err(MemberError::StatusNotSynced {
                kind: self.component.kind(),
            });
        }

        match step {
            ScaleStep::Out(ordinal) => {
                slots.remove(&ordinal);
                desired.replicas = observed.replicas + 1;
                desired.set_delete_slots(&slots);
                info!(
                    ordinal,
                    replicas = desired.replicas,
                    delete_slots = %format_delete_slots(&slots),
                    "scaling out"
                );
                self.recorder.record(MemberEvent::ScaledOut {
                    ordinal,
                    replicas: desired.replicas,
                });
            }
            ScaleStep::In(ordinal) => {
                let kind = self.component.kind();
                let pod = self.recorder.identity().pod_name(kind, ordinal);

                let progress = self
                    .component
                    .leave_cluster(&pod, status)
                    .await
                    .map_err(MemberError::query("leave cluster"))?;
                if let LeaveProgress::Pending(reason) = progress {
                    info!(ordinal, pod = %pod, reason = %reason, "waiting for member to leave");
                    self.recorder.record(MemberEvent::MemberLeaving {
                        member: pod.clone(),
                        ordinal,
                    });
                    return Err(MemberError::MemberLeaving {
                        kind,
                        member: pod,
                        reason,
                    });
                }

                slots.insert(ordinal);
                desired.replicas = observed.replicas.saturating_sub(1);
                desired.set_delete_slots(&slots);
                info!(
                    ordinal,
                    pod = %pod,
                    replicas = desired.replicas,
                    delete_slots = %format_delete_slots(&slots),
                    "scaling in"
                );
                self.recorder.record(MemberEvent::ScaledIn {
                    ordinal,
                    replicas: desired.replicas,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::replica_set::UpdateStrategy;

    fn set(replicas: u32, slots: &[Ordinal]) -> ReplicaSet {
        let mut rs = ReplicaSet {
            name: "basic-proxy".to_string(),
            replicas,
            template: serde_json::json!({}),
            update_strategy: UpdateStrategy::RollingUpdate { partition: None },
            annotations: BTreeMap::new(),
            status: None,
            pods: BTreeMap::new(),
        };
        rs.set_delete_slots(&slots.iter().copied().collect::<BTreeSet<_>>());
        rs
    }

    #[test]
    fn test_scale_step() {
        assert_eq!(scale_step(&set(3, &[]), &set(3, &[])).unwrap(), None);
        assert_eq!(
            scale_step(&set(3, &[]), &set(5, &[])).unwrap(),
            Some(ScaleStep::Out(3))
        );
        assert_eq!(
            scale_step(&set(3, &[]), &set(1, &[])).unwrap(),
            Some(ScaleStep::In(2))
        );
        // Swapping a slot adds before it removes.
        assert_eq!(
            scale_step(&set(3, &[]), &set(3, &[1])).unwrap(),
            Some(ScaleStep::Out(3))
        );
        assert_eq!(
            scale_step(&set(4, &[]), &set(3, &[1])).unwrap(),
            Some(ScaleStep::In(1))
        );
        // Reviving a deleted slot.
        assert_eq!(
            scale_step(&set(2, &[0]), &set(3, &[])).unwrap(),
            Some(ScaleStep::Out(0))
        );
    }
}
