//! Member status and its reconciliation.
//!
//! [`StatusReconciler::sync`] folds the replica set and the cluster's own
//! view of its members into a [`ClusterStatus`]. The orchestrators only read
//! that status; they refuse to act when the last sync failed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_events::MemberEvent;
use tessera_id::{ClusterIdentity, ComponentKind, MemberAddress, Ordinal};
use tracing::{debug, info, instrument, warn};

use super::component::{Component, InventoryEntry};
use super::error::{MemberError, MemberResult};
use super::Recorder;
use crate::replica_set::{ReplicaSet, ReplicaSetStatus};

/// Store label naming the engine a store runs.
pub const ENGINE_LABEL: &str = "engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Normal,
    Scaling,
    Upgrading,
}

/// Lifecycle state reported by the cluster for a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemberState {
    Up,
    Down,
    Offline,
    Tombstone,
    Disconnected,
    Unknown(String),
}

impl From<&str> for MemberState {
    fn from(s: &str) -> Self {
        match s {
            "Up" => Self::Up,
            "Down" => Self::Down,
            "Offline" => Self::Offline,
            "Tombstone" => Self::Tombstone,
            "Disconnected" => Self::Disconnected,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl From<String> for MemberState {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<MemberState> for String {
    fn from(state: MemberState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => f.write_str("Up"),
            Self::Down => f.write_str("Down"),
            Self::Offline => f.write_str("Offline"),
            Self::Tombstone => f.write_str("Tombstone"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Unknown(name) => f.write_str(name),
        }
    }
}

/// Storage-tier details of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDetails {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub leader_count: u32,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Name the cluster knows the member by.
    pub name: String,
    pub pod_name: String,
    pub ordinal: Ordinal,
    #[serde(default)]
    pub address: Option<String>,
    pub health: bool,
    #[serde(default)]
    pub leader: bool,
    pub state: MemberState,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub store: Option<StoreDetails>,
}

impl Member {
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.pod_name == name
    }
}

/// Reconciled status of one component of one cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub synced: bool,
    pub phase: Phase,
    #[serde(default)]
    pub leader: Option<String>,
    /// Local members keyed by pod name.
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
    /// Members of the same component in other clusters, keyed by qualified name.
    #[serde(default)]
    pub peer_members: BTreeMap<String, Member>,
    #[serde(default)]
    pub tombstones: BTreeMap<String, Member>,
    #[serde(default)]
    pub replica_set: Option<ReplicaSetStatus>,
    /// Set while the cluster evicts leaders ahead of a restart.
    #[serde(default)]
    pub leader_evicting: bool,
}

impl ClusterStatus {
    pub fn is_leader(&self, name: &str) -> bool {
        self.leader.as_deref() == Some(name)
    }

    /// Local member running on `pod_name`, if healthy.
    pub fn healthy_member(&self, pod_name: &str) -> Option<&Member> {
        self.members.get(pod_name).filter(|m| m.health)
    }
}

/// Read access to the phases of components reconciled earlier in the pass.
pub trait UpstreamPhase: Send + Sync {
    fn phase(&self, kind: ComponentKind) -> Option<Phase>;
}

impl UpstreamPhase for BTreeMap<ComponentKind, ClusterStatus> {
    fn phase(&self, kind: ComponentKind) -> Option<Phase> {
        self.get(&kind).map(|status| status.phase)
    }
}

/// Decides whether a replica set is rolling out a new revision.
pub type UpgradingPredicate = fn(&ReplicaSet) -> MemberResult<bool>;

/// Upgrading when the current and update revisions differ, or when any pod
/// carries a revision other than the update revision. Pods without the
/// revision label are not counted.
pub fn is_upgrading(set: &ReplicaSet) -> MemberResult<bool> {
    let status = set
        .status
        .as_ref()
        .ok_or_else(|| MemberError::MissingReplicaSetStatus {
            name: set.name.clone(),
        })?;

    if status.current_revision != status.update_revision {
        return Ok(true);
    }

    Ok(set.pods.values().any(|pod| {
        pod.revision
            .as_deref()
            .is_some_and(|revision| revision != status.update_revision)
    }))
}

pub struct StatusReconciler<'a> {
    component: &'a dyn Component,
    recorder: &'a Recorder,
    is_upgrading: UpgradingPredicate,
}

impl<'a> StatusReconciler<'a> {
    pub fn new(component: &'a dyn Component, recorder: &'a Recorder) -> Self {
        Self {
            component,
            recorder,
            is_upgrading,
        }
    }

    pub fn with_predicate(mut self, predicate: UpgradingPredicate) -> Self {
        self.is_upgrading = predicate;
        self
    }

    /// Refresh `status` from `observed` and the cluster.
    ///
    /// On failure `synced` is cleared and the previous member maps are kept.
    #[instrument(skip_all, fields(cluster = %identity, kind = %self.component.kind()))]
    pub async fn sync(
        &self,
        identity: &ClusterIdentity,
        observed: &ReplicaSet,
        desired_replicas: u32,
        upstream: &dyn UpstreamPhase,
        status: &mut ClusterStatus,
    ) -> MemberResult<()> {
        let kind = self.component.kind();
        status.replica_set = observed.status.clone();

        let upgrading = match (self.is_upgrading)(observed) {
            Ok(upgrading) => upgrading,
            Err(e) => {
                status.synced = false;
                return Err(e);
            }
        };

        let upstream_upgrading = kind
            .upstream()
            .iter()
            .any(|u| upstream.phase(*u) == Some(Phase::Upgrading));

        status.phase = if upgrading && !upstream_upgrading && !status.leader_evicting {
            Phase::Upgrading
        } else if desired_replicas != observed.replicas {
            Phase::Scaling
        } else {
            Phase::Normal
        };

        let inventory = match self.component.inventory(identity, observed).await {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!(error = %e, "failed to query member inventory");
                status.synced = false;
                return Err(MemberError::query("inventory")(e));
            }
        };

        let now = Utc::now();
        let mut members = BTreeMap::new();
        let mut peer_members = BTreeMap::new();
        let mut tombstones = BTreeMap::new();

        for entry in &inventory.entries {
            let Some((key, local, member)) = self.resolve(identity, entry, &inventory.leader, now)
            else {
                continue;
            };
            let previous = if local {
                status.members.get(&key)
            } else {
                status.peer_members.get(&key)
            };
            let member = self.carry_transition(previous, member);
            if local {
                members.insert(key, member);
            } else {
                peer_members.insert(key, member);
            }
        }

        for entry in &inventory.tombstones {
            let Some((key, _, member)) = self.resolve(identity, entry, &None, now) else {
                continue;
            };
            let member = self.carry_transition(status.tombstones.get(&key), member);
            tombstones.insert(key, member);
        }

        debug!(
            members = members.len(),
            peer_members = peer_members.len(),
            tombstones = tombstones.len(),
            phase = ?status.phase,
            "member status synced"
        );

        status.members = members;
        status.peer_members = peer_members;
        status.tombstones = tombstones;
        status.leader = inventory.leader;
        status.synced = true;
        Ok(())
    }

    /// Turn an inventory entry into a member keyed for its collection.
    /// Returns `None` for entries that do not belong to this component.
    fn resolve(
        &self,
        identity: &ClusterIdentity,
        entry: &InventoryEntry,
        leader: &Option<String>,
        now: DateTime<Utc>,
    ) -> Option<(String, bool, Member)> {
        let kind = self.component.kind();
        let (Some(descriptor), Some(entry_status)) = (&entry.descriptor, &entry.status) else {
            return None;
        };

        if descriptor
            .labels
            .get(ENGINE_LABEL)
            .is_some_and(|engine| engine != kind.as_str())
        {
            return None;
        }

        let source = descriptor.address.as_deref().unwrap_or(&descriptor.name);
        let address = match MemberAddress::parse(source) {
            Ok(address) if address.kind == kind => address,
            Ok(_) => return None,
            Err(e) => {
                debug!(entry = %source, error = %e, "skipping entry that is not a member");
                return None;
            }
        };

        let local = identity.owns(&address);
        let key = if local {
            address.pod_name.clone()
        } else {
            address.qualified_name()
        };

        let member = Member {
            leader: leader
                .as_deref()
                .is_some_and(|l| l == descriptor.name || l == address.pod_name),
            name: descriptor.name.clone(),
            pod_name: address.pod_name,
            ordinal: address.ordinal,
            address: descriptor.address.clone(),
            health: entry_status.health,
            state: MemberState::from(entry_status.state.as_str()),
            last_transition_time: now,
            store: descriptor.store_id.map(|id| StoreDetails {
                id,
                address: descriptor.address.clone().unwrap_or_default(),
                labels: descriptor.labels.clone(),
                leader_count: entry_status.leader_count,
                last_heartbeat: entry_status.last_heartbeat,
            }),
        };
        Some((key, local, member))
    }

    /// Keep the previous transition time while the state is unchanged.
    fn carry_transition(&self, previous: Option<&Member>, mut member: Member) -> Member {
        if let Some(previous) = previous {
            if previous.state == member.state {
                member.last_transition_time = previous.last_transition_time;
            } else {
                info!(
                    member = %member.name,
                    from = %previous.state,
                    to = %member.state,
                    "member state changed"
                );
                self.recorder.record(MemberEvent::MemberStateChanged {
                    member: member.name.clone(),
                    from: Some(previous.state.to_string()),
                    to: member.state.to_string(),
                });
            }
        }
        member
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_set::{Pod, UpdateStrategy};
    use rstest::rstest;

    fn set(current: &str, update: &str, pod_revisions: &[Option<&str>]) -> ReplicaSet {
        ReplicaSet {
            name: "basic-storage".to_string(),
            replicas: pod_revisions.len() as u32,
            template: serde_json::json!({}),
            update_strategy: UpdateStrategy::RollingUpdate { partition: Some(0) },
            annotations: BTreeMap::new(),
            status: Some(ReplicaSetStatus {
                current_revision: current.to_string(),
                update_revision: update.to_string(),
                replicas: pod_revisions.len() as u32,
                ready_replicas: pod_revisions.len() as u32,
            }),
            pods: pod_revisions
                .iter()
                .enumerate()
                .map(|(i, rev)| {
                    (
                        i as Ordinal,
                        Pod {
                            name: format!("basic-storage-{i}"),
                            revision: rev.map(str::to_string),
                            ready: true,
                            ready_since: None,
                            node_labels: None,
                        },
                    )
                })
                .collect(),
        }
    }

    #[rstest]
    #[case::revisions_differ(set("v1", "v2", &[Some("v1")]), true)]
    #[case::pod_on_old_revision(set("v2", "v2", &[Some("v2"), Some("v1")]), true)]
    #[case::missing_label_ignored(set("v2", "v2", &[Some("v2"), None]), false)]
    #[case::settled(set("v2", "v2", &[Some("v2"), Some("v2")]), false)]
    #[case::no_pods(set("v2", "v2", &[]), false)]
    fn test_is_upgrading(#[case] set: ReplicaSet, #[case] expected: bool) {
        assert_eq!(is_upgrading(&set).unwrap(), expected);
    }

    #[test]
    fn test_is_upgrading_requires_status() {
        let mut rs = set("v1", "v1", &[]);
        rs.status = None;
        assert!(matches!(
            is_upgrading(&rs),
            Err(MemberError::MissingReplicaSetStatus { .. })
        ));
    }

    #[rstest]
    #[case("Up", MemberState::Up)]
    #[case("Tombstone", MemberState::Tombstone)]
    #[case("Disconnected", MemberState::Disconnected)]
    #[case("Serving", MemberState::Unknown("Serving".to_string()))]
    fn test_member_state_names(#[case] name: &str, #[case] expected: MemberState) {
        let state = MemberState::from(name);
        assert_eq!(state, expected);
        assert_eq!(state.to_string(), name);
    }

    #[test]
    fn test_member_state_serde() {
        let json = serde_json::to_string(&MemberState::Offline).unwrap();
        assert_eq!(json, "\"Offline\"");
        let back: MemberState = serde_json::from_str("\"Preparing\"").unwrap();
        assert_eq!(back, MemberState::Unknown("Preparing".to_string()));
    }

    #[test]
    fn test_upstream_phase_lookup() {
        let mut statuses = BTreeMap::new();
        statuses.insert(
            ComponentKind::Placement,
            ClusterStatus {
                phase: Phase::Upgrading,
                ..Default::default()
            },
        );
        assert_eq!(statuses.phase(ComponentKind::Placement), Some(Phase::Upgrading));
        assert_eq!(statuses.phase(ComponentKind::Storage), None);
    }
}
