//! Replica sets, statuses and cluster responses for a cluster named
//! `default/basic`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tessera_events::EventSink;
use tessera_id::{ClusterIdentity, ComponentKind, Ordinal, PassId};
use tessera_operator::health_client::{MemberHealth, StoreInfo, StoreMeta, StoreStats};
use tessera_operator::member::status::StoreDetails;
use tessera_operator::member::{ClusterStatus, Member, MemberState, Phase, Recorder};
use tessera_operator::replica_set::{Pod, ReplicaSet, ReplicaSetStatus, UpdateStrategy};
use tessera_operator::topology::{ComponentSpec, Topology};
use tessera_reconcile::SpecHash;

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "basic";
pub const STORE_PORT: u16 = 20160;

pub fn identity() -> ClusterIdentity {
    ClusterIdentity::new(NAMESPACE, CLUSTER)
}

pub fn template(version: &str) -> Value {
    json!({
        "containers": [{ "name": "engine", "image": format!("tessera/engine:{version}") }]
    })
}

/// Revision name the file driver gives `template(version)`.
pub fn revision(kind: ComponentKind, version: &str) -> String {
    SpecHash::from_json(&template(version)).revision_name(&identity().set_name(kind))
}

pub fn pod_name(kind: ComponentKind, ordinal: Ordinal) -> String {
    identity().pod_name(kind, ordinal)
}

pub fn client_url(kind: ComponentKind, ordinal: Ordinal) -> String {
    format!("http://{}:2379", identity().member_host(kind, ordinal))
}

pub fn store_address(ordinal: Ordinal) -> String {
    format!(
        "{}:{STORE_PORT}",
        identity().member_host(ComponentKind::Storage, ordinal)
    )
}

pub fn recorder(sink: Arc<dyn EventSink>, kind: ComponentKind) -> Recorder {
    Recorder::new(sink, PassId::new(), identity(), kind)
}

pub fn topology(kind: ComponentKind, replicas: u32, version: &str) -> Topology {
    Topology::new(identity()).with_component(
        kind,
        ComponentSpec {
            replicas,
            template: template(version),
            delete_slots: BTreeSet::new(),
        },
    )
}

/// Builds an observed replica set. Every live ordinal gets a ready pod on
/// the current revision unless told otherwise.
pub struct ReplicaSetBuilder {
    kind: ComponentKind,
    replicas: u32,
    delete_slots: BTreeSet<Ordinal>,
    template: Value,
    strategy: UpdateStrategy,
    current_revision: String,
    update_revision: String,
    revisions: BTreeMap<Ordinal, Option<String>>,
    unready: BTreeSet<Ordinal>,
    missing: BTreeSet<Ordinal>,
    ready_for: BTreeMap<Ordinal, Duration>,
    node_labels: BTreeMap<Ordinal, BTreeMap<String, String>>,
    with_status: bool,
}

impl ReplicaSetBuilder {
    pub fn new(kind: ComponentKind, replicas: u32) -> Self {
        Self {
            kind,
            replicas,
            delete_slots: BTreeSet::new(),
            template: template("v1"),
            strategy: UpdateStrategy::RollingUpdate {
                partition: Some(replicas),
            },
            current_revision: "v1".to_string(),
            update_revision: "v1".to_string(),
            revisions: BTreeMap::new(),
            unready: BTreeSet::new(),
            missing: BTreeSet::new(),
            ready_for: BTreeMap::new(),
            node_labels: BTreeMap::new(),
            with_status: true,
        }
    }

    pub fn delete_slots(mut self, slots: &[Ordinal]) -> Self {
        self.delete_slots = slots.iter().copied().collect();
        self
    }

    pub fn template(mut self, template: Value) -> Self {
        self.template = template;
        self
    }

    /// A rollout from `current` to `update` that has been applied but not
    /// finished. Pods stay on `current` unless moved with [`Self::pod_revision`].
    pub fn rolling(mut self, current: &str, update: &str) -> Self {
        self.current_revision = current.to_string();
        self.update_revision = update.to_string();
        self
    }

    pub fn strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.strategy = UpdateStrategy::RollingUpdate {
            partition: Some(partition),
        };
        self
    }

    pub fn pod_revision(mut self, ordinal: Ordinal, revision: &str) -> Self {
        self.revisions.insert(ordinal, Some(revision.to_string()));
        self
    }

    pub fn unlabeled(mut self, ordinal: Ordinal) -> Self {
        self.revisions.insert(ordinal, None);
        self
    }

    pub fn unready(mut self, ordinal: Ordinal) -> Self {
        self.unready.insert(ordinal);
        self
    }

    pub fn missing_pod(mut self, ordinal: Ordinal) -> Self {
        self.missing.insert(ordinal);
        self
    }

    pub fn ready_for(mut self, ordinal: Ordinal, elapsed: Duration) -> Self {
        self.ready_for.insert(ordinal, elapsed);
        self
    }

    pub fn node_labels(mut self, ordinal: Ordinal, labels: &[(&str, &str)]) -> Self {
        self.node_labels.insert(
            ordinal,
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn without_status(mut self) -> Self {
        self.with_status = false;
        self
    }

    pub fn build(self) -> ReplicaSet {
        let identity = identity();
        let mut set = ReplicaSet {
            name: identity.set_name(self.kind),
            replicas: self.replicas,
            template: self.template,
            update_strategy: self.strategy,
            annotations: BTreeMap::new(),
            status: self.with_status.then(|| ReplicaSetStatus {
                current_revision: self.current_revision.clone(),
                update_revision: self.update_revision.clone(),
                replicas: self.replicas,
                ready_replicas: self.replicas.saturating_sub(self.unready.len() as u32),
            }),
            pods: BTreeMap::new(),
        };
        set.set_delete_slots(&self.delete_slots);

        let now = Utc::now();
        let live = tessera_operator::replica_set::live_ordinals(self.replicas, &self.delete_slots);
        for ordinal in live.into_iter().filter(|o| !self.missing.contains(o)) {
            let ready = !self.unready.contains(&ordinal);
            let elapsed = self
                .ready_for
                .get(&ordinal)
                .copied()
                .unwrap_or_else(|| Duration::hours(1));
            set.pods.insert(
                ordinal,
                Pod {
                    name: identity.pod_name(self.kind, ordinal),
                    revision: self
                        .revisions
                        .get(&ordinal)
                        .cloned()
                        .unwrap_or_else(|| Some(self.current_revision.clone())),
                    ready,
                    ready_since: ready.then(|| now - elapsed),
                    node_labels: self.node_labels.get(&ordinal).cloned(),
                },
            );
        }
        set
    }
}

pub fn member(kind: ComponentKind, ordinal: Ordinal, health: bool) -> Member {
    let pod = pod_name(kind, ordinal);
    let (name, address) = match kind {
        ComponentKind::Storage => (store_address(ordinal), Some(store_address(ordinal))),
        _ => (pod.clone(), Some(client_url(kind, ordinal))),
    };
    Member {
        name,
        pod_name: pod,
        ordinal,
        address,
        health,
        leader: false,
        state: if health {
            MemberState::Up
        } else {
            MemberState::Down
        },
        last_transition_time: Utc::now() - Duration::hours(1),
        store: None,
    }
}

/// Builds a synced [`ClusterStatus`] in the `Normal` phase.
pub struct StatusBuilder {
    kind: ComponentKind,
    status: ClusterStatus,
}

impl StatusBuilder {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            status: ClusterStatus {
                synced: true,
                ..ClusterStatus::default()
            },
        }
    }

    pub fn healthy(mut self, ordinals: impl IntoIterator<Item = Ordinal>) -> Self {
        let kind = self.kind;
        for ordinal in ordinals {
            self = self.member(member(kind, ordinal, true));
        }
        self
    }

    pub fn unhealthy(self, ordinal: Ordinal) -> Self {
        let kind = self.kind;
        self.member(member(kind, ordinal, false))
    }

    pub fn member(mut self, member: Member) -> Self {
        self.status.members.insert(member.pod_name.clone(), member);
        self
    }

    pub fn store(mut self, ordinal: Ordinal, id: u64, state: MemberState) -> Self {
        let mut m = member(ComponentKind::Storage, ordinal, state == MemberState::Up);
        m.state = state;
        m.store = Some(StoreDetails {
            id,
            address: store_address(ordinal),
            labels: BTreeMap::new(),
            leader_count: 0,
            last_heartbeat: None,
        });
        self.member(m)
    }

    pub fn peer(mut self, member: Member) -> Self {
        self.status.peer_members.insert(member.name.clone(), member);
        self
    }

    pub fn leader(mut self, ordinal: Ordinal) -> Self {
        let pod = pod_name(self.kind, ordinal);
        let name = match self.status.members.get_mut(&pod) {
            Some(m) => {
                m.leader = true;
                m.name.clone()
            }
            None => pod,
        };
        self.status.leader = Some(name);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn unsynced(mut self) -> Self {
        self.status.synced = false;
        self
    }

    pub fn build(self) -> ClusterStatus {
        self.status
    }
}

pub fn placement_member(ordinal: Ordinal, health: bool) -> MemberHealth {
    MemberHealth {
        name: pod_name(ComponentKind::Placement, ordinal),
        member_id: u64::from(ordinal) + 1,
        client_urls: vec![client_url(ComponentKind::Placement, ordinal)],
        health,
    }
}

pub fn store_info(ordinal: Ordinal, id: u64, state: &str) -> StoreInfo {
    StoreInfo {
        store: Some(StoreMeta {
            id,
            address: store_address(ordinal),
            labels: BTreeMap::new(),
            state_name: state.to_string(),
        }),
        status: Some(StoreStats {
            leader_count: 0,
            last_heartbeat: Some(Utc::now()),
        }),
    }
}
