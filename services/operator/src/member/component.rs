//! Per-component cluster capabilities.
//!
//! The orchestrators are written once against [`Component`]; what differs
//! between the placement, storage and proxy tiers (how members are listed,
//! who leads, how a member leaves) lives here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_id::{ClusterIdentity, ComponentKind};
use tracing::{debug, info, warn};

use super::error::{MemberError, MemberResult};
use super::status::{ClusterStatus, Member, MemberState};
use crate::health_client::{with_timeout, ClientError, ClusterHealthClient, StoreInfo};
use crate::replica_set::ReplicaSet;

/// What identifies an inventory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub address: Option<String>,
    pub store_id: Option<u64>,
    pub labels: BTreeMap<String, String>,
}

/// What the cluster currently reports for an inventory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub state: String,
    pub health: bool,
    pub leader_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One member as listed by the cluster. Either half may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub descriptor: Option<Descriptor>,
    pub status: Option<EntryStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub entries: Vec<InventoryEntry>,
    pub tombstones: Vec<InventoryEntry>,
    pub leader: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveProgress {
    Done,
    Pending(String),
}

#[async_trait]
pub trait Component: Send + Sync {
    fn kind(&self) -> ComponentKind;

    /// Whether a healthy member also serves traffic.
    async fn is_member_ready(&self, member: &Member) -> Result<bool, ClientError>;

    /// Name of the member holding leadership, for components that have one.
    async fn current_leader(&self) -> Result<Option<String>, ClientError>;

    async fn transfer_leadership(&self, target: &str) -> Result<(), ClientError>;

    /// A reason if any peer other than `exclude` is unhealthy.
    async fn unstable_peer(&self, exclude: &str) -> Result<Option<String>, ClientError>;

    async fn inventory(
        &self,
        identity: &ClusterIdentity,
        observed: &ReplicaSet,
    ) -> Result<Inventory, ClientError>;

    /// Remove the member on `pod_name` from the cluster.
    async fn leave_cluster(
        &self,
        pod_name: &str,
        status: &ClusterStatus,
    ) -> Result<LeaveProgress, ClientError>;

    /// Copy node topology onto members. Returns how many were updated.
    async fn sync_labels(&self, _observed: &ReplicaSet, _status: &ClusterStatus) -> MemberResult<usize> {
        Ok(0)
    }
}

/// Build the capability for `kind` on top of a health client.
pub fn component_for(
    kind: ComponentKind,
    client: Arc<dyn ClusterHealthClient>,
    timeout: Duration,
) -> Box<dyn Component> {
    match kind {
        ComponentKind::Placement => Box::new(PlacementComponent { client, timeout }),
        ComponentKind::Storage => Box::new(StorageComponent { client, timeout }),
        ComponentKind::Proxy => Box::new(ProxyComponent),
    }
}

fn up_or_down(health: bool) -> String {
    let state = if health { MemberState::Up } else { MemberState::Down };
    state.to_string()
}

/// The consensus tier. The only tier with a single leader.
pub struct PlacementComponent {
    client: Arc<dyn ClusterHealthClient>,
    timeout: Duration,
}

impl PlacementComponent {
    pub fn new(client: Arc<dyn ClusterHealthClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Component for PlacementComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Placement
    }

    async fn is_member_ready(&self, member: &Member) -> Result<bool, ClientError> {
        let Some(url) = member.address.as_deref() else {
            return Err(ClientError::Other(format!(
                "member {} has no client url",
                member.name
            )));
        };
        with_timeout("member ready", self.timeout, self.client.member_ready(url)).await
    }

    async fn current_leader(&self) -> Result<Option<String>, ClientError> {
        with_timeout("leader", self.timeout, self.client.leader()).await
    }

    async fn transfer_leadership(&self, target: &str) -> Result<(), ClientError> {
        with_timeout(
            "transfer leader",
            self.timeout,
            self.client.transfer_leader(target),
        )
        .await
    }

    async fn unstable_peer(&self, exclude: &str) -> Result<Option<String>, ClientError> {
        let peers = with_timeout("peer health", self.timeout, self.client.peer_health()).await?;
        Ok(peers
            .into_iter()
            .find(|peer| !peer.health && peer.name != exclude)
            .map(|peer| format!("member {} is unhealthy", peer.name)))
    }

    async fn inventory(
        &self,
        _identity: &ClusterIdentity,
        _observed: &ReplicaSet,
    ) -> Result<Inventory, ClientError> {
        let members =
            with_timeout("members health", self.timeout, self.client.members_health()).await?;
        let leader = self.current_leader().await?;

        let entries = members
            .into_iter()
            .map(|m| InventoryEntry {
                status: Some(EntryStatus {
                    state: up_or_down(m.health),
                    health: m.health,
                    leader_count: 0,
                    last_heartbeat: None,
                }),
                descriptor: Some(Descriptor {
                    address: m.client_urls.into_iter().next(),
                    name: m.name,
                    store_id: None,
                    labels: BTreeMap::new(),
                }),
            })
            .collect();

        Ok(Inventory {
            entries,
            tombstones: Vec::new(),
            leader,
        })
    }

    async fn leave_cluster(
        &self,
        pod_name: &str,
        status: &ClusterStatus,
    ) -> Result<LeaveProgress, ClientError> {
        let Some(member) = status.members.get(pod_name) else {
            debug!(pod = %pod_name, "member never joined, nothing to remove");
            return Ok(LeaveProgress::Done);
        };
        with_timeout(
            "delete member",
            self.timeout,
            self.client.delete_member(&member.name),
        )
        .await?;
        info!(member = %member.name, "deleted placement member");
        Ok(LeaveProgress::Done)
    }
}

/// The replicated storage tier.
pub struct StorageComponent {
    client: Arc<dyn ClusterHealthClient>,
    timeout: Duration,
}

impl StorageComponent {
    pub fn new(client: Arc<dyn ClusterHealthClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn entry(info: StoreInfo) -> InventoryEntry {
        let state = info.store.as_ref().map(|s| s.state_name.clone());
        InventoryEntry {
            status: info.status.zip(state).map(|(stats, state)| EntryStatus {
                health: state == "Up",
                state,
                leader_count: stats.leader_count,
                last_heartbeat: stats.last_heartbeat,
            }),
            descriptor: info.store.map(|store| Descriptor {
                name: store.address.clone(),
                address: Some(store.address),
                store_id: Some(store.id),
                labels: store.labels,
            }),
        }
    }
}

#[async_trait]
impl Component for StorageComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Storage
    }

    async fn is_member_ready(&self, member: &Member) -> Result<bool, ClientError> {
        Ok(member.state == MemberState::Up)
    }

    async fn current_leader(&self) -> Result<Option<String>, ClientError> {
        Ok(None)
    }

    async fn transfer_leadership(&self, _target: &str) -> Result<(), ClientError> {
        // Leadership is spread over regions; there is no single leader to move.
        Err(ClientError::Other("storage has no cluster leader".to_string()))
    }

    async fn unstable_peer(&self, exclude: &str) -> Result<Option<String>, ClientError> {
        let stores = with_timeout("stores", self.timeout, self.client.stores()).await?;
        Ok(stores
            .into_iter()
            .filter_map(|info| info.store)
            .find(|store| store.state_name != "Up" && store.address != exclude)
            .map(|store| {
                format!(
                    "store {} ({}) is {}",
                    store.id, store.address, store.state_name
                )
            }))
    }

    async fn inventory(
        &self,
        _identity: &ClusterIdentity,
        _observed: &ReplicaSet,
    ) -> Result<Inventory, ClientError> {
        let stores = with_timeout("stores", self.timeout, self.client.stores()).await?;
        let tombstones =
            with_timeout("tombstone stores", self.timeout, self.client.tombstone_stores()).await?;

        Ok(Inventory {
            entries: stores.into_iter().map(Self::entry).collect(),
            tombstones: tombstones.into_iter().map(Self::entry).collect(),
            leader: None,
        })
    }

    async fn leave_cluster(
        &self,
        pod_name: &str,
        status: &ClusterStatus,
    ) -> Result<LeaveProgress, ClientError> {
        if status.tombstones.contains_key(pod_name) {
            return Ok(LeaveProgress::Done);
        }
        let Some(member) = status.members.get(pod_name) else {
            debug!(pod = %pod_name, "store never registered, nothing to remove");
            return Ok(LeaveProgress::Done);
        };
        let Some(store) = &member.store else {
            return Ok(LeaveProgress::Done);
        };

        match member.state {
            MemberState::Tombstone => Ok(LeaveProgress::Done),
            MemberState::Offline => Ok(LeaveProgress::Pending(format!(
                "store {} is offline, waiting for it to become tombstone",
                store.id
            ))),
            _ => {
                with_timeout(
                    "delete store",
                    self.timeout,
                    self.client.delete_store(store.id),
                )
                .await?;
                info!(store_id = store.id, pod = %pod_name, "deleted store");
                Ok(LeaveProgress::Pending(format!(
                    "store {} is going offline",
                    store.id
                )))
            }
        }
    }

    async fn sync_labels(&self, observed: &ReplicaSet, status: &ClusterStatus) -> MemberResult<usize> {
        let keys = with_timeout("location labels", self.timeout, self.client.location_labels())
            .await
            .map_err(MemberError::query("location labels"))?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut updated = 0;
        for member in status.members.values() {
            let Some(store) = &member.store else { continue };
            if member.state != MemberState::Up {
                continue;
            }

            let pod = observed
                .pods
                .get(&member.ordinal)
                .ok_or_else(|| MemberError::PodNotFound {
                    pod: member.pod_name.clone(),
                })?;
            let Some(node_labels) = &pod.node_labels else {
                continue;
            };

            let wanted: BTreeMap<String, String> = keys
                .iter()
                .filter_map(|key| node_labels.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            if wanted.is_empty()
                || wanted
                    .iter()
                    .all(|(k, v)| store.labels.get(k) == Some(v))
            {
                continue;
            }

            match with_timeout(
                "set store labels",
                self.timeout,
                self.client.set_store_labels(store.id, &wanted),
            )
            .await
            {
                Ok(()) => {
                    info!(store_id = store.id, pod = %member.pod_name, labels = ?wanted, "store labels updated");
                    updated += 1;
                }
                Err(e) => {
                    warn!(store_id = store.id, pod = %member.pod_name, error = %e, "failed to set store labels");
                }
            }
        }
        Ok(updated)
    }
}

/// The stateless proxy tier. Members are its pods; nothing has to leave.
pub struct ProxyComponent;

#[async_trait]
impl Component for ProxyComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Proxy
    }

    async fn is_member_ready(&self, _member: &Member) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn current_leader(&self) -> Result<Option<String>, ClientError> {
        Ok(None)
    }

    async fn transfer_leadership(&self, _target: &str) -> Result<(), ClientError> {
        Err(ClientError::Other("proxy has no cluster leader".to_string()))
    }

    async fn unstable_peer(&self, _exclude: &str) -> Result<Option<String>, ClientError> {
        Ok(None)
    }

    async fn inventory(
        &self,
        identity: &ClusterIdentity,
        observed: &ReplicaSet,
    ) -> Result<Inventory, ClientError> {
        let entries = observed
            .pods
            .iter()
            .map(|(ordinal, pod)| InventoryEntry {
                descriptor: Some(Descriptor {
                    name: pod.name.clone(),
                    address: Some(identity.member_host(ComponentKind::Proxy, *ordinal)),
                    store_id: None,
                    labels: BTreeMap::new(),
                }),
                status: Some(EntryStatus {
                    state: up_or_down(pod.ready),
                    health: pod.ready,
                    leader_count: 0,
                    last_heartbeat: None,
                }),
            })
            .collect();

        Ok(Inventory {
            entries,
            tombstones: Vec::new(),
            leader: None,
        })
    }

    async fn leave_cluster(
        &self,
        _pod_name: &str,
        _status: &ClusterStatus,
    ) -> Result<LeaveProgress, ClientError> {
        Ok(LeaveProgress::Done)
    }
}
