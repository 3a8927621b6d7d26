//! In-memory [`ClusterHealthClient`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tessera_operator::health_client::{
    ClientError, ClusterHealthClient, MemberHealth, StoreInfo,
};

/// Mutating calls the fake has served, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    TransferLeader(String),
    DeleteMember(String),
    DeleteStore(u64),
    SetStoreLabels(u64, BTreeMap<String, String>),
}

#[derive(Debug, Default, Clone)]
pub struct FakeState {
    pub members: Vec<MemberHealth>,
    pub peers: Vec<MemberHealth>,
    pub leader: Option<String>,
    pub stores: Vec<StoreInfo>,
    pub tombstones: Vec<StoreInfo>,
    pub location_labels: Vec<String>,
    /// Client urls whose readiness probe answers false.
    pub not_ready: BTreeSet<String>,
    /// Operations that fail, by method name (e.g. `"stores"`).
    pub failing: BTreeSet<&'static str>,
    pub calls: Vec<Call>,
}

#[derive(Debug, Default)]
pub struct FakeHealthClient {
    state: Mutex<FakeState>,
}

impl FakeHealthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(self, members: Vec<MemberHealth>) -> Self {
        self.update(|s| s.members = members);
        self
    }

    pub fn with_peers(self, peers: Vec<MemberHealth>) -> Self {
        self.update(|s| s.peers = peers);
        self
    }

    pub fn with_leader(self, leader: impl Into<String>) -> Self {
        let leader = leader.into();
        self.update(|s| s.leader = Some(leader));
        self
    }

    pub fn with_stores(self, stores: Vec<StoreInfo>) -> Self {
        self.update(|s| s.stores = stores);
        self
    }

    pub fn with_tombstones(self, tombstones: Vec<StoreInfo>) -> Self {
        self.update(|s| s.tombstones = tombstones);
        self
    }

    pub fn with_location_labels(self, labels: &[&str]) -> Self {
        let labels = labels.iter().map(|l| l.to_string()).collect();
        self.update(|s| s.location_labels = labels);
        self
    }

    pub fn failing(self, operation: &'static str) -> Self {
        self.update(|s| {
            s.failing.insert(operation);
        });
        self
    }

    pub fn not_ready(self, client_url: impl Into<String>) -> Self {
        let url = client_url.into();
        self.update(|s| {
            s.not_ready.insert(url);
        });
        self
    }

    /// Mutate the fake between passes.
    pub fn update(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn snapshot(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.snapshot().calls
    }

    pub fn transfers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::TransferLeader(to) => Some(to),
                _ => None,
            })
            .collect()
    }

    fn check(&self, operation: &'static str) -> Result<(), ClientError> {
        if self.state.lock().unwrap().failing.contains(operation) {
            return Err(ClientError::Other(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterHealthClient for FakeHealthClient {
    async fn members_health(&self) -> Result<Vec<MemberHealth>, ClientError> {
        self.check("members_health")?;
        Ok(self.snapshot().members)
    }

    async fn member_ready(&self, client_url: &str) -> Result<bool, ClientError> {
        self.check("member_ready")?;
        Ok(!self.snapshot().not_ready.contains(client_url))
    }

    async fn leader(&self) -> Result<Option<String>, ClientError> {
        self.check("leader")?;
        Ok(self.snapshot().leader)
    }

    async fn transfer_leader(&self, name: &str) -> Result<(), ClientError> {
        self.check("transfer_leader")?;
        self.update(|s| {
            s.calls.push(Call::TransferLeader(name.to_string()));
            s.leader = Some(name.to_string());
        });
        Ok(())
    }

    async fn peer_health(&self) -> Result<Vec<MemberHealth>, ClientError> {
        self.check("peer_health")?;
        let state = self.snapshot();
        Ok(state.members.into_iter().chain(state.peers).collect())
    }

    async fn stores(&self) -> Result<Vec<StoreInfo>, ClientError> {
        self.check("stores")?;
        Ok(self.snapshot().stores)
    }

    async fn tombstone_stores(&self) -> Result<Vec<StoreInfo>, ClientError> {
        self.check("tombstone_stores")?;
        Ok(self.snapshot().tombstones)
    }

    async fn set_store_labels(
        &self,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        self.check("set_store_labels")?;
        self.update(|s| {
            s.calls.push(Call::SetStoreLabels(store_id, labels.clone()));
            for store in s.stores.iter_mut().filter_map(|info| info.store.as_mut()) {
                if store.id == store_id {
                    store.labels.extend(labels.clone());
                }
            }
        });
        Ok(())
    }

    async fn location_labels(&self) -> Result<Vec<String>, ClientError> {
        self.check("location_labels")?;
        Ok(self.snapshot().location_labels)
    }

    async fn delete_member(&self, name: &str) -> Result<(), ClientError> {
        self.check("delete_member")?;
        self.update(|s| {
            s.calls.push(Call::DeleteMember(name.to_string()));
            s.members.retain(|m| m.name != name);
        });
        Ok(())
    }

    /// Deleted stores go offline; tests move them to tombstone.
    async fn delete_store(&self, store_id: u64) -> Result<(), ClientError> {
        self.check("delete_store")?;
        self.update(|s| {
            s.calls.push(Call::DeleteStore(store_id));
            for store in s.stores.iter_mut().filter_map(|info| info.store.as_mut()) {
                if store.id == store_id {
                    store.state_name = "Offline".to_string();
                }
            }
        });
        Ok(())
    }
}
