//! Declared cluster topology.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tessera_id::{ClusterIdentity, ComponentKind, Ordinal};
use tracing::warn;

use crate::replica_set::ReplicaSet;

/// Query peer health before restarting a member when set to `"true"`.
pub const PEER_STABILITY_CHECK_ANNOTATION: &str =
    "tessera.io/peer-stability-check-before-upgrade";

/// Seconds an upgraded pod must stay ready before the next one is touched.
pub const MIN_READY_SECONDS_ANNOTATION: &str = "tessera.io/min-ready-seconds";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub replicas: u32,
    pub template: serde_json::Value,
    /// Ordinals the user wants removed, in addition to trimming from the top.
    #[serde(default)]
    pub delete_slots: BTreeSet<Ordinal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub identity: ClusterIdentity,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub components: BTreeMap<ComponentKind, ComponentSpec>,
}

impl Topology {
    pub fn new(identity: ClusterIdentity) -> Self {
        Self {
            identity,
            annotations: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    pub fn with_component(mut self, kind: ComponentKind, spec: ComponentSpec) -> Self {
        self.components.insert(kind, spec);
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn peer_stability_check(&self) -> bool {
        self.annotations
            .get(PEER_STABILITY_CHECK_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Malformed values are logged and read as 0.
    pub fn min_ready_seconds(&self) -> u32 {
        let Some(value) = self.annotations.get(MIN_READY_SECONDS_ANNOTATION) else {
            return 0;
        };
        match value.trim().parse::<u32>() {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!(
                    cluster = %self.identity,
                    annotation = MIN_READY_SECONDS_ANNOTATION,
                    value = %value,
                    error = %e,
                    "annotation should be a non-negative integer, using 0"
                );
                0
            }
        }
    }

    /// The replica set this topology asks for, starting from `observed`.
    ///
    /// Only the replica count, delete slots and template are declared; every
    /// other field (strategy, partition, pods, status) is carried over.
    pub fn desired_replica_set(&self, kind: ComponentKind, observed: &ReplicaSet) -> Option<ReplicaSet> {
        let spec = self.components.get(&kind)?;
        let mut desired = observed.clone();
        desired.replicas = spec.replicas;
        desired.template = spec.template.clone();
        desired.set_delete_slots(&spec.delete_slots);
        Some(desired)
    }
}
