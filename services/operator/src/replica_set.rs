//! Ordinal-indexed replica sets as observed from, and applied to, the driver.
//!
//! A replica set runs `replicas` pods. Their ordinals are the first `replicas`
//! non-negative integers that are not listed in the delete-slots annotation,
//! so the live ordinals may be non-contiguous after a scale-in.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_id::Ordinal;
use thiserror::Error;

/// Annotation holding the delete slots as a JSON integer list, e.g. `[0,1]`.
pub const DELETE_SLOTS_ANNOTATION: &str = "tessera.io/delete-slots";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicaSetError {
    #[error("malformed {DELETE_SLOTS_ANNOTATION} annotation '{value}': {reason}")]
    MalformedDeleteSlots { value: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdateStrategy {
    /// Pods at or above `partition` get the update revision.
    /// `None` means the partition was removed by hand.
    RollingUpdate {
        #[serde(default)]
        partition: Option<u32>,
    },
    /// Pods are only replaced when deleted by someone else.
    OnDelete,
}

impl UpdateStrategy {
    pub fn partition(&self) -> Option<u32> {
        match self {
            Self::RollingUpdate { partition } => *partition,
            Self::OnDelete => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RollingUpdate { .. } => "RollingUpdate",
            Self::OnDelete => "OnDelete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub current_revision: String,
    pub update_revision: String,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    /// Value of the revision label; absent while the pod is being created.
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub ready: bool,
    /// When the pod last became ready.
    #[serde(default)]
    pub ready_since: Option<DateTime<Utc>>,
    /// Topology labels of the node the pod is scheduled on.
    #[serde(default)]
    pub node_labels: Option<BTreeMap<String, String>>,
}

impl Pod {
    /// Ready for at least `min_ready_seconds` as of `now`.
    pub fn is_available(&self, min_ready_seconds: u32, now: DateTime<Utc>) -> bool {
        if !self.ready {
            return false;
        }
        if min_ready_seconds == 0 {
            return true;
        }
        match self.ready_since {
            Some(since) => since + chrono::Duration::seconds(i64::from(min_ready_seconds)) <= now,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub name: String,
    pub replicas: u32,
    pub template: serde_json::Value,
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub status: Option<ReplicaSetStatus>,
    #[serde(default)]
    pub pods: BTreeMap<Ordinal, Pod>,
}

impl ReplicaSet {
    pub fn delete_slots(&self) -> Result<BTreeSet<Ordinal>, ReplicaSetError> {
        match self.annotations.get(DELETE_SLOTS_ANNOTATION) {
            Some(value) => parse_delete_slots(value),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Write `slots` back to the annotation. An empty set removes it.
    pub fn set_delete_slots(&mut self, slots: &BTreeSet<Ordinal>) {
        if slots.is_empty() {
            self.annotations.remove(DELETE_SLOTS_ANNOTATION);
        } else {
            self.annotations
                .insert(DELETE_SLOTS_ANNOTATION.to_string(), format_delete_slots(slots));
        }
    }

    pub fn live_ordinals(&self) -> Result<BTreeSet<Ordinal>, ReplicaSetError> {
        Ok(live_ordinals(self.replicas, &self.delete_slots()?))
    }

    pub fn partition(&self) -> Option<u32> {
        self.update_strategy.partition()
    }

    /// Set the rolling-update partition. No-op under `OnDelete`.
    pub fn set_partition(&mut self, value: u32) {
        if let UpdateStrategy::RollingUpdate { partition } = &mut self.update_strategy {
            *partition = Some(value);
        }
    }

    /// Whether every pod of this set already runs `template`: the template
    /// matches and the rollout to it has finished.
    pub fn runs_template(&self, template: &serde_json::Value) -> bool {
        tessera_reconcile::templates_equal(&self.template, template)
            && self
                .status
                .as_ref()
                .is_none_or(|s| s.current_revision == s.update_revision)
    }
}

/// The first `replicas` non-negative integers not in `delete_slots`.
pub fn live_ordinals(replicas: u32, delete_slots: &BTreeSet<Ordinal>) -> BTreeSet<Ordinal> {
    (0..)
        .filter(|ordinal| !delete_slots.contains(ordinal))
        .take(replicas as usize)
        .collect()
}

pub fn parse_delete_slots(value: &str) -> Result<BTreeSet<Ordinal>, ReplicaSetError> {
    if value.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    serde_json::from_str::<Vec<Ordinal>>(value)
        .map(|slots| slots.into_iter().collect())
        .map_err(|e| ReplicaSetError::MalformedDeleteSlots {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

pub fn format_delete_slots(slots: &BTreeSet<Ordinal>) -> String {
    let list: Vec<String> = slots.iter().map(|s| s.to_string()).collect();
    format!("[{}]", list.join(","))
}
