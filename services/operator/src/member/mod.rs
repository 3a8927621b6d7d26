//! Member lifecycle orchestration.
//!
//! For each component of a cluster, one pass:
//! - refreshes [`ClusterStatus`] from the cluster ([`status`])
//! - moves at most one ordinal in or out of the replica set ([`scaler`])
//! - otherwise lowers the update partition by at most one replica, handing
//!   leadership off first when needed ([`upgrader`])
//!
//! Nothing is remembered between passes; every decision is recomputed from
//! the observed replica set and the status.

use std::sync::Arc;

use tessera_events::{EventEnvelope, EventSink, MemberEvent};
use tessera_id::{ClusterIdentity, ComponentKind, PassId};

pub mod component;
pub mod error;
pub mod manager;
pub mod scaler;
pub mod status;
pub mod upgrader;

pub use component::{component_for, Component, Inventory, InventoryEntry, LeaveProgress};
pub use error::{MemberError, MemberResult};
pub use manager::MemberManager;
pub use scaler::{scale_step, ScaleStep, Scaler};
pub use status::{
    is_upgrading, ClusterStatus, Member, MemberState, Phase, StatusReconciler, UpstreamPhase,
    UpgradingPredicate,
};
pub use upgrader::Upgrader;

/// Emits lifecycle events for one component within one pass.
#[derive(Clone)]
pub struct Recorder {
    sink: Arc<dyn EventSink>,
    pass_id: PassId,
    identity: ClusterIdentity,
    kind: ComponentKind,
}

impl Recorder {
    pub fn new(
        sink: Arc<dyn EventSink>,
        pass_id: PassId,
        identity: ClusterIdentity,
        kind: ComponentKind,
    ) -> Self {
        Self {
            sink,
            pass_id,
            identity,
            kind,
        }
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn record(&self, event: MemberEvent) {
        self.sink.emit(EventEnvelope::new(
            self.pass_id,
            self.identity.clone(),
            self.kind,
            event,
        ));
    }
}
