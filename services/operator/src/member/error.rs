//! Errors raised while reconciling one component.

use tessera_id::{ComponentKind, Ordinal};
use tessera_reconcile::{Classify, Severity};
use thiserror::Error;

use crate::driver::DriverError;
use crate::health_client::ClientError;
use crate::replica_set::ReplicaSetError;

/// Result type for member operations.
pub type MemberResult<T> = Result<T, MemberError>;

#[derive(Debug, Error)]
pub enum MemberError {
    // Fatal: the pass cannot continue without fresh data or an operator.
    #[error("{kind} status is not synced, refusing to act on stale data")]
    StatusNotSynced { kind: ComponentKind },

    #[error("replica set {name} has no status")]
    MissingReplicaSetStatus { name: String },

    #[error("malformed replica set: {0}")]
    MalformedReplicaSet(#[from] ReplicaSetError),

    #[error("replica set driver: {0}")]
    Driver(#[from] DriverError),

    // Retryable: the cluster is still moving.
    #[error("pod {pod} not found")]
    PodNotFound { pod: String },

    #[error("pod {pod} has no revision label")]
    MissingRevision { pod: String },

    #[error("upgraded pod {pod} is not ready")]
    PodNotReady { pod: String },

    #[error("upgraded pod {pod} is not available yet (ready for less than {min_ready_seconds}s)")]
    PodUnavailable { pod: String, min_ready_seconds: u32 },

    #[error("{kind} member {member} (ordinal {ordinal}) is not healthy")]
    MemberUnhealthy {
        kind: ComponentKind,
        member: String,
        ordinal: Ordinal,
    },

    #[error("{kind} member {member} is not ready: {reason}")]
    MemberNotReady {
        kind: ComponentKind,
        member: String,
        reason: String,
    },

    #[error("{kind} peers are unstable: {reason}")]
    PeersUnstable { kind: ComponentKind, reason: String },

    #[error("{kind} member {from} is transferring leadership to {to}")]
    LeaderTransferring {
        kind: ComponentKind,
        from: String,
        to: String,
    },

    #[error("{kind} member {member} is leaving the cluster: {reason}")]
    MemberLeaving {
        kind: ComponentKind,
        member: String,
        reason: String,
    },

    #[error("{what} query failed: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: ClientError,
    },
}

impl MemberError {
    pub fn query(what: &'static str) -> impl FnOnce(ClientError) -> MemberError {
        move |source| MemberError::Query { what, source }
    }

    pub fn is_retryable(&self) -> bool {
        Classify::is_retryable(self)
    }
}

impl Classify for MemberError {
    fn severity(&self) -> Severity {
        match self {
            Self::StatusNotSynced { .. }
            | Self::MissingReplicaSetStatus { .. }
            | Self::MalformedReplicaSet(_)
            | Self::Driver(_) => Severity::Fatal,
            Self::PodNotFound { .. }
            | Self::MissingRevision { .. }
            | Self::PodNotReady { .. }
            | Self::PodUnavailable { .. }
            | Self::MemberUnhealthy { .. }
            | Self::MemberNotReady { .. }
            | Self::PeersUnstable { .. }
            | Self::LeaderTransferring { .. }
            | Self::MemberLeaving { .. }
            | Self::Query { .. } => Severity::Retryable,
        }
    }
}
