//! Member lifecycle event payloads.

use serde::{Deserialize, Serialize};
use tessera_id::Ordinal;

/// All event type names as constants.
pub mod event_types {
    // Scaling
    pub const MEMBER_SCALED_OUT: &str = "member.scaled_out";
    pub const MEMBER_SCALED_IN: &str = "member.scaled_in";
    pub const MEMBER_LEAVING: &str = "member.leaving";

    // Upgrade
    pub const UPGRADE_LEADER_TRANSFER_REQUESTED: &str = "upgrade.leader_transfer_requested";
    pub const UPGRADE_PARTITION_ADVANCED: &str = "upgrade.partition_advanced";
    pub const UPGRADE_MANUAL_OVERRIDE_DETECTED: &str = "upgrade.manual_override_detected";

    // Status
    pub const MEMBER_STATE_CHANGED: &str = "member.state_changed";

    pub const ALL: &[&str] = &[
        MEMBER_SCALED_OUT,
        MEMBER_SCALED_IN,
        MEMBER_LEAVING,
        UPGRADE_LEADER_TRANSFER_REQUESTED,
        UPGRADE_PARTITION_ADVANCED,
        UPGRADE_MANUAL_OVERRIDE_DETECTED,
        MEMBER_STATE_CHANGED,
    ];
}

/// A decision taken by the operator for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemberEvent {
    /// One ordinal was added to the replica set.
    ScaledOut { ordinal: Ordinal, replicas: u32 },

    /// One ordinal was removed and recorded in the delete slots.
    ScaledIn { ordinal: Ordinal, replicas: u32 },

    /// A member was asked to leave the cluster before its removal.
    MemberLeaving { member: String, ordinal: Ordinal },

    /// Leadership handoff was requested ahead of a restart.
    LeaderTransferRequested { from: String, to: String },

    /// The update partition moved down to release one more ordinal.
    PartitionAdvanced { from: u32, to: u32 },

    /// The update strategy was changed outside the operator.
    ManualOverrideDetected { strategy: String },

    /// A member reported a different lifecycle state than last time.
    MemberStateChanged {
        member: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
    },
}

impl MemberEvent {
    pub fn event_type(&self) -> &'static str {
        use event_types::*;

        match self {
            Self::ScaledOut { .. } => MEMBER_SCALED_OUT,
            Self::ScaledIn { .. } => MEMBER_SCALED_IN,
            Self::MemberLeaving { .. } => MEMBER_LEAVING,
            Self::LeaderTransferRequested { .. } => UPGRADE_LEADER_TRANSFER_REQUESTED,
            Self::PartitionAdvanced { .. } => UPGRADE_PARTITION_ADVANCED,
            Self::ManualOverrideDetected { .. } => UPGRADE_MANUAL_OVERRIDE_DETECTED,
            Self::MemberStateChanged { .. } => MEMBER_STATE_CHANGED,
        }
    }
}
