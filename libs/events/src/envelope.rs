//! Event envelope: the pass and component an event belongs to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_id::{ClusterIdentity, ComponentKind, PassId};

use crate::{event_types, EventError, MemberEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The reconciliation pass that took the decision.
    pub pass_id: PassId,

    pub occurred_at: DateTime<Utc>,

    pub cluster: ClusterIdentity,

    pub kind: ComponentKind,

    /// The event type (e.g., "member.scaled_in").
    pub event_type: String,

    pub payload: MemberEvent,
}

impl EventEnvelope {
    pub fn new(
        pass_id: PassId,
        cluster: ClusterIdentity,
        kind: ComponentKind,
        payload: MemberEvent,
    ) -> Self {
        Self {
            pass_id,
            occurred_at: Utc::now(),
            cluster,
            kind,
            event_type: payload.event_type().to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope, rejecting event types this crate does not know
    /// and envelopes whose type disagrees with their payload.
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        let envelope: Self = serde_json::from_str(s)?;
        if !event_types::ALL.contains(&envelope.event_type.as_str())
            || envelope.event_type != envelope.payload.event_type()
        {
            return Err(EventError::UnknownEventType(envelope.event_type));
        }
        Ok(envelope)
    }
}
