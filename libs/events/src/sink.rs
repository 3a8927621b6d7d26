//! Destinations for lifecycle events.

use std::sync::Mutex;

use crate::EventEnvelope;

/// Receives lifecycle events. Emission is fire-and-forget.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventEnvelope);
}

/// Writes each event as a structured `info!` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EventEnvelope) {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();
        tracing::info!(
            pass_id = %event.pass_id,
            cluster = %event.cluster,
            kind = %event.kind,
            event_type = %event.event_type,
            payload = %payload,
            "member lifecycle event"
        );
    }
}

/// Keeps events in memory; used by tests to assert on decisions.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.event_type).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: EventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemberEvent;
    use tessera_id::{ClusterIdentity, ComponentKind, PassId};

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryEventSink::new();
        let cluster = ClusterIdentity::new("default", "basic");
        let pass = PassId::new();

        sink.emit(EventEnvelope::new(
            pass,
            cluster.clone(),
            ComponentKind::Placement,
            MemberEvent::PartitionAdvanced { from: 3, to: 2 },
        ));
        sink.emit(EventEnvelope::new(
            pass,
            cluster,
            ComponentKind::Placement,
            MemberEvent::PartitionAdvanced { from: 2, to: 1 },
        ));

        assert_eq!(
            sink.event_types(),
            vec!["upgrade.partition_advanced", "upgrade.partition_advanced"]
        );
        assert_eq!(
            sink.events()[1].payload,
            MemberEvent::PartitionAdvanced { from: 2, to: 1 }
        );

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
