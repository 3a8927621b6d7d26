//! # tessera-events
//!
//! Lifecycle events emitted while the operator changes cluster membership.
//!
//! ## Design Principles
//!
//! - Events describe decisions already taken; they never drive control flow
//! - Every event belongs to exactly one component of one cluster
//! - Events carry the pass ID so they can be joined with the pass's log lines
//! - Sinks must not fail a reconciliation pass
//!
//! ## Event Types
//!
//! - Scale events (`member.scaled_out`, `member.scaled_in`, `member.leaving`)
//! - Upgrade events (`upgrade.leader_transfer_requested`,
//!   `upgrade.partition_advanced`, `upgrade.manual_override_detected`)
//! - Status events (`member.state_changed`)

mod envelope;
mod error;
mod sink;
mod types;

pub use envelope::EventEnvelope;
pub use error::EventError;
pub use sink::{EventSink, MemoryEventSink, TracingEventSink};
pub use types::*;
