//! Shared fakes and fixtures for tessera operator tests.
//!
//! Used from the operator's integration tests only; the operator's unit
//! tests build their own values.

pub mod fake_client;
pub mod fixtures;

pub use fake_client::{Call, FakeHealthClient, FakeState};
pub use fixtures::{identity, member, recorder, template, topology, ReplicaSetBuilder, StatusBuilder};
