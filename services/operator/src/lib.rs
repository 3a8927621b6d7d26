//! tessera member lifecycle operator.
//!
//! This crate primarily ships an `operator` binary, but we expose the
//! orchestration logic as a library for integration testing and reuse.

pub mod config;
pub mod controller;
pub mod driver;
pub mod health_client;
pub mod http_client;
pub mod member;
pub mod replica_set;
pub mod topology;
pub mod worker;
