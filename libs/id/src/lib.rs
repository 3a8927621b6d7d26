//! # tessera-id
//!
//! Identity and naming for managed database clusters.
//!
//! ## Design Principles
//!
//! - A cluster is identified by `(namespace, name, cluster_domain)`
//! - Every member name is derived from the cluster identity, the component
//!   kind and the ordinal; nothing else goes into it
//! - Member addresses reported by the cluster can be parsed back into the
//!   same parts, so local members and cross-cluster peers can be told apart
//! - Correlation IDs for reconciliation passes are prefixed ULIDs
//!
//! ## Naming
//!
//! ```text
//! pod:     {cluster}-{kind}-{ordinal}
//! service: {cluster}-{kind}-peer
//! address: {pod}.{service}.{namespace}.svc[.{cluster_domain}]:{port}
//! ```

#[macro_use]
mod macros;
mod cluster;
mod error;

pub use cluster::{ClusterIdentity, ComponentKind, MemberAddress, Ordinal};
pub use error::IdError;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

define_id!(PassId, "pass");
