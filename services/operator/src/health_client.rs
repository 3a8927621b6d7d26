//! Cluster health capability.
//!
//! Everything the operator learns about the running cluster (who is
//! healthy, who leads, which stores exist) comes through
//! [`ClusterHealthClient`]. Calls may fail or time out; failures are always
//! reported to the caller and never swallowed here.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the cluster health API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{what} returned {status}: {body}")]
    Status {
        what: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Health of one consensus member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub name: String,
    #[serde(default)]
    pub member_id: u64,
    #[serde(default)]
    pub client_urls: Vec<String>,
    pub health: bool,
}

/// Store metadata as registered with the placement service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// `Up`, `Down`, `Offline`, `Tombstone`, `Disconnected`, ...
    pub state_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    #[serde(default)]
    pub leader_count: u32,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// One entry of the store listing. Either half may be missing while a
/// store is registering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    #[serde(default)]
    pub store: Option<StoreMeta>,
    #[serde(default)]
    pub status: Option<StoreStats>,
}

#[async_trait]
pub trait ClusterHealthClient: Send + Sync {
    /// Membership of the placement tier with per-member health.
    async fn members_health(&self) -> Result<Vec<MemberHealth>, ClientError>;

    async fn member_health(&self, name: &str) -> Result<Option<MemberHealth>, ClientError> {
        Ok(self
            .members_health()
            .await?
            .into_iter()
            .find(|m| m.name == name))
    }

    /// Whether the member serving `client_url` has caught up and serves
    /// requests.
    async fn member_ready(&self, client_url: &str) -> Result<bool, ClientError>;

    /// Name of the current placement leader.
    async fn leader(&self) -> Result<Option<String>, ClientError>;

    async fn transfer_leader(&self, name: &str) -> Result<(), ClientError>;

    /// Health of every consensus peer as probed by the leader, including
    /// members that belong to other clusters.
    async fn peer_health(&self) -> Result<Vec<MemberHealth>, ClientError>;

    async fn stores(&self) -> Result<Vec<StoreInfo>, ClientError>;

    async fn tombstone_stores(&self) -> Result<Vec<StoreInfo>, ClientError>;

    async fn set_store_labels(
        &self,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Label keys that describe store location, e.g. `zone`, `rack`, `host`.
    async fn location_labels(&self) -> Result<Vec<String>, ClientError>;

    async fn delete_member(&self, name: &str) -> Result<(), ClientError>;

    async fn delete_store(&self, store_id: u64) -> Result<(), ClientError>;
}

/// Run `fut` with a deadline, mapping expiry to [`ClientError::Timeout`].
pub async fn with_timeout<T, F>(
    what: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout { what, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), ClientError> = with_timeout("stores", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(ClientError::Timeout { what, .. }) => assert_eq!(what, "stores"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout("leader", Duration::from_secs(1), async {
            Ok::<_, ClientError>(Some("basic-placement-0".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(result.as_deref(), Some("basic-placement-0"));
    }
}
