//! HTTP client for the placement service REST API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::health_client::{ClientError, ClusterHealthClient, MemberHealth, StoreInfo};

/// [`ClusterHealthClient`] backed by the placement service.
pub struct HttpHealthClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<MemberHealth>,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoresResponse {
    #[serde(default)]
    stores: Vec<StoreInfo>,
}

#[derive(Debug, Deserialize)]
struct ReplicateConfig {
    #[serde(rename = "location-labels", default)]
    location_labels: String,
}

impl HttpHealthClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        what: &'static str,
        url: &str,
    ) -> Result<T, ClientError> {
        debug!(url = %url, "GET {what}");
        let response = self.client.get(url).send().await?;
        let response = check_status(what, response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
            what,
            reason: e.to_string(),
        })
    }

    async fn send(&self, what: &'static str, request: reqwest::RequestBuilder) -> Result<(), ClientError> {
        let response = request.send().await?;
        check_status(what, response).await?;
        Ok(())
    }
}

async fn check_status(
    what: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    warn!(status, body = %body, "{what} failed");
    Err(ClientError::Status { what, status, body })
}

#[async_trait]
impl ClusterHealthClient for HttpHealthClient {
    async fn members_health(&self) -> Result<Vec<MemberHealth>, ClientError> {
        let response: MembersResponse = self
            .get_json("members", &self.url("/api/v1/members"))
            .await?;
        Ok(response.members)
    }

    async fn member_ready(&self, client_url: &str) -> Result<bool, ClientError> {
        let url = format!("{}/api/v1/ready", client_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::SERVICE_UNAVAILABLE {
            Ok(false)
        } else {
            check_status("member ready", response).await.map(|_| false)
        }
    }

    async fn leader(&self) -> Result<Option<String>, ClientError> {
        let response: LeaderResponse = self.get_json("leader", &self.url("/api/v1/leader")).await?;
        Ok(response.name.filter(|name| !name.is_empty()))
    }

    async fn transfer_leader(&self, name: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/api/v1/leader/transfer/{name}"));
        self.send("transfer leader", self.client.post(&url)).await
    }

    async fn peer_health(&self) -> Result<Vec<MemberHealth>, ClientError> {
        self.get_json("health", &self.url("/api/v1/health")).await
    }

    async fn stores(&self) -> Result<Vec<StoreInfo>, ClientError> {
        let response: StoresResponse = self.get_json("stores", &self.url("/api/v1/stores")).await?;
        Ok(response.stores)
    }

    async fn tombstone_stores(&self) -> Result<Vec<StoreInfo>, ClientError> {
        let response: StoresResponse = self
            .get_json("tombstone stores", &self.url("/api/v1/stores?state=tombstone"))
            .await?;
        Ok(response.stores)
    }

    async fn set_store_labels(
        &self,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let url = self.url(&format!("/api/v1/store/{store_id}/label"));
        self.send("set store labels", self.client.post(&url).json(labels))
            .await
    }

    async fn location_labels(&self) -> Result<Vec<String>, ClientError> {
        let config: ReplicateConfig = self
            .get_json("replicate config", &self.url("/api/v1/config/replicate"))
            .await?;
        Ok(config
            .location_labels
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn delete_member(&self, name: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("/api/v1/members/name/{name}"));
        self.send("delete member", self.client.delete(&url)).await
    }

    async fn delete_store(&self, store_id: u64) -> Result<(), ClientError> {
        let url = self.url(&format!("/api/v1/store/{store_id}"));
        self.send("delete store", self.client.delete(&url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HttpHealthClient {
        HttpHealthClient::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_members_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "members": [
                    {"name": "basic-placement-0", "member_id": 1, "client_urls": ["http://basic-placement-0:2379"], "health": true},
                    {"name": "basic-placement-1", "health": false}
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let members = client.members_health().await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members[0].health);
        assert!(members[1].client_urls.is_empty());

        let one = client.member_health("basic-placement-1").await.unwrap().unwrap();
        assert!(!one.health);
        assert!(client.member_health("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leader_and_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/leader"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "basic-placement-2"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/leader/transfer/basic-placement-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert_eq!(client.leader().await.unwrap().as_deref(), Some("basic-placement-2"));
        client.transfer_leader("basic-placement-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/stores"))
            .respond_with(ResponseTemplate::new(500).set_body_string("placement unavailable"))
            .mount(&server)
            .await;

        let err = client(&server).await.stores().await.unwrap_err();
        match err {
            ClientError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "placement unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stores_tolerate_partial_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/stores"))
            .and(query_param("state", "tombstone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 1,
                "stores": [{"store": {"id": 7, "address": "basic-storage-3.basic-storage-peer.default.svc:20160", "state_name": "Tombstone"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/stores"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 2,
                "stores": [
                    {"store": null, "status": {"leader_count": 3}},
                    {"store": {"id": 1, "address": "basic-storage-0.basic-storage-peer.default.svc:20160", "labels": {"zone": "a"}, "state_name": "Up"},
                     "status": {"leader_count": 4, "last_heartbeat": "2024-01-01T00:00:00Z"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let tombstones = client.tombstone_stores().await.unwrap();
        assert_eq!(tombstones.len(), 1);
        assert!(tombstones[0].status.is_none());

        let stores = client.stores().await.unwrap();
        assert_eq!(stores.len(), 2);
        assert!(stores[0].store.is_none());
        assert_eq!(stores[1].store.as_ref().unwrap().labels["zone"], "a");
    }

    #[tokio::test]
    async fn test_store_labels_and_location_labels() {
        let server = MockServer::start().await;
        let labels = BTreeMap::from([("zone".to_string(), "us-east-1a".to_string())]);
        Mock::given(method("POST"))
            .and(path("/api/v1/store/4/label"))
            .and(body_json(&labels))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/config/replicate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"location-labels": "zone, rack,host"})),
            )
            .mount(&server)
            .await;

        let client = client(&server).await;
        client.set_store_labels(4, &labels).await.unwrap();
        assert_eq!(
            client.location_labels().await.unwrap(),
            vec!["zone", "rack", "host"]
        );
    }

    #[tokio::test]
    async fn test_member_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/ready"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert!(!client.member_ready(&server.uri()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_member_and_store() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/members/name/basic-placement-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/store/9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server).await;
        client.delete_member("basic-placement-2").await.unwrap();
        client.delete_store(9).await.unwrap();
    }
}
