//! Replica set and cluster state persistence.
//!
//! The operator reads replica sets through [`ReplicaSetDriver`] and writes
//! its decisions back through it. [`FileReplicaSetDriver`] keeps everything
//! as JSON under a state directory:
//!
//! ```text
//! {state_dir}/{namespace}/{cluster}/topology.json
//! {state_dir}/{namespace}/{cluster}/{kind}.json
//! {state_dir}/{namespace}/{cluster}/status.json
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_id::{ClusterIdentity, ComponentKind};
use tessera_reconcile::SpecHash;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::member::ClusterStatus;
use crate::replica_set::{ReplicaSet, ReplicaSetStatus};
use crate::topology::Topology;

const TOPOLOGY_FILE: &str = "topology.json";
const STATUS_FILE: &str = "status.json";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Observed replica sets in, desired replica sets out.
#[async_trait]
pub trait ReplicaSetDriver: Send + Sync {
    async fn observe(
        &self,
        identity: &ClusterIdentity,
        kind: ComponentKind,
    ) -> Result<Option<ReplicaSet>, DriverError>;

    async fn apply(
        &self,
        identity: &ClusterIdentity,
        kind: ComponentKind,
        desired: &ReplicaSet,
    ) -> Result<(), DriverError>;
}

/// Declared topologies and persisted status.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn topologies(&self) -> Result<Vec<Topology>, DriverError>;

    async fn load_status(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<BTreeMap<ComponentKind, ClusterStatus>, DriverError>;

    async fn save_status(
        &self,
        identity: &ClusterIdentity,
        status: &BTreeMap<ComponentKind, ClusterStatus>,
    ) -> Result<(), DriverError>;
}

pub struct FileReplicaSetDriver {
    state_dir: PathBuf,
}

impl FileReplicaSetDriver {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn cluster_dir(&self, identity: &ClusterIdentity) -> PathBuf {
        self.state_dir.join(&identity.namespace).join(&identity.name)
    }

    fn set_path(&self, identity: &ClusterIdentity, kind: ComponentKind) -> PathBuf {
        self.cluster_dir(identity).join(format!("{kind}.json"))
    }

    pub async fn save_topology(&self, topology: &Topology) -> Result<(), DriverError> {
        write_json(
            &self.cluster_dir(&topology.identity).join(TOPOLOGY_FILE),
            topology,
        )
        .await
    }
}

#[async_trait]
impl ReplicaSetDriver for FileReplicaSetDriver {
    async fn observe(
        &self,
        identity: &ClusterIdentity,
        kind: ComponentKind,
    ) -> Result<Option<ReplicaSet>, DriverError> {
        let Some(mut set) = read_json::<ReplicaSet>(&self.set_path(identity, kind)).await? else {
            return Ok(None);
        };

        // A rollout is complete once every live pod runs the update revision.
        let live = set.live_ordinals().ok();
        let pods = &set.pods;
        if let (Some(status), Some(live)) = (set.status.as_mut(), live) {
            let finished = status.current_revision != status.update_revision
                && live.iter().all(|ordinal| {
                    pods.get(ordinal).and_then(|pod| pod.revision.as_deref())
                        == Some(status.update_revision.as_str())
                });
            if finished {
                status.current_revision = status.update_revision.clone();
            }
        }
        Ok(Some(set))
    }

    async fn apply(
        &self,
        identity: &ClusterIdentity,
        kind: ComponentKind,
        desired: &ReplicaSet,
    ) -> Result<(), DriverError> {
        let path = self.set_path(identity, kind);
        let stored = read_json::<ReplicaSet>(&path).await?;

        let mut next = desired.clone();
        let revision = SpecHash::from_json(&next.template).revision_name(&next.name);
        let template_changed = stored
            .as_ref()
            .is_none_or(|s| SpecHash::from_json(&s.template) != SpecHash::from_json(&next.template));

        match next.status.as_mut() {
            Some(status) => {
                if template_changed {
                    status.update_revision = revision;
                }
                status.replicas = next.replicas;
            }
            None => {
                next.status = Some(ReplicaSetStatus {
                    current_revision: revision.clone(),
                    update_revision: revision,
                    replicas: next.replicas,
                    ready_replicas: 0,
                });
            }
        }

        info!(
            path = %path.display(),
            replicas = next.replicas,
            partition = ?next.partition(),
            template_changed,
            "applying replica set"
        );
        write_json(&path, &next).await
    }
}

#[async_trait]
impl ClusterStore for FileReplicaSetDriver {
    async fn topologies(&self) -> Result<Vec<Topology>, DriverError> {
        let mut topologies = Vec::new();
        for namespace in list_dirs(&self.state_dir).await? {
            for cluster in list_dirs(&namespace).await? {
                let path = cluster.join(TOPOLOGY_FILE);
                match read_json::<Topology>(&path).await {
                    Ok(Some(topology)) => topologies.push(topology),
                    Ok(None) => debug!(dir = %cluster.display(), "no topology, skipping"),
                    Err(e) => warn!(error = %e, "skipping unreadable topology"),
                }
            }
        }
        Ok(topologies)
    }

    async fn load_status(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<BTreeMap<ComponentKind, ClusterStatus>, DriverError> {
        Ok(read_json(&self.cluster_dir(identity).join(STATUS_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn save_status(
        &self,
        identity: &ClusterIdentity,
        status: &BTreeMap<ComponentKind, ClusterStatus>,
    ) -> Result<(), DriverError> {
        write_json(&self.cluster_dir(identity).join(STATUS_FILE), status).await
    }
}

async fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, DriverError> {
    let io_err = |source| DriverError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        if entry.file_type().await.map_err(io_err)?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DriverError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DriverError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| DriverError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Write through a temporary file so readers never see a partial document.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), DriverError> {
    let io_err = |source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    };

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| DriverError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}
