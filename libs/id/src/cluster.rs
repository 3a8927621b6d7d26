//! Cluster identity, component kinds and member naming.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IdError;

/// Ordinal of a replica within its replica set.
pub type Ordinal = u32;

/// The member types a cluster is made of.
///
/// Variants are declared in dependency order: a component may only depend on
/// components declared before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Consensus and placement tier. Owns cluster leadership.
    Placement,
    /// Replicated storage tier.
    Storage,
    /// Stateless SQL/connection proxy tier.
    Proxy,
}

impl ComponentKind {
    /// All kinds, in the order they must be reconciled.
    pub const ALL: [ComponentKind; 3] = [Self::Placement, Self::Storage, Self::Proxy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Placement => "placement",
            Self::Storage => "storage",
            Self::Proxy => "proxy",
        }
    }

    /// Components whose upgrades must finish before this one may report
    /// itself as upgrading.
    pub fn upstream(&self) -> &'static [ComponentKind] {
        match self {
            Self::Placement => &[],
            Self::Storage => &[Self::Placement],
            Self::Proxy => &[Self::Placement],
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placement" => Ok(Self::Placement),
            "storage" => Ok(Self::Storage),
            "proxy" => Ok(Self::Proxy),
            other => Err(IdError::UnknownComponent(other.to_string())),
        }
    }
}

/// Identity of one managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
    /// Cluster domain used when members are addressed across clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
}

impl ClusterIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            cluster_domain: None,
        }
    }

    pub fn with_cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = Some(domain.into());
        self
    }

    /// Name of the replica set backing `kind`.
    pub fn set_name(&self, kind: ComponentKind) -> String {
        format!("{}-{}", self.name, kind)
    }

    /// Name of the headless service that gives members stable addresses.
    pub fn peer_service_name(&self, kind: ComponentKind) -> String {
        format!("{}-{}-peer", self.name, kind)
    }

    /// Pod name of the replica at `ordinal`. This is also the member name.
    pub fn pod_name(&self, kind: ComponentKind, ordinal: Ordinal) -> String {
        format!("{}-{}-{}", self.name, kind, ordinal)
    }

    /// Fully qualified host of the replica at `ordinal`.
    pub fn member_host(&self, kind: ComponentKind, ordinal: Ordinal) -> String {
        let mut host = format!(
            "{}.{}.{}.svc",
            self.pod_name(kind, ordinal),
            self.peer_service_name(kind),
            self.namespace
        );
        if let Some(domain) = &self.cluster_domain {
            host.push('.');
            host.push_str(domain);
        }
        host
    }

    /// Whether `address` names a member of this cluster.
    ///
    /// Addresses without a namespace (bare member names) only have to match
    /// the cluster name.
    pub fn owns(&self, address: &MemberAddress) -> bool {
        if address.cluster != self.name {
            return false;
        }
        match &address.namespace {
            None => true,
            Some(ns) => ns == &self.namespace && address.cluster_domain == self.cluster_domain,
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A member address as reported by the cluster, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddress {
    pub pod_name: String,
    pub cluster: String,
    pub kind: ComponentKind,
    pub ordinal: Ordinal,
    pub namespace: Option<String>,
    pub cluster_domain: Option<String>,
    pub port: Option<u16>,
}

impl MemberAddress {
    /// Parse an address such as
    /// `basic-storage-1.basic-storage-peer.default.svc.cluster1.com:20160`,
    /// an URL wrapping one, or a bare member name such as `basic-placement-0`.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        if input.is_empty() {
            return Err(IdError::Empty);
        }

        let without_scheme = input
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(input);
        let authority = without_scheme.split('/').next().unwrap_or_default();

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| IdError::InvalidAddress(input.to_string()))?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        let labels: Vec<&str> = host.split('.').collect();
        let (pod_name, namespace, cluster_domain) = match labels.as_slice() {
            [pod] => (*pod, None, None),
            [pod, _service, namespace, "svc", domain @ ..] => {
                let domain = if domain.is_empty() {
                    None
                } else {
                    Some(domain.join("."))
                };
                (*pod, Some(namespace.to_string()), domain)
            }
            _ => return Err(IdError::InvalidAddress(input.to_string())),
        };

        let (cluster, kind, ordinal) = split_pod_name(pod_name)?;
        Ok(Self {
            pod_name: pod_name.to_string(),
            cluster,
            kind,
            ordinal,
            namespace,
            cluster_domain,
            port,
        })
    }

    /// Name that stays unique across clusters: `{pod}[.{namespace}[.{domain}]]`.
    pub fn qualified_name(&self) -> String {
        let mut name = self.pod_name.clone();
        for part in [&self.namespace, &self.cluster_domain].into_iter().flatten() {
            name.push('.');
            name.push_str(part);
        }
        name
    }
}

/// Split `{cluster}-{kind}-{ordinal}`. Cluster names may contain dashes.
fn split_pod_name(name: &str) -> Result<(String, ComponentKind, Ordinal), IdError> {
    let invalid = |reason| IdError::InvalidMemberName {
        name: name.to_string(),
        reason,
    };

    let (prefix, ordinal) = name.rsplit_once('-').ok_or_else(|| invalid("missing ordinal"))?;
    let ordinal = ordinal
        .parse::<Ordinal>()
        .map_err(|_| invalid("ordinal is not a number"))?;
    let (cluster, kind) = prefix
        .rsplit_once('-')
        .ok_or_else(|| invalid("missing component kind"))?;
    let kind = kind
        .parse::<ComponentKind>()
        .map_err(|_| invalid("unknown component kind"))?;
    if cluster.is_empty() {
        return Err(invalid("missing cluster name"));
    }

    Ok((cluster.to_string(), kind, ordinal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn identity() -> ClusterIdentity {
        ClusterIdentity::new("default", "basic")
    }

    #[test]
    fn test_pod_and_service_names() {
        let id = identity();
        assert_eq!(id.set_name(ComponentKind::Storage), "basic-storage");
        assert_eq!(id.pod_name(ComponentKind::Placement, 2), "basic-placement-2");
        assert_eq!(id.peer_service_name(ComponentKind::Proxy), "basic-proxy-peer");
        assert_eq!(
            id.member_host(ComponentKind::Storage, 1),
            "basic-storage-1.basic-storage-peer.default.svc"
        );
    }

    #[test]
    fn test_member_host_with_domain() {
        let id = identity().with_cluster_domain("cluster1.com");
        assert_eq!(
            id.member_host(ComponentKind::Storage, 0),
            "basic-storage-0.basic-storage-peer.default.svc.cluster1.com"
        );
    }

    #[test]
    fn test_parse_full_address() {
        let addr =
            MemberAddress::parse("basic-storage-1.basic-storage-peer.default.svc:20160").unwrap();
        assert_eq!(addr.pod_name, "basic-storage-1");
        assert_eq!(addr.cluster, "basic");
        assert_eq!(addr.kind, ComponentKind::Storage);
        assert_eq!(addr.ordinal, 1);
        assert_eq!(addr.namespace.as_deref(), Some("default"));
        assert_eq!(addr.cluster_domain, None);
        assert_eq!(addr.port, Some(20160));
        assert!(identity().owns(&addr));
    }

    #[test]
    fn test_parse_cross_cluster_address() {
        let addr = MemberAddress::parse(
            "basic-storage-1.basic-storage-peer.default.svc.cluster2.com:20160",
        )
        .unwrap();
        assert_eq!(addr.cluster_domain.as_deref(), Some("cluster2.com"));
        assert_eq!(addr.qualified_name(), "basic-storage-1.default.cluster2.com");
        assert!(!identity().with_cluster_domain("cluster1.com").owns(&addr));
        assert!(identity().with_cluster_domain("cluster2.com").owns(&addr));
    }

    #[test]
    fn test_parse_url_and_bare_name() {
        let addr = MemberAddress::parse(
            "http://my-db-placement-0.my-db-placement-peer.prod.svc:2379/health",
        )
        .unwrap();
        assert_eq!(addr.cluster, "my-db");
        assert_eq!(addr.kind, ComponentKind::Placement);

        let bare = MemberAddress::parse("basic-placement-3").unwrap();
        assert_eq!(bare.ordinal, 3);
        assert_eq!(bare.namespace, None);
        assert!(identity().owns(&bare));
    }

    #[test]
    fn test_parse_rejects_other_components() {
        let err = MemberAddress::parse("basic-columnar-1.basic-columnar-peer.default.svc:3930")
            .unwrap_err();
        assert!(matches!(err, IdError::InvalidMemberName { .. }));
        assert!(MemberAddress::parse("").is_err());
        assert!(MemberAddress::parse("basic-storage-x").is_err());
        assert!(MemberAddress::parse("a.b.c").is_err());
    }

    #[test]
    fn test_upstream_order() {
        for kind in ComponentKind::ALL {
            for upstream in kind.upstream() {
                assert!(upstream < &kind);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_member_host_parses_back(
            name in "[a-z][a-z0-9]{0,6}(-[a-z0-9]{1,4})?",
            kind_idx in 0usize..3,
            ordinal in 0u32..10_000,
        ) {
            let id = ClusterIdentity::new("ns", name.clone());
            let kind = ComponentKind::ALL[kind_idx];
            let host = format!("{}:20160", id.member_host(kind, ordinal));
            let addr = MemberAddress::parse(&host).unwrap();
            prop_assert_eq!(addr.cluster, name);
            prop_assert_eq!(addr.kind, kind);
            prop_assert_eq!(addr.ordinal, ordinal);
            prop_assert!(id.owns(&MemberAddress::parse(&host).unwrap()));
        }
    }
}
