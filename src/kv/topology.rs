//! Cluster topology: the bucket config JSON model, per-node service ports,
//! alternate-address (network) selection and the collections manifest.

use super::partition::PartitionMap;
use crate::types::ServiceType;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Placeholder the server leaves in configs for "the address you reached me
/// on". Substituted before parsing.
const HOST_PLACEHOLDER: &str = "$HOST";

/// The network name that means "use the node's primary address"
pub const DEFAULT_NETWORK: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    #[error("config payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config payload is not valid UTF-8")]
    Encoding,
}

/// Raw bucket/cluster config as published by the server (terse form).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub rev: i64,
    #[serde(default, rename = "revEpoch")]
    pub rev_epoch: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "nodesExt")]
    pub nodes_ext: Vec<NodeExt>,
    #[serde(default, rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketServerMap>,
    /// Hex-encoded manifest uid, present once the bucket has a non-default
    /// collection layout
    #[serde(default, rename = "collectionsManifestUid")]
    pub collections_manifest_uid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeExt {
    #[serde(default)]
    pub services: HashMap<String, u16>,
    #[serde(default, rename = "thisNode")]
    pub this_node: bool,
    /// Absent for single-node clusters; the origin host fills in
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default, rename = "alternateAddresses")]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AlternateAddress {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VBucketServerMap {
    #[serde(default, rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: u16,
    #[serde(default, rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i16>>,
}

/// Key into the `services`/`ports` maps for a service/TLS pair
fn service_key(service: ServiceType, tls: bool) -> &'static str {
    match (service, tls) {
        (ServiceType::KeyValue, false) => "kv",
        (ServiceType::KeyValue, true) => "kvSSL",
        (ServiceType::Management, false) => "mgmt",
        (ServiceType::Management, true) => "mgmtSSL",
        (ServiceType::View, false) => "capi",
        (ServiceType::View, true) => "capiSSL",
        (ServiceType::Query, false) => "n1ql",
        (ServiceType::Query, true) => "n1qlSSL",
        (ServiceType::Search, false) => "fts",
        (ServiceType::Search, true) => "ftsSSL",
        (ServiceType::Analytics, false) => "cbas",
        (ServiceType::Analytics, true) => "cbasSSL",
        (ServiceType::Eventing, false) => "eventingAdminPort",
        (ServiceType::Eventing, true) => "eventingSSL",
    }
}

impl ClusterConfig {
    /// Parse a config payload, substituting the `$HOST` placeholder with the
    /// address the config arrived from.
    pub fn parse(payload: &[u8], origin_host: &str) -> Result<Self, ConfigParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ConfigParseError::Encoding)?;
        let substituted = text.replace(HOST_PLACEHOLDER, origin_host);
        Ok(serde_json::from_str(&substituted)?)
    }

    pub fn version(&self) -> (i64, i64) {
        (self.rev_epoch, self.rev)
    }

    /// Partition table carried by this config, if the bucket is vbucket-based
    pub fn partition_map(&self) -> Option<PartitionMap> {
        let map = self.vbucket_server_map.as_ref()?;
        Some(PartitionMap {
            epoch: self.rev_epoch,
            revision: self.rev,
            entries: map.vbucket_map.clone(),
        })
    }

    /// Node list with the origin host substituted for absent hostnames
    pub fn topology(&self, origin_host: &str) -> Topology {
        let nodes = self
            .nodes_ext
            .iter()
            .map(|ext| Node {
                hostname: ext.hostname.clone().unwrap_or_else(|| origin_host.to_string()),
                this_node: ext.this_node,
                services: ext.services.clone(),
                alternate: ext.alternate_addresses.clone(),
            })
            .collect();
        Topology {
            epoch: self.rev_epoch,
            revision: self.rev,
            bucket: self.name.clone(),
            nodes,
        }
    }

    /// Manifest uid from the config, decoded from its hex form
    pub fn manifest_uid(&self) -> Option<u64> {
        let raw = self.collections_manifest_uid.as_deref()?;
        u64::from_str_radix(raw, 16).ok()
    }
}

/// One data-service node. Identity is positional within the topology; the
/// index in [`Topology::nodes`] is what partition map rows reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub hostname: String,
    pub this_node: bool,
    pub services: HashMap<String, u16>,
    pub alternate: HashMap<String, AlternateAddress>,
}

impl Node {
    /// Hostname on the given network, falling back to the primary address
    /// when the network is unknown
    pub fn hostname_for(&self, network: &str) -> &str {
        if network == DEFAULT_NETWORK {
            return &self.hostname;
        }
        match self.alternate.get(network).and_then(|alt| alt.hostname.as_deref()) {
            Some(hostname) => hostname,
            None => {
                warn!(network, "requested network not found, falling back to default host");
                &self.hostname
            }
        }
    }

    /// Service port on the given network. Alternate addresses may omit
    /// ports, in which case the primary port applies.
    pub fn port_for(&self, network: &str, service: ServiceType, tls: bool) -> Option<u16> {
        let key = service_key(service, tls);
        if network != DEFAULT_NETWORK {
            if let Some(alt) = self.alternate.get(network) {
                if let Some(&port) = alt.ports.get(key) {
                    return Some(port);
                }
            }
        }
        self.services.get(key).copied()
    }

    /// `host:port` endpoint for a service, if the node runs it
    pub fn endpoint_for(&self, network: &str, service: ServiceType, tls: bool) -> Option<String> {
        let port = self.port_for(network, service, tls)?;
        Some(format!("{}:{}", self.hostname_for(network), port))
    }

    pub fn runs_service(&self, service: ServiceType, tls: bool) -> bool {
        self.services.contains_key(service_key(service, tls))
    }
}

/// An accepted topology revision: ordered node list plus the version pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub epoch: i64,
    pub revision: i64,
    pub bucket: String,
    pub nodes: Vec<Node>,
}

impl Topology {
    pub fn version(&self) -> (i64, i64) {
        (self.epoch, self.revision)
    }

    /// Pick the effective network for this client: prefer the network whose
    /// address matches the hostname the bootstrap actually reached. Sticky
    /// for the lifetime of the cluster object, so this runs once.
    pub fn select_network(&self, bootstrap_hostname: &str) -> String {
        for node in &self.nodes {
            if !node.this_node {
                continue;
            }
            if node.hostname == bootstrap_hostname {
                return DEFAULT_NETWORK.to_string();
            }
            for (network, alt) in &node.alternate {
                if alt.hostname.as_deref() == Some(bootstrap_hostname) {
                    return network.clone();
                }
            }
        }
        DEFAULT_NETWORK.to_string()
    }
}

// =============================================================================
// COLLECTIONS MANIFEST
// =============================================================================

/// Outcome of resolving a scope/collection pair against the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionLookup {
    /// The numeric uid to prefix onto wire keys
    Found(u32),
    /// The scope does not exist in this manifest
    ScopeNotFound,
    /// The scope exists but the collection does not (possibly not yet
    /// propagated, hence retryable)
    CollectionNotFound,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionsManifest {
    #[serde(default, deserialize_with = "hex_u64")]
    pub uid: u64,
    #[serde(default)]
    pub scopes: Vec<ManifestScope>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestScope {
    pub name: String,
    #[serde(default, deserialize_with = "hex_u64")]
    pub uid: u64,
    #[serde(default)]
    pub collections: Vec<ManifestCollection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestCollection {
    pub name: String,
    #[serde(default, deserialize_with = "hex_u64")]
    pub uid: u64,
    #[serde(default, rename = "maxTTL")]
    pub max_ttl: Option<i64>,
}

/// Manifest uids travel as hex strings
fn hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    u64::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
}

impl CollectionsManifest {
    pub fn parse(payload: &[u8]) -> Result<Self, ConfigParseError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Manifest for buckets that predate collections: only `_default._default`
    pub fn default_manifest() -> Self {
        Self {
            uid: 0,
            scopes: vec![ManifestScope {
                name: crate::types::DEFAULT_NAMESPACE.into(),
                uid: 0,
                collections: vec![ManifestCollection {
                    name: crate::types::DEFAULT_NAMESPACE.into(),
                    uid: 0,
                    max_ttl: None,
                }],
            }],
        }
    }

    pub fn resolve(&self, scope: &str, collection: &str) -> CollectionLookup {
        let Some(scope) = self.scopes.iter().find(|s| s.name == scope) else {
            return CollectionLookup::ScopeNotFound;
        };
        match scope.collections.iter().find(|c| c.name == collection) {
            Some(c) => CollectionLookup::Found(c.uid as u32),
            None => CollectionLookup::CollectionNotFound,
        }
    }
}
