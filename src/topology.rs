//! Cluster topology: configuration documents and key-to-node mapping
//!
//! The server publishes a JSON snapshot of the cluster on every change. The
//! decoder tolerates unknown fields; `rev` and `nodes` are required, and the
//! partition map is required for key/value buckets on every update after the
//! initial one (enforced by the consumers, not the parser).

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_VBUCKET_COUNT: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceType {
    KeyValue,
    Query,
    Search,
    Analytics,
    Views,
    #[default]
    Management,
    Eventing,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Views => "views",
            ServiceType::Management => "mgmt",
            ServiceType::Eventing => "eventing",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePorts {
    pub kv: Option<u16>,
    pub mgmt: Option<u16>,
    pub query: Option<u16>,
    pub search: Option<u16>,
    pub analytics: Option<u16>,
    pub views: Option<u16>,
    pub eventing: Option<u16>,
}

impl ServicePorts {
    pub fn get(&self, service: ServiceType) -> Option<u16> {
        match service {
            ServiceType::KeyValue => self.kv,
            ServiceType::Management => self.mgmt,
            ServiceType::Query => self.query,
            ServiceType::Search => self.search,
            ServiceType::Analytics => self.analytics,
            ServiceType::Views => self.views,
            ServiceType::Eventing => self.eventing,
        }
    }
}

/// Addresses of one node under a named network ("default" or an alternate).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddress {
    pub hostname: String,
    pub services_plain: ServicePorts,
    pub services_tls: ServicePorts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub index: usize,
    pub node_uuid: String,
    pub app_telemetry_path: Option<String>,
    /// Addresses keyed by network name; always contains `"default"`.
    pub addresses: HashMap<String, NodeAddress>,
}

impl Node {
    pub fn address_for(&self, network: &str) -> &NodeAddress {
        self.addresses
            .get(network)
            .or_else(|| self.addresses.get("default"))
            .expect("node always carries a default address")
    }

    pub fn hostname_for(&self, network: &str) -> &str {
        &self.address_for(network).hostname
    }

    pub fn port_or(&self, network: &str, service: ServiceType, tls: bool, fallback: u16) -> u16 {
        let address = self.address_for(network);
        let ports = if tls { &address.services_tls } else { &address.services_plain };
        ports.get(service).unwrap_or(fallback)
    }

    pub fn endpoint(&self, network: &str, service: ServiceType, tls: bool) -> Option<String> {
        let port = self.port_or(network, service, tls, 0);
        if port == 0 {
            return None;
        }
        Some(format!("{}:{}", self.hostname_for(network), port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VbucketMap {
    pub num_replicas: usize,
    /// 1024 entries of `[active, replica1, ...]`; -1 marks an absent owner.
    pub map: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterCapabilities {
    pub search: Vec<String>,
    pub query: Vec<String>,
}

impl ClusterCapabilities {
    pub fn has_scoped_search_indexes(&self) -> bool {
        self.search.iter().any(|c| c == "scopedIndexes")
    }

    pub fn has_vector_search(&self) -> bool {
        self.search.iter().any(|c| c == "vectorSearch")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub rev: u64,
    /// Accept this config even when the revision does not supersede.
    pub force: bool,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub nodes: Vec<Node>,
    pub vbmap: Option<VbucketMap>,
    pub cluster_capabilities: ClusterCapabilities,
    pub bucket_capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawAlternateAddress {
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    hostname: String,
    #[serde(default, rename = "nodeUuid")]
    node_uuid: String,
    #[serde(default, rename = "appTelemetryPath")]
    app_telemetry_path: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(default, rename = "alternateAddresses")]
    alternate_addresses: HashMap<String, RawAlternateAddress>,
}

#[derive(Debug, Deserialize)]
struct RawVbucketMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: usize,
    #[serde(default)]
    map: Vec<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct RawClusterCapabilities {
    #[serde(default)]
    search: Vec<String>,
    #[serde(default, rename = "n1ql")]
    query: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    rev: u64,
    name: Option<String>,
    uuid: Option<String>,
    nodes: Vec<RawNode>,
    #[serde(rename = "vbucketMap")]
    vbucket_map: Option<RawVbucketMap>,
    #[serde(default, rename = "clusterCapabilities")]
    cluster_capabilities: Option<RawClusterCapabilities>,
    #[serde(default, rename = "bucketCapabilities")]
    bucket_capabilities: Vec<String>,
}

fn split_ports(services: &HashMap<String, u16>) -> (ServicePorts, ServicePorts) {
    let mut plain = ServicePorts::default();
    let mut tls = ServicePorts::default();
    for (name, port) in services {
        match name.as_str() {
            "kv" => plain.kv = Some(*port),
            "kvTls" => tls.kv = Some(*port),
            "mgmt" => plain.mgmt = Some(*port),
            "mgmtTls" => tls.mgmt = Some(*port),
            "query" => plain.query = Some(*port),
            "queryTls" => tls.query = Some(*port),
            "search" => plain.search = Some(*port),
            "searchTls" => tls.search = Some(*port),
            "analytics" => plain.analytics = Some(*port),
            "analyticsTls" => tls.analytics = Some(*port),
            "views" => plain.views = Some(*port),
            "viewsTls" => tls.views = Some(*port),
            "eventing" => plain.eventing = Some(*port),
            "eventingTls" => tls.eventing = Some(*port),
            _ => {}
        }
    }
    (plain, tls)
}

impl Config {
    /// Parse a configuration document. `$HOST` placeholders are substituted
    /// with the hostname the document was fetched from.
    pub fn parse(text: &str, origin_hostname: &str) -> Result<Config> {
        let text = text.replace("$HOST", origin_hostname);
        let deserializer = &mut serde_json::Deserializer::from_str(&text);
        let raw: RawConfig = serde_path_to_error::deserialize(deserializer).map_err(|err| {
            Error::ParsingFailure(format!(
                "failed to deserialize field '{}': {}",
                err.path(),
                err.inner()
            ))
        })?;

        let nodes = raw
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let (services_plain, services_tls) = split_ports(&node.services);
                let mut addresses = HashMap::new();
                addresses.insert(
                    "default".to_string(),
                    NodeAddress { hostname: node.hostname.clone(), services_plain, services_tls },
                );
                for (network, alternate) in &node.alternate_addresses {
                    let (services_plain, services_tls) = split_ports(&alternate.services);
                    addresses.insert(
                        network.clone(),
                        NodeAddress {
                            hostname: alternate
                                .hostname
                                .clone()
                                .unwrap_or_else(|| node.hostname.clone()),
                            services_plain,
                            services_tls,
                        },
                    );
                }
                Node {
                    index,
                    node_uuid: node.node_uuid.clone(),
                    app_telemetry_path: node.app_telemetry_path.clone(),
                    addresses,
                }
            })
            .collect();

        Ok(Config {
            rev: raw.rev,
            force: false,
            name: raw.name,
            uuid: raw.uuid,
            nodes,
            vbmap: raw.vbucket_map.map(|m| VbucketMap { num_replicas: m.num_replicas, map: m.map }),
            cluster_capabilities: raw
                .cluster_capabilities
                .map(|c| ClusterCapabilities { search: c.search, query: c.query })
                .unwrap_or_default(),
            bucket_capabilities: raw.bucket_capabilities,
        })
    }

    pub fn supersedes(&self, other: &Config) -> bool {
        self.rev > other.rev
    }

    pub fn vbucket_count(&self) -> usize {
        self.vbmap.as_ref().map_or(DEFAULT_VBUCKET_COUNT, |m| m.map.len())
    }

    /// `vbmap[vbucket][replica]` when present and non-negative.
    pub fn server_by_vbucket(&self, vbucket: u16, replica_index: u32) -> Option<usize> {
        let map = &self.vbmap.as_ref()?.map;
        let owners = map.get(usize::from(vbucket))?;
        match owners.get(replica_index as usize) {
            Some(&owner) if owner >= 0 => Some(owner as usize),
            _ => None,
        }
    }

    /// Hash `key` to its partition and look up the owning node index.
    pub fn map_key(&self, key: &[u8], replica_index: u32) -> (u16, Option<usize>) {
        let count = self.vbucket_count();
        if count == 0 {
            return (0, None);
        }
        let vbucket = (crc32fast::hash(key) as usize % count) as u16;
        (vbucket, self.server_by_vbucket(vbucket, replica_index))
    }

    pub fn has_node_with_hostname(&self, network: &str, hostname: &str) -> bool {
        self.nodes.iter().any(|node| node.hostname_for(network) == hostname)
    }

    pub fn has_node(
        &self,
        network: &str,
        service: ServiceType,
        tls: bool,
        hostname: &str,
        port: u16,
    ) -> bool {
        self.nodes.iter().any(|node| {
            node.hostname_for(network) == hostname
                && node.port_or(network, service, tls, 0) == port
        })
    }

    /// Determine the network to use by matching the bootstrap hostname
    /// against each node's addresses. Prefers `default` on a match.
    pub fn select_network(&self, bootstrap_hostname: &str) -> String {
        for node in &self.nodes {
            if node.hostname_for("default") == bootstrap_hostname {
                return "default".to_string();
            }
        }
        for node in &self.nodes {
            for (network, address) in &node.addresses {
                if network != "default" && address.hostname == bootstrap_hostname {
                    return network.clone();
                }
            }
        }
        "default".to_string()
    }

    pub fn has_bucket_capability(&self, capability: &str) -> bool {
        self.bucket_capabilities.iter().any(|c| c == capability)
    }
}

/// Nodes present in `next` but not in `current`, compared by hostname and
/// management port.
pub fn diff_nodes<'a>(current: &[Node], next: &'a [Node], network: &str) -> Vec<&'a Node> {
    next.iter()
        .filter(|candidate| {
            !current.iter().any(|known| {
                known.hostname_for(network) == candidate.hostname_for(network)
                    && known.port_or(network, ServiceType::Management, false, 0)
                        == candidate.port_or(network, ServiceType::Management, false, 0)
            })
        })
        .collect()
}

/// WebSocket endpoint advertised by one node for application telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryAddress {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub node_uuid: Option<String>,
}

/// Candidate telemetry endpoints, one per node that exposes the path.
pub fn app_telemetry_addresses(config: &Config, tls: bool, network: &str) -> Vec<TelemetryAddress> {
    config
        .nodes
        .iter()
        .filter_map(|node| {
            let path = node.app_telemetry_path.clone()?;
            let port = node.port_or(network, ServiceType::Management, tls, 0);
            if port == 0 {
                return None;
            }
            Some(TelemetryAddress {
                hostname: node.hostname_for(network).to_string(),
                port,
                path,
                node_uuid: if node.node_uuid.is_empty() {
                    None
                } else {
                    Some(node.node_uuid.clone())
                },
            })
        })
        .collect()
}
