//! Canned topology documents for tests

use serde_json::json;

/// A single-node topology whose key/value service listens on `kv_port`.
/// All 1024 partitions map to node 0.
pub fn single_node_config(rev: u64, hostname: &str, kv_port: u16) -> String {
    let map: Vec<Vec<i64>> = (0..1024).map(|_| vec![0]).collect();
    json!({
        "rev": rev,
        "name": "default",
        "uuid": "3c8a3bc6-4e2f-4d8a-9c2f-000000000000",
        "nodes": [
            {
                "hostname": hostname,
                "nodeUuid": "node-uuid-0",
                "services": {
                    "kv": kv_port,
                    "mgmt": 8091
                }
            }
        ],
        "vbucketMap": {
            "numReplicas": 0,
            "map": map
        },
        "bucketCapabilities": ["rangeScan"]
    })
    .to_string()
}

/// A two-node topology with an explicit partition map.
pub fn two_node_config(
    rev: u64,
    first: (&str, u16),
    second: (&str, u16),
    map: Vec<Vec<i64>>,
) -> String {
    json!({
        "rev": rev,
        "name": "default",
        "nodes": [
            {
                "hostname": first.0,
                "nodeUuid": "node-uuid-0",
                "services": { "kv": first.1, "mgmt": 8091 }
            },
            {
                "hostname": second.0,
                "nodeUuid": "node-uuid-1",
                "services": { "kv": second.1, "mgmt": 8091 }
            }
        ],
        "vbucketMap": {
            "numReplicas": 0,
            "map": map
        }
    })
    .to_string()
}

/// Topology advertising HTTP services on several nodes.
pub fn http_services_config(rev: u64, nodes: &[(&str, u16, &str)]) -> String {
    let nodes: Vec<serde_json::Value> = nodes
        .iter()
        .enumerate()
        .map(|(index, (hostname, port, service))| {
            json!({
                "hostname": hostname,
                "nodeUuid": format!("node-uuid-{index}"),
                "services": { (*service): port, "mgmt": 8091 }
            })
        })
        .collect();
    json!({ "rev": rev, "nodes": nodes }).to_string()
}
