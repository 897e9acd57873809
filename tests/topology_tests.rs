//! Topology configuration tests: parsing, key mapping, network selection

use cellar_client::topology::{Config, ServiceType, app_telemetry_addresses, diff_nodes};
use pretty_assertions::assert_eq;
use serde_json::json;

fn sample_config() -> String {
    json!({
        "rev": 107,
        "name": "travel",
        "uuid": "f0a3bc6e",
        "nodes": [
            {
                "hostname": "10.0.0.1",
                "nodeUuid": "uuid-a",
                "appTelemetryPath": "/_telemetry",
                "services": {"kv": 11210, "kvTls": 11207, "mgmt": 8091, "mgmtTls": 18091, "query": 8093},
                "alternateAddresses": {
                    "external": {
                        "hostname": "203.0.113.1",
                        "services": {"kv": 21210, "mgmt": 28091}
                    }
                }
            },
            {
                "hostname": "10.0.0.2",
                "nodeUuid": "uuid-b",
                "services": {"kv": 11210, "mgmt": 8091}
            }
        ],
        "vbucketMap": {
            "numReplicas": 1,
            "map": (0..1024).map(|i| vec![(i % 2) as i64, ((i + 1) % 2) as i64]).collect::<Vec<_>>()
        },
        "clusterCapabilities": {"search": ["scopedIndexes", "vectorSearch"]},
        "bucketCapabilities": ["rangeScan", "nonDedupedHistory"],
        "someFutureField": {"ignored": true}
    })
    .to_string()
}

#[test]
fn parses_required_and_unknown_fields() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    assert_eq!(config.rev, 107);
    assert_eq!(config.name.as_deref(), Some("travel"));
    assert_eq!(config.nodes.len(), 2);
    assert_eq!(config.nodes[0].index, 0);
    assert_eq!(config.nodes[1].index, 1);
    assert_eq!(config.vbucket_count(), 1024);
    assert!(config.cluster_capabilities.has_scoped_search_indexes());
    assert!(config.cluster_capabilities.has_vector_search());
    assert!(config.has_bucket_capability("rangeScan"));
}

#[test]
fn missing_required_fields_fail_with_path() {
    let error = Config::parse(r#"{"nodes": []}"#, "h").unwrap_err();
    let message = error.to_string();
    assert!(message.contains("rev"), "unexpected message: {message}");
}

#[test]
fn host_placeholder_is_substituted() {
    let text = r#"{"rev": 1, "nodes": [{"hostname": "$HOST", "services": {"kv": 11210}}]}"#;
    let config = Config::parse(text, "db1.example.com").unwrap();
    assert_eq!(config.nodes[0].hostname_for("default"), "db1.example.com");
}

#[test]
fn map_key_follows_crc32_mod_partitions() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    for key in [&b"airline_10"[..], b"hotel_3", b""] {
        let expected_partition = (crc32fast::hash(key) as usize % 1024) as u16;
        let (partition, server) = config.map_key(key, 0);
        assert_eq!(partition, expected_partition);
        assert_eq!(server, Some(usize::from(expected_partition % 2)));
        // replica copies live on the other node
        let (_, replica) = config.map_key(key, 1);
        assert_eq!(replica, Some(usize::from((expected_partition + 1) % 2)));
    }
}

#[test]
fn absent_vbmap_entries_mean_no_owner() {
    let text = r#"{
        "rev": 3,
        "nodes": [{"hostname": "a", "services": {"kv": 11210}}],
        "vbucketMap": {"numReplicas": 1, "map": [[0, -1], [-1, 0]]}
    }"#;
    let config = Config::parse(text, "a").unwrap();
    assert_eq!(config.server_by_vbucket(0, 0), Some(0));
    assert_eq!(config.server_by_vbucket(0, 1), None);
    assert_eq!(config.server_by_vbucket(1, 0), None);
    assert_eq!(config.server_by_vbucket(7, 0), None);
}

#[test]
fn newer_revision_supersedes() {
    let older = Config::parse(&sample_config(), "h").unwrap();
    let mut newer = older.clone();
    newer.rev = 108;
    assert!(newer.supersedes(&older));
    assert!(!older.supersedes(&newer));
    assert!(!older.supersedes(&older.clone()));
}

#[test]
fn alternate_network_addresses_resolve() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    let node = &config.nodes[0];
    assert_eq!(node.hostname_for("external"), "203.0.113.1");
    assert_eq!(node.port_or("external", ServiceType::KeyValue, false, 0), 21210);
    // nodes without the alternate fall back to default
    assert_eq!(config.nodes[1].hostname_for("external"), "10.0.0.2");
    // unknown service on the alternate yields the fallback
    assert_eq!(node.port_or("external", ServiceType::Query, false, 0), 0);
}

#[test]
fn select_network_prefers_default_on_match() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    assert_eq!(config.select_network("10.0.0.1"), "default");
    assert_eq!(config.select_network("203.0.113.1"), "external");
    assert_eq!(config.select_network("somewhere.else"), "default");
}

#[test]
fn diff_nodes_keys_on_hostname_and_management_port() {
    let current = Config::parse(&sample_config(), "h").unwrap();
    let next_text = json!({
        "rev": 108,
        "nodes": [
            {"hostname": "10.0.0.2", "services": {"kv": 11210, "mgmt": 8091}},
            {"hostname": "10.0.0.3", "services": {"kv": 11210, "mgmt": 8091}}
        ],
        "vbucketMap": {"numReplicas": 0, "map": [[0]]}
    })
    .to_string();
    let next = Config::parse(&next_text, "h").unwrap();

    let added = diff_nodes(&current.nodes, &next.nodes, "default");
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].hostname_for("default"), "10.0.0.3");

    let removed = diff_nodes(&next.nodes, &current.nodes, "default");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].hostname_for("default"), "10.0.0.1");
}

#[test]
fn telemetry_addresses_require_path_and_port() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    let addresses = app_telemetry_addresses(&config, false, "default");
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].hostname, "10.0.0.1");
    assert_eq!(addresses[0].port, 8091);
    assert_eq!(addresses[0].path, "/_telemetry");
    assert_eq!(addresses[0].node_uuid.as_deref(), Some("uuid-a"));

    let tls_addresses = app_telemetry_addresses(&config, true, "default");
    assert_eq!(tls_addresses[0].port, 18091);
}

#[test]
fn has_node_checks_service_endpoint() {
    let config = Config::parse(&sample_config(), "10.0.0.1").unwrap();
    assert!(config.has_node("default", ServiceType::Query, false, "10.0.0.1", 8093));
    assert!(!config.has_node("default", ServiceType::Query, false, "10.0.0.2", 8093));
    assert!(config.has_node_with_hostname("default", "10.0.0.2"));
    assert!(!config.has_node_with_hostname("default", "10.9.9.9"));
}
