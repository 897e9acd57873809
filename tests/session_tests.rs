//! End-to-end tests against the in-process mock node

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellar_client::binary::opcode::{Opcode, Status};
use cellar_client::crud::{KeyOptions, StoreOptions};
use cellar_client::error::Error;
use cellar_client::range_scan::{
    RangeScan, RangeScanContinueOptions, RangeScanCreateOptions, ScanType,
};
use cellar_client::testing::{MockNode, ScriptedReply};
use cellar_client::{Cluster, Credentials};
use pretty_assertions::assert_eq;

fn scoped(scope: &str, collection: &str) -> KeyOptions {
    KeyOptions::builder()
        .scope_name(scope.to_string())
        .collection_name(collection.to_string())
        .build()
}

#[tokio::test]
async fn bootstrap_negotiates_scram_and_serves_reads() {
    let node = MockNode::start().await;
    node.put_document(b"greeting", br#"{"hello":"world"}"#);

    let bucket = node.bucket("default").await;
    let result = bucket.get(b"greeting".to_vec(), KeyOptions::default()).await.unwrap();
    assert_eq!(result.value, br#"{"hello":"world"}"#);
    assert!(result.cas > 0);

    // bootstrap went through the full chain once
    assert_eq!(node.request_count(Opcode::Hello), 1);
    assert_eq!(node.request_count(Opcode::SaslAuth), 1);
    assert_eq!(node.request_count(Opcode::SaslStep), 1);
    assert_eq!(node.request_count(Opcode::SelectBucket), 1);
    assert_eq!(node.request_count(Opcode::GetClusterConfig), 1);
}

#[tokio::test]
async fn upsert_round_trips_through_the_store() {
    let node = MockNode::start().await;
    let bucket = node.bucket("default").await;

    let mutation = bucket
        .upsert(b"doc-1".to_vec(), br#"{"n":1}"#.to_vec(), StoreOptions::default())
        .await
        .unwrap();
    assert!(mutation.cas > 0);
    assert_eq!(node.document(b"doc-1"), Some(br#"{"n":1}"#.to_vec()));

    let fetched = bucket.get(b"doc-1".to_vec(), KeyOptions::default()).await.unwrap();
    assert_eq!(fetched.value, br#"{"n":1}"#);
}

#[tokio::test]
async fn missing_documents_surface_not_found() {
    let node = MockNode::start().await;
    let bucket = node.bucket("default").await;
    let error = bucket.get(b"nope".to_vec(), KeyOptions::default()).await.unwrap_err();
    assert_eq!(error, Error::DocumentNotFound);
}

#[tokio::test]
async fn concurrent_upserts_coalesce_collection_resolution() {
    let node = MockNode::start().await;
    node.define_collection("inventory", "airline", 42);
    let bucket = node.bucket("default").await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let bucket = bucket.clone();
        tasks.push(tokio::spawn(async move {
            let options = StoreOptions::builder()
                .scope_name("inventory".to_string())
                .collection_name("airline".to_string())
                .build();
            bucket
                .upsert(format!("airline_{i}").into_bytes(), b"{}".to_vec(), options)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // ten writers, exactly one id probe on the wire
    assert_eq!(node.request_count(Opcode::GetCollectionId), 1);
    let ids = node.seen_collection_ids();
    assert_eq!(ids.len(), 10);
    assert!(ids.iter().all(|id| *id == 42), "ids: {ids:?}");
}

#[tokio::test]
async fn cached_collection_ids_skip_the_probe() {
    let node = MockNode::start().await;
    node.define_collection("inventory", "hotel", 8);
    let bucket = node.bucket("default").await;

    for _ in 0..3 {
        bucket
            .get(b"hotel_1".to_vec(), scoped("inventory", "hotel"))
            .await
            .unwrap_err();
    }
    assert_eq!(node.request_count(Opcode::GetCollectionId), 1);
    assert_eq!(node.request_count(Opcode::Get), 3);
}

#[tokio::test]
async fn not_my_vbucket_retries_and_succeeds() {
    let node = MockNode::start().await;
    node.put_document(b"moved", b"found me");
    let bucket = node.bucket("default").await;

    // first attempt bounces with not_my_vbucket; the retry hits the store
    node.script_reply(
        Opcode::Get,
        vec![ScriptedReply::with_status(Status::NotMyVbucket)],
    );

    let result = bucket.get(b"moved".to_vec(), KeyOptions::default()).await.unwrap();
    assert_eq!(result.value, b"found me");
    assert_eq!(node.request_count(Opcode::Get), 2);
}

#[tokio::test]
async fn temporary_failures_back_off_and_retry() {
    let node = MockNode::start().await;
    node.put_document(b"busy", b"eventually");
    let bucket = node.bucket("default").await;

    node.script_reply(
        Opcode::Get,
        vec![ScriptedReply::with_status(Status::TemporaryFailure)],
    );
    let result = bucket.get(b"busy".to_vec(), KeyOptions::default()).await.unwrap();
    assert_eq!(result.value, b"eventually");
}

#[tokio::test]
async fn slow_reads_time_out_unambiguously() {
    let node = MockNode::start().await;
    node.put_document(b"slow", b"zzz");
    node.delay_responses(Opcode::Get, Duration::from_millis(500));
    let bucket = node.bucket("default").await;

    let options = KeyOptions::builder().timeout(Some(Duration::from_millis(50))).build();
    let error = bucket.get(b"slow".to_vec(), options).await.unwrap_err();
    assert_eq!(error, Error::UnambiguousTimeout);
}

#[tokio::test]
async fn slow_mutations_time_out_ambiguously() {
    let node = MockNode::start().await;
    node.delay_responses(Opcode::Set, Duration::from_millis(500));
    let bucket = node.bucket("default").await;

    let options = StoreOptions::builder().timeout(Some(Duration::from_millis(50))).build();
    let error = bucket.upsert(b"slow".to_vec(), b"v".to_vec(), options).await.unwrap_err();
    assert_eq!(error, Error::AmbiguousTimeout);
}

#[tokio::test]
async fn range_scan_streams_batches_until_complete() {
    let node = MockNode::start().await;
    let bucket = node.bucket("default").await;

    let scan_uuid = vec![9u8; 16];
    node.script_reply(
        Opcode::RangeScanCreate,
        vec![ScriptedReply { value: scan_uuid.clone(), ..Default::default() }],
    );

    // three intermediate batches and a terminal more/complete pair
    let batch = |keys: &[&str]| -> ScriptedReply {
        let mut value = Vec::new();
        for key in keys {
            value.extend_from_slice(&cellar_client::binary::leb128::encode(key.len() as u64));
            value.extend_from_slice(key.as_bytes());
        }
        ScriptedReply { extras: 0u32.to_be_bytes().to_vec(), value, ..Default::default() }
    };
    node.script_reply(
        Opcode::RangeScanContinue,
        vec![
            batch(&["a1", "a2"]),
            batch(&["b1"]),
            ScriptedReply {
                status: Status::RangeScanMore,
                extras: 0u32.to_be_bytes().to_vec(),
                value: Vec::new(),
                ..Default::default()
            },
        ],
    );
    node.script_reply(
        Opcode::RangeScanContinue,
        vec![
            batch(&["c1", "c2", "c3"]),
            ScriptedReply {
                status: Status::RangeScanComplete,
                extras: 0u32.to_be_bytes().to_vec(),
                value: Vec::new(),
                ..Default::default()
            },
        ],
    );

    let create = RangeScanCreateOptions::builder()
        .scan_type(ScanType::Range(RangeScan::default()))
        .ids_only(true)
        .build();
    let created = bucket.range_scan_create(0, create).await.unwrap();
    assert_eq!(created.scan_uuid, scan_uuid);
    assert!(created.ids_only);

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let first = bucket
        .range_scan_continue(
            &created.scan_uuid,
            0,
            RangeScanContinueOptions::builder().batch_item_limit(100).build(),
            Box::new(move |item| sink.lock().unwrap().push(item.key)),
        )
        .await
        .unwrap();
    assert!(first.more);
    assert!(!first.complete);

    let sink = collected.clone();
    let second = bucket
        .range_scan_continue(
            &created.scan_uuid,
            0,
            RangeScanContinueOptions::builder().batch_item_limit(100).build(),
            Box::new(move |item| sink.lock().unwrap().push(item.key)),
        )
        .await
        .unwrap();
    assert!(second.complete);

    let keys = collected.lock().unwrap();
    assert_eq!(
        *keys,
        vec![
            b"a1".to_vec(),
            b"a2".to_vec(),
            b"b1".to_vec(),
            b"c1".to_vec(),
            b"c2".to_vec(),
            b"c3".to_vec()
        ]
    );
}

#[tokio::test]
async fn scan_uuid_must_be_sixteen_bytes() {
    let node = MockNode::start().await;
    let bucket = node.bucket("default").await;
    let error = bucket
        .range_scan_continue(
            b"short",
            0,
            RangeScanContinueOptions::builder().build(),
            Box::new(|_| {}),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));
    assert!(matches!(
        bucket.range_scan_cancel(b"short", 0).await.unwrap_err(),
        Error::InvalidArgument(_)
    ));
}

#[tokio::test]
async fn vbmap_less_updates_only_initialize() {
    use cellar_client::telemetry::meter::AppTelemetryMeter;
    use cellar_client::topology::Config;
    use cellar_client::{Bucket, ClusterOptions};

    let bucket = Bucket::new(
        "test-client",
        "default",
        ClusterOptions::default(),
        MockNode::credentials(),
        None,
        vec![("127.0.0.1".to_string(), 1)],
        AppTelemetryMeter::new(),
    );

    let bare = |rev: u64| -> Config {
        let text = format!(
            r#"{{"rev": {rev}, "nodes": [{{"hostname": "127.0.0.1", "services": {{"kv": 1, "mgmt": 2}}}}]}}"#
        );
        Config::parse(&text, "127.0.0.1").unwrap()
    };
    let with_map = |rev: u64| -> Config {
        let text = format!(
            r#"{{"rev": {rev}, "nodes": [{{"hostname": "127.0.0.1", "services": {{"kv": 1, "mgmt": 2}}}}],
                "vbucketMap": {{"numReplicas": 0, "map": [[0]]}}}}"#
        );
        Config::parse(&text, "127.0.0.1").unwrap()
    };

    // the first update may omit the partition map
    bucket.update_config(bare(1));
    assert_eq!(bucket.config_snapshot().unwrap().rev, 1);

    // later map-less updates are rejected with no state change
    bucket.update_config(bare(2));
    assert_eq!(bucket.config_snapshot().unwrap().rev, 1);

    // a mapped update with a higher revision supersedes
    bucket.update_config(with_map(3));
    assert_eq!(bucket.config_snapshot().unwrap().rev, 3);

    // stale revisions never roll the topology back
    bucket.update_config(with_map(2));
    assert_eq!(bucket.config_snapshot().unwrap().rev, 3);

    bucket.close();
}

#[tokio::test]
async fn cluster_facade_opens_buckets_and_rejects_use_after_close() {
    let node = MockNode::start().await;
    let cluster = Cluster::connect(
        &node.connection_string(),
        MockNode::options(),
        MockNode::credentials(),
    )
    .await
    .unwrap();

    node.put_document(b"city_1", b"{}");
    let bucket = cluster.bucket("default").await.unwrap();
    assert!(bucket.get(b"city_1".to_vec(), KeyOptions::default()).await.is_ok());

    cluster.close().await;
    let error = cluster.bucket("default").await.unwrap_err();
    assert_eq!(error, Error::ClusterClosed);
    let error = bucket.get(b"city_1".to_vec(), KeyOptions::default()).await.unwrap_err();
    assert_eq!(error, Error::BucketClosed);
}

#[tokio::test]
async fn wrong_credentials_fail_bootstrap() {
    let node = MockNode::start().await;
    let result = Cluster::connect(
        &node.connection_string(),
        MockNode::options(),
        Credentials::new("tester", "wrong-password"),
    )
    .await;
    assert!(matches!(result, Err(Error::AuthenticationFailure(_))));
}
