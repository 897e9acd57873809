//! Collection resolver tests: coalescing, caching, failure handling

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cellar_client::binary::opcode::{Opcode, Status};
use cellar_client::binary::packet::Packet;
use cellar_client::binary::request::QueueRequest;
use cellar_client::collections::{CollectionResolver, Dispatcher};
use cellar_client::error::{Error, Result};
use pretty_assertions::assert_eq;

/// Dispatcher double: counts probes, records dispatched requests, and
/// answers `GET_COLLECTION_ID` from a table.
struct FakeDispatcher {
    collections: Mutex<std::collections::HashMap<String, u32>>,
    probe_count: AtomicUsize,
    probe_delay: Option<Duration>,
    dispatched: Mutex<Vec<Arc<QueueRequest>>>,
    fail_probes_with: Mutex<Option<Error>>,
    /// Answer this many probes with `UnknownCollection` before consulting
    /// the table, regardless of what it holds.
    not_found_probes: AtomicUsize,
}

impl FakeDispatcher {
    fn new() -> Arc<FakeDispatcher> {
        Arc::new(FakeDispatcher {
            collections: Mutex::new(std::collections::HashMap::new()),
            probe_count: AtomicUsize::new(0),
            probe_delay: Some(Duration::from_millis(20)),
            dispatched: Mutex::new(Vec::new()),
            fail_probes_with: Mutex::new(None),
            not_found_probes: AtomicUsize::new(0),
        })
    }

    fn define(&self, scope: &str, collection: &str, id: u32) {
        self.collections.lock().unwrap().insert(format!("{scope}.{collection}"), id);
    }

    fn dispatched_opcodes(&self) -> Vec<Opcode> {
        self.dispatched.lock().unwrap().iter().map(|request| request.opcode()).collect()
    }

    fn dispatched_collection_ids(&self) -> Vec<u32> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.opcode() != Opcode::GetCollectionId)
            .map(|request| request.collection_id())
            .collect()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn direct_dispatch(&self, request: Arc<QueueRequest>) -> Result<()> {
        self.dispatched.lock().unwrap().push(request.clone());
        if request.opcode() != Opcode::GetCollectionId {
            return Ok(());
        }
        self.probe_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe_delay;
        let failure = self.fail_probes_with.lock().unwrap().clone();
        let fail_not_found = self
            .not_found_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let name = String::from_utf8_lossy(&request.packet_snapshot().value).to_string();
        let resolved = if fail_not_found {
            None
        } else {
            self.collections.lock().unwrap().get(&name).copied()
        };
        // answer from a task so callers keep dispatching while the probe
        // is in flight, the way a real session would behave
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = failure {
                request.try_callback(None, Some(error));
                return;
            }
            let response = match resolved {
                Some(id) => {
                    let mut response = Packet::response(Opcode::GetCollectionId);
                    response.extras.extend_from_slice(&1u64.to_be_bytes());
                    response.extras.extend_from_slice(&id.to_be_bytes());
                    response
                }
                None => {
                    let mut response = Packet::response(Opcode::GetCollectionId);
                    response.status = Status::UnknownCollection as u16;
                    response
                }
            };
            request.try_callback(Some(response), None);
        });
        Ok(())
    }

    async fn direct_re_queue(&self, request: Arc<QueueRequest>, _is_retry: bool) -> Result<()> {
        self.dispatched.lock().unwrap().push(request);
        Ok(())
    }
}

fn upsert_request(scope: &str, collection: &str) -> Arc<QueueRequest> {
    let mut packet = Packet::request(Opcode::Set);
    packet.key = b"doc".to_vec();
    QueueRequest::build(packet, Box::new(|_, _| {}), false, scope, collection, 0, None)
}

#[tokio::test]
async fn concurrent_requests_coalesce_into_one_probe() {
    let dispatcher = FakeDispatcher::new();
    dispatcher.define("inventory", "airline", 42);
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let resolver = resolver.clone();
        let request = upsert_request("inventory", "airline");
        waiters.push(tokio::spawn(async move { resolver.dispatch(request).await }));
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(dispatcher.probe_count.load(Ordering::SeqCst), 1);
    let ids = dispatcher.dispatched_collection_ids();
    assert_eq!(ids.len(), 10);
    assert!(ids.iter().all(|id| *id == 42));
}

#[tokio::test]
async fn known_id_skips_the_probe() {
    let dispatcher = FakeDispatcher::new();
    dispatcher.define("inventory", "airline", 7);
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    resolver.dispatch(upsert_request("inventory", "airline")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(dispatcher.probe_count.load(Ordering::SeqCst), 1);

    // the id is cached now; the next dispatch goes straight through
    resolver.dispatch(upsert_request("inventory", "airline")).await.unwrap();
    assert_eq!(dispatcher.probe_count.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.dispatched_collection_ids().last(), Some(&7));
}

#[tokio::test]
async fn default_collection_and_preassigned_ids_bypass_resolution() {
    let dispatcher = FakeDispatcher::new();
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    resolver.dispatch(upsert_request("", "")).await.unwrap();
    resolver.dispatch(upsert_request("_default", "_default")).await.unwrap();

    let preassigned = upsert_request("inventory", "airline");
    preassigned.set_collection_id(9);
    resolver.dispatch(preassigned).await.unwrap();

    assert_eq!(dispatcher.probe_count.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.dispatched_opcodes(), vec![Opcode::Set; 3]);
}

#[tokio::test]
async fn probe_failure_fails_all_waiting_requests() {
    let dispatcher = FakeDispatcher::new();
    *dispatcher.fail_probes_with.lock().unwrap() = Some(Error::TemporaryFailure);
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for _ in 0..3 {
        let outcomes = outcomes.clone();
        let mut packet = Packet::request(Opcode::Set);
        packet.key = b"doc".to_vec();
        let request = QueueRequest::build(
            packet,
            Box::new(move |_, error| outcomes.lock().unwrap().push(error)),
            false,
            "inventory",
            "missing",
            0,
            None,
        );
        let resolver = resolver.clone();
        waiters.push(tokio::spawn(async move { resolver.dispatch(request).await }));
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|error| error == &Some(Error::TemporaryFailure)));
    // the entry is dropped, nothing remains cached
    assert_eq!(resolver.cached_entries(), 0);
}

#[tokio::test]
async fn waiters_survive_a_not_found_probe_whose_retry_resolves() {
    let dispatcher = FakeDispatcher::new();
    dispatcher.define("inventory", "airline", 42);
    // the first probe races a collection that is still coming online
    dispatcher.not_found_probes.store(1, Ordering::SeqCst);
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut requests = Vec::new();
    for _ in 0..3 {
        let recorded = outcomes.clone();
        let mut packet = Packet::request(Opcode::Set);
        packet.key = b"doc".to_vec();
        requests.push(QueueRequest::build(
            packet,
            Box::new(move |_, error| {
                if let Some(error) = error {
                    recorded.lock().unwrap().push(error);
                }
            }),
            false,
            "inventory",
            "airline",
            0,
            None,
        ));
    }
    for request in &requests {
        resolver.dispatch(request.clone()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // first probe came back unknown, the retried one resolved
    assert_eq!(dispatcher.probe_count.load(Ordering::SeqCst), 2);
    // the co-queued waiters were not failed with the transient not-found
    assert_eq!(*outcomes.lock().unwrap(), Vec::<Error>::new());
    // and every request went out with the resolved id
    let ids = dispatcher.dispatched_collection_ids();
    assert_eq!(ids, vec![42, 42, 42]);
    // the cache entry survived the transient failure
    assert_eq!(resolver.cached_entries(), 1);
}

#[tokio::test]
async fn unknown_collection_keeps_retrying_the_trigger_until_cancelled() {
    let dispatcher = FakeDispatcher::new();
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let recorded = outcomes.clone();
    let mut packet = Packet::request(Opcode::Set);
    packet.key = b"doc".to_vec();
    let request = QueueRequest::build(
        packet,
        Box::new(move |_, error| recorded.lock().unwrap().push(error)),
        false,
        "inventory",
        "nowhere",
        0,
        None,
    );
    resolver.dispatch(request.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // collection-outdated is in the always-retry set, so the trigger keeps
    // probing on the controlled schedule instead of failing
    assert!(dispatcher.probe_count.load(Ordering::SeqCst) >= 2);
    assert!(outcomes.lock().unwrap().is_empty());

    request.cancel(Error::RequestCanceled);
    assert_eq!(*outcomes.lock().unwrap(), vec![Some(Error::RequestCanceled)]);
}

#[tokio::test]
async fn queue_capacity_applies_to_waiting_requests() {
    let dispatcher = FakeDispatcher::new();
    dispatcher.define("inventory", "airline", 42);
    let resolver = CollectionResolver::new(dispatcher.clone(), 2);

    // the first dispatch occupies one waiting slot while the probe runs
    resolver.dispatch(upsert_request("inventory", "airline")).await.unwrap();
    resolver.dispatch(upsert_request("inventory", "airline")).await.unwrap();
    let overflow = resolver.dispatch(upsert_request("inventory", "airline")).await;
    assert_eq!(overflow.unwrap_err(), Error::OperationQueueFull);
}

#[tokio::test]
async fn direct_get_collection_id_updates_the_cache() {
    let dispatcher = FakeDispatcher::new();
    dispatcher.define("inventory", "route", 1200);
    let resolver = CollectionResolver::new(dispatcher.clone(), 0);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    resolver
        .get_collection_id(
            "inventory",
            "route",
            Box::new(move |result| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(result);
                }
            }),
        )
        .await
        .unwrap();
    let result = rx.await.unwrap().unwrap();
    assert_eq!(result.collection_id, 1200);
    assert_eq!(result.manifest_id, 1);
    assert_eq!(resolver.cached_entries(), 1);
}
