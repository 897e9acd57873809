//! Collection-id resolution with per-entry refresh coalescing
//!
//! Maps `(scope, collection)` pairs to their opaque 32-bit ids. Exactly one
//! `GET_COLLECTION_ID` probe is in flight per pair; requests arriving while
//! a probe runs queue behind it and are re-dispatched when it resolves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::binary::opcode::{Magic, Opcode, Status};
use crate::binary::packet::Packet;
use crate::binary::queue::OperationQueue;
use crate::binary::request::QueueRequest;
use crate::error::{Error, Result};
use crate::retry::{RetryReason, orchestrator};

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

pub const UNKNOWN_COLLECTION_ID: u32 = 0xffff_ffff;
pub const PENDING_COLLECTION_ID: u32 = 0xffff_fffe;

/// Transport seam the resolver dispatches through; implemented by the bucket
/// router and by fakes in tests.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn direct_dispatch(&self, request: Arc<QueueRequest>) -> Result<()>;
    async fn direct_re_queue(&self, request: Arc<QueueRequest>, is_retry: bool) -> Result<()>;
}

fn cache_key(scope_name: &str, collection_name: &str) -> String {
    format!("{scope_name}.{collection_name}")
}

struct CacheEntry {
    scope_name: String,
    collection_name: String,
    id: Mutex<u32>,
    queue: Mutex<Arc<OperationQueue>>,
}

impl CacheEntry {
    fn new(scope_name: String, collection_name: String, id: u32) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            scope_name,
            collection_name,
            id: Mutex::new(id),
            queue: Mutex::new(OperationQueue::new()),
        })
    }

    fn get_id(&self) -> u32 {
        *self.id.lock().unwrap()
    }

    fn set_id(&self, id: u32) {
        *self.id.lock().unwrap() = id;
    }

    fn reset_id(&self) {
        let mut guard = self.id.lock().unwrap();
        if *guard != UNKNOWN_COLLECTION_ID && *guard != PENDING_COLLECTION_ID {
            *guard = UNKNOWN_COLLECTION_ID;
        }
    }

    fn swap_queue(&self) -> Arc<OperationQueue> {
        let mut guard = self.queue.lock().unwrap();
        std::mem::replace(&mut guard, OperationQueue::new())
    }

    fn queue(&self) -> Arc<OperationQueue> {
        self.queue.lock().unwrap().clone()
    }

    /// Patch the resolved id into a request. Range-scan creation carries it
    /// in the JSON body (hex) rather than as a key prefix.
    fn assign_collection_id(&self, request: &Arc<QueueRequest>) -> Result<()> {
        let collection_id = self.get_id();
        if request.opcode() == Opcode::RangeScanCreate {
            return request.with_packet(|packet| {
                let mut body: serde_json::Value = serde_json::from_slice(&packet.value)
                    .map_err(|err| Error::ParsingFailure(format!("range scan body: {err}")))?;
                body["collection"] = serde_json::Value::String(format!("{collection_id:x}"));
                packet.value = serde_json::to_vec(&body)
                    .map_err(|err| Error::EncodingFailure(format!("range scan body: {err}")))?;
                Ok(())
            });
        }
        request.set_collection_id(collection_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetCollectionIdResult {
    pub manifest_id: u64,
    pub collection_id: u32,
}

struct ResolverInner {
    dispatcher: Arc<dyn Dispatcher>,
    max_queue_size: usize,
    cache: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

#[derive(Clone)]
pub struct CollectionResolver {
    inner: Arc<ResolverInner>,
}

/// Non-owning handle, used where a back-reference would otherwise create a
/// reference cycle with the dispatcher.
#[derive(Clone)]
pub struct WeakCollectionResolver {
    inner: std::sync::Weak<ResolverInner>,
}

impl WeakCollectionResolver {
    pub fn upgrade(&self) -> Option<CollectionResolver> {
        self.inner.upgrade().map(|inner| CollectionResolver { inner })
    }
}

impl CollectionResolver {
    pub fn downgrade(&self) -> WeakCollectionResolver {
        WeakCollectionResolver { inner: Arc::downgrade(&self.inner) }
    }

    pub fn new(dispatcher: Arc<dyn Dispatcher>, max_queue_size: usize) -> CollectionResolver {
        CollectionResolver {
            inner: Arc::new(ResolverInner {
                dispatcher,
                max_queue_size,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn get_and_maybe_insert(&self, scope_name: &str, collection_name: &str, id: u32) -> Arc<CacheEntry> {
        let mut cache = self.inner.cache.lock().unwrap();
        cache
            .entry(cache_key(scope_name, collection_name))
            .or_insert_with(|| CacheEntry::new(scope_name.to_string(), collection_name.to_string(), id))
            .clone()
    }

    fn remove(&self, scope_name: &str, collection_name: &str) {
        self.inner.cache.lock().unwrap().remove(&cache_key(scope_name, collection_name));
    }

    fn upsert(&self, scope_name: &str, collection_name: &str, id: u32) {
        let mut cache = self.inner.cache.lock().unwrap();
        match cache.get(&cache_key(scope_name, collection_name)) {
            Some(entry) => entry.set_id(id),
            None => {
                cache.insert(
                    cache_key(scope_name, collection_name),
                    CacheEntry::new(scope_name.to_string(), collection_name.to_string(), id),
                );
            }
        }
    }

    /// The number of distinct entries currently cached. Exposed for tests.
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.lock().unwrap().len()
    }

    /// Route a request, resolving its collection id first when needed.
    pub async fn dispatch(&self, request: Arc<QueueRequest>) -> Result<()> {
        let needs_resolution = request.collection_id() == 0
            && !(request.scope_name.is_empty() && request.collection_name.is_empty())
            && !(request.scope_name == DEFAULT_SCOPE && request.collection_name == DEFAULT_COLLECTION);
        if !needs_resolution {
            return self.inner.dispatcher.direct_dispatch(request).await;
        }

        let entry = self.get_and_maybe_insert(
            &request.scope_name,
            &request.collection_name,
            UNKNOWN_COLLECTION_ID,
        );
        self.dispatch_via_entry(entry, request).await
    }

    async fn dispatch_via_entry(&self, entry: Arc<CacheEntry>, request: Arc<QueueRequest>) -> Result<()> {
        enum Action {
            Refresh,
            Queued,
            Send,
        }
        // queueing happens under the id lock so a failed push can roll the
        // pending marker back before anyone else observes it
        let action = {
            let mut id = entry.id.lock().unwrap();
            match *id {
                UNKNOWN_COLLECTION_ID => {
                    debug!(
                        scope = %request.scope_name,
                        collection = %request.collection_name,
                        "collection unknown, refreshing id"
                    );
                    if let Err(error) = entry.queue().push(request.clone(), self.inner.max_queue_size) {
                        return Err(error);
                    }
                    *id = PENDING_COLLECTION_ID;
                    Action::Refresh
                }
                PENDING_COLLECTION_ID => {
                    debug!(
                        scope = %request.scope_name,
                        collection = %request.collection_name,
                        opcode = ?request.opcode(),
                        "collection pending, queueing request"
                    );
                    entry.queue().push(request.clone(), self.inner.max_queue_size)?;
                    Action::Queued
                }
                _ => Action::Send,
            }
        };

        match action {
            Action::Queued => Ok(()),
            Action::Send => {
                entry.assign_collection_id(&request)?;
                self.inner.dispatcher.direct_dispatch(request).await
            }
            Action::Refresh => {
                if let Err(error) = self.refresh_collection_id(entry.clone(), request.clone()).await {
                    entry.set_id(UNKNOWN_COLLECTION_ID);
                    entry.queue().remove(&request);
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// Issue a `GET_COLLECTION_ID` probe for the entry's pair. Exactly one
    /// probe runs per entry; its completion drains the wait queue.
    async fn refresh_collection_id(&self, entry: Arc<CacheEntry>, probe_for: Arc<QueueRequest>) -> Result<()> {
        debug!(
            scope = %entry.scope_name,
            collection = %entry.collection_name,
            "refreshing collection id"
        );
        let resolver = self.clone();
        let entry_for_callback = entry.clone();
        let probe = probe_for.clone();
        self.get_collection_id(
            &entry.scope_name,
            &entry.collection_name,
            Box::new(move |result| {
                let resolver = resolver.clone();
                let entry = entry_for_callback.clone();
                let probe = probe.clone();
                tokio::spawn(async move {
                    resolver.finish_refresh(entry, probe, result).await;
                });
            }),
        )
        .await
    }

    async fn finish_refresh(
        &self,
        entry: Arc<CacheEntry>,
        probe: Arc<QueueRequest>,
        result: Result<GetCollectionIdResult>,
    ) {
        match result {
            Ok(resolved) => {
                debug!(
                    scope = %entry.scope_name,
                    collection = %entry.collection_name,
                    collection_id = resolved.collection_id,
                    "collection refresh succeeded, re-queuing requests"
                );
                let queue = entry.swap_queue();
                queue.close();
                let mut waiting = Vec::new();
                queue.drain(|request| waiting.push(request));
                for request in waiting {
                    if let Err(error) = entry.assign_collection_id(&request) {
                        debug!(
                            scope = %request.scope_name,
                            collection = %request.collection_name,
                            opcode = ?request.opcode(),
                            %error,
                            "failed to set collection id on request"
                        );
                        continue;
                    }
                    if let Err(error) = self.inner.dispatcher.direct_re_queue(request.clone(), false).await {
                        request.try_callback(None, Some(error));
                    }
                }
            }
            Err(error) => {
                if matches!(error, Error::CollectionNotFound(_)) {
                    // mark unknown and push the trigger request through one
                    // orchestrated retry; either the collection comes online
                    // or the request times out
                    debug!(
                        scope = %entry.scope_name,
                        collection = %entry.collection_name,
                        "collection not found, attempting retry"
                    );
                    entry.set_id(UNKNOWN_COLLECTION_ID);
                    if entry.queue().remove(&probe) && self.handle_collection_unknown(probe.clone()) {
                        // the trigger is back in flight; the entry and its
                        // other waiters stay put so the retried resolution
                        // can drain them
                        return;
                    }
                }
                self.remove(&entry.scope_name, &entry.collection_name);
                let queue = entry.swap_queue();
                queue.close();
                queue.drain(|request| request.try_callback(None, Some(error.clone())));
            }
        }
    }

    /// Decide a retry for a request that raced a collection change. Returns
    /// true when a backoff timer now owns the request.
    pub fn handle_collection_unknown(&self, request: Arc<QueueRequest>) -> bool {
        // requests without collection information cannot be retried here;
        // this also keeps GET_COLLECTION_ID probes from retrying themselves
        if request.scope_name.is_empty() || request.collection_name.is_empty() {
            return false;
        }
        let action = orchestrator::should_retry(&request, RetryReason::KvCollectionOutdated);
        if !action.need_to_retry() {
            return false;
        }
        let resolver = self.clone();
        let delayed = request.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(action.duration()).await;
            resolver.re_queue(delayed).await;
        });
        request.set_retry_backoff(handle.abort_handle());
        true
    }

    async fn re_queue(&self, request: Arc<QueueRequest>) {
        request.set_collection_id(0);
        let entry = self.get_and_maybe_insert(
            &request.scope_name,
            &request.collection_name,
            UNKNOWN_COLLECTION_ID,
        );
        entry.reset_id();
        if let Err(error) = self.dispatch_via_entry(entry, request.clone()).await {
            request.try_callback(None, Some(error));
        }
    }

    /// Fetch a collection id directly, updating the cache on success.
    pub async fn get_collection_id(
        &self,
        scope_name: &str,
        collection_name: &str,
        callback: Box<dyn FnOnce(Result<GetCollectionIdResult>) + Send>,
    ) -> Result<()> {
        let scope_name = if scope_name.is_empty() { DEFAULT_SCOPE } else { scope_name };
        let collection_name =
            if collection_name.is_empty() { DEFAULT_COLLECTION } else { collection_name };

        let mut packet = Packet::request(Opcode::GetCollectionId);
        packet.magic = Magic::ClientRequest;
        packet.value = format!("{scope_name}.{collection_name}").into_bytes();

        let resolver = self.clone();
        let scope_owned = scope_name.to_string();
        let collection_owned = collection_name.to_string();
        let mut callback = Some(callback);
        let request = QueueRequest::build(
            packet,
            Box::new(move |response, error| {
                let Some(callback) = callback.take() else { return };
                if let Some(error) = error {
                    return callback(Err(error));
                }
                let Some(response) = response else {
                    return callback(Err(Error::ProtocolError("missing response".into())));
                };
                match response.status_code() {
                    Status::Success => {
                        if response.extras.len() < 12 {
                            return callback(Err(Error::ProtocolError(
                                "collection id extras too short".into(),
                            )));
                        }
                        let manifest_id =
                            u64::from_be_bytes(response.extras[0..8].try_into().unwrap());
                        let collection_id =
                            u32::from_be_bytes(response.extras[8..12].try_into().unwrap());
                        resolver.upsert(&scope_owned, &collection_owned, collection_id);
                        callback(Ok(GetCollectionIdResult { manifest_id, collection_id }))
                    }
                    Status::UnknownCollection | Status::UnknownScope => {
                        callback(Err(Error::CollectionNotFound(format!(
                            "{scope_owned}.{collection_owned}"
                        ))))
                    }
                    status => callback(Err(Error::UnexpectedStatus {
                        opcode: Opcode::GetCollectionId as u8,
                        status: status as u16,
                    })),
                }
            }),
            false,
            scope_name,
            collection_name,
            0,
            None,
        );

        self.inner.dispatcher.direct_dispatch(request).await
    }
}
