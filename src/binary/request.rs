//! Shared request state for queued binary commands

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::task::AbortHandle;

use crate::binary::opcode::Opcode;
use crate::binary::packet::Packet;
use crate::binary::queue::OperationQueue;
use crate::error::Error;
use crate::retry::{RetryReason, RetryStrategy};

/// Completion callback of a queued request.
///
/// Invoked with either a response packet or an error. Persistent requests
/// (range-scan continue) see it invoked once per intermediate response;
/// everything else sees it at most once.
pub type QueueCallback = Box<dyn FnMut(Option<Packet>, Option<Error>) + Send>;

#[derive(Default)]
struct RetryInfo {
    count: u32,
    reasons: BTreeSet<RetryReason>,
}

pub struct QueueRequest {
    packet: Mutex<Packet>,
    pub persistent: bool,
    pub scope_name: String,
    pub collection_name: String,
    pub replica_index: u32,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,

    callback: Mutex<Option<QueueCallback>>,
    completed: AtomicBool,
    queued_with: Mutex<Option<Weak<OperationQueue>>>,
    retry: Mutex<RetryInfo>,
    deadline: Mutex<Option<AbortHandle>>,
    retry_backoff: Mutex<Option<AbortHandle>>,
    dispatched_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for QueueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRequest")
            .field("opcode", &self.opcode())
            .field("opaque", &self.opaque())
            .field("persistent", &self.persistent)
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

impl QueueRequest {
    pub fn new(packet: Packet, callback: QueueCallback) -> Arc<QueueRequest> {
        Arc::new(QueueRequest {
            packet: Mutex::new(packet),
            persistent: false,
            scope_name: String::new(),
            collection_name: String::new(),
            replica_index: 0,
            retry_strategy: None,
            callback: Mutex::new(Some(callback)),
            completed: AtomicBool::new(false),
            queued_with: Mutex::new(None),
            retry: Mutex::new(RetryInfo::default()),
            deadline: Mutex::new(None),
            retry_backoff: Mutex::new(None),
            dispatched_at: Mutex::new(None),
        })
    }

    /// Builder-style constructor for requests that need more than the defaults.
    pub fn build(
        packet: Packet,
        callback: QueueCallback,
        persistent: bool,
        scope_name: impl Into<String>,
        collection_name: impl Into<String>,
        replica_index: u32,
        retry_strategy: Option<Arc<dyn RetryStrategy>>,
    ) -> Arc<QueueRequest> {
        Arc::new(QueueRequest {
            packet: Mutex::new(packet),
            persistent,
            scope_name: scope_name.into(),
            collection_name: collection_name.into(),
            replica_index,
            retry_strategy,
            callback: Mutex::new(Some(callback)),
            completed: AtomicBool::new(false),
            queued_with: Mutex::new(None),
            retry: Mutex::new(RetryInfo::default()),
            deadline: Mutex::new(None),
            retry_backoff: Mutex::new(None),
            dispatched_at: Mutex::new(None),
        })
    }

    pub fn opcode(&self) -> Opcode {
        self.packet.lock().unwrap().opcode
    }

    pub fn opaque(&self) -> u32 {
        self.packet.lock().unwrap().opaque
    }

    pub fn set_opaque(&self, opaque: u32) {
        self.packet.lock().unwrap().opaque = opaque;
    }

    pub fn vbucket(&self) -> u16 {
        self.packet.lock().unwrap().vbucket
    }

    pub fn set_vbucket(&self, vbucket: u16) {
        self.packet.lock().unwrap().vbucket = vbucket;
    }

    pub fn key(&self) -> Vec<u8> {
        self.packet.lock().unwrap().key.clone()
    }

    pub fn collection_id(&self) -> u32 {
        self.packet.lock().unwrap().collection_id
    }

    pub fn set_collection_id(&self, id: u32) {
        self.packet.lock().unwrap().collection_id = id;
    }

    /// Run `f` against the packet under the lock.
    pub fn with_packet<R>(&self, f: impl FnOnce(&mut Packet) -> R) -> R {
        f(&mut self.packet.lock().unwrap())
    }

    pub fn packet_snapshot(&self) -> Packet {
        self.packet.lock().unwrap().clone()
    }

    pub fn identifier(&self) -> String {
        self.opaque().to_string()
    }

    pub fn idempotent(&self) -> bool {
        self.opcode().is_idempotent()
    }

    pub fn mark_dispatched(&self) {
        *self.dispatched_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn dispatched_at(&self) -> Option<Instant> {
        *self.dispatched_at.lock().unwrap()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry.lock().unwrap().count
    }

    pub fn record_retry_attempt(&self, reason: RetryReason) {
        let mut retry = self.retry.lock().unwrap();
        retry.count += 1;
        retry.reasons.insert(reason);
    }

    pub fn retries(&self) -> (u32, BTreeSet<RetryReason>) {
        let retry = self.retry.lock().unwrap();
        (retry.count, retry.reasons.clone())
    }

    pub fn is_cancelled(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn set_deadline(&self, handle: AbortHandle) {
        *self.deadline.lock().unwrap() = Some(handle);
    }

    pub fn set_retry_backoff(&self, handle: AbortHandle) {
        *self.retry_backoff.lock().unwrap() = Some(handle);
    }

    fn cancel_timers(&self) {
        if let Some(handle) = self.deadline.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.retry_backoff.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub(crate) fn set_queued_with(&self, queue: &Arc<OperationQueue>) -> bool {
        let mut queued_with = self.queued_with.lock().unwrap();
        if queued_with.is_some() {
            return false;
        }
        *queued_with = Some(Arc::downgrade(queue));
        true
    }

    pub(crate) fn clear_queued_with(&self, queue: &Arc<OperationQueue>) -> bool {
        let mut queued_with = self.queued_with.lock().unwrap();
        match queued_with.as_ref() {
            Some(weak) if Weak::ptr_eq(weak, &Arc::downgrade(queue)) => {
                *queued_with = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_queued_with(&self) -> Option<Arc<OperationQueue>> {
        self.queued_with.lock().unwrap().take().and_then(|weak| weak.upgrade())
    }

    /// Flip this request to completed, stopping timers and dropping it from
    /// whichever queue holds it. Returns false when someone else already
    /// completed it.
    pub fn internal_cancel(self: &Arc<Self>) -> bool {
        if self.completed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel_timers();
        if let Some(queue) = self.take_queued_with() {
            queue.remove(self);
        }
        true
    }

    pub fn cancel(self: &Arc<Self>, error: Error) {
        if self.internal_cancel() {
            self.invoke_callback(None, Some(error));
        }
    }

    /// Deliver a response or error, honoring persistent-request semantics.
    pub fn try_callback(self: &Arc<Self>, response: Option<Packet>, error: Option<Error>) {
        self.cancel_timers();

        if self.persistent {
            match error {
                Some(error) => {
                    if self.internal_cancel() {
                        self.invoke_callback(response, Some(error));
                    }
                }
                None => {
                    if !self.completed.load(Ordering::SeqCst) {
                        self.invoke_callback(response, None);
                    }
                }
            }
            return;
        }
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.invoke_callback(response, error);
        }
    }

    fn invoke_callback(&self, response: Option<Packet>, error: Option<Error>) {
        let mut guard = self.callback.lock().unwrap();
        if self.persistent {
            if let Some(callback) = guard.as_mut() {
                callback(response, error);
            }
        } else if let Some(mut callback) = guard.take() {
            drop(guard);
            callback(response, error);
        }
    }
}
