//! Bounded FIFO of queued requests with an async consumer protocol

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::error;

use crate::binary::request::QueueRequest;
use crate::error::{Error, Result};

struct QueueInner {
    items: VecDeque<Arc<QueueRequest>>,
    open: bool,
}

pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    signal: Notify,
}

impl Default for OperationQueue {
    fn default() -> Self {
        OperationQueue {
            inner: Mutex::new(QueueInner { items: VecDeque::new(), open: true }),
            signal: Notify::new(),
        }
    }
}

impl OperationQueue {
    pub fn new() -> Arc<OperationQueue> {
        Arc::new(OperationQueue::default())
    }

    pub fn debug_string(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!("num_items: {}, is_open: {}", inner.items.len(), inner.open)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().open = false;
        self.signal.notify_waiters();
    }

    /// Append a request. `max_items == 0` means unbounded.
    pub fn push(self: &Arc<Self>, request: Arc<QueueRequest>, max_items: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(Error::OperationQueueClosed);
        }
        if max_items > 0 && inner.items.len() >= max_items {
            return Err(Error::OperationQueueFull);
        }
        if !request.set_queued_with(self) {
            return Err(Error::RequestAlreadyQueued);
        }
        if request.is_cancelled() {
            request.clear_queued_with(self);
            return Err(Error::RequestCanceled);
        }
        inner.items.push_back(request);
        drop(inner);
        self.signal.notify_waiters();
        Ok(())
    }

    pub fn remove(self: &Arc<Self>, request: &Arc<QueueRequest>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return false;
        }
        if !request.clear_queued_with(self) {
            return false;
        }
        if let Some(position) = inner.items.iter().position(|item| Arc::ptr_eq(item, request)) {
            inner.items.remove(position);
            return true;
        }
        false
    }

    /// Wait for the next request. Returns `None` once the queue closes.
    pub async fn pop(self: &Arc<Self>) -> Option<Arc<QueueRequest>> {
        loop {
            let notified = self.signal.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.open {
                    return None;
                }
                if let Some(request) = inner.items.pop_front() {
                    drop(inner);
                    request.clear_queued_with(self);
                    return Some(request);
                }
            }
            notified.await;
        }
    }

    /// Hand every remaining request to `callback`. The queue must be closed
    /// first; draining an open queue is a logic error and is ignored.
    pub fn drain(self: &Arc<Self>, mut callback: impl FnMut(Arc<QueueRequest>)) {
        let items = {
            let mut inner = self.inner.lock().unwrap();
            if inner.open {
                error!("attempted to drain an open operation queue, ignoring");
                return;
            }
            std::mem::take(&mut inner.items)
        };
        for request in items {
            request.clear_queued_with(self);
            callback(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::opcode::Opcode;
    use crate::binary::packet::Packet;

    fn request() -> Arc<QueueRequest> {
        QueueRequest::new(Packet::request(Opcode::Get), Box::new(|_, _| {}))
    }

    #[tokio::test]
    async fn push_pop_preserves_fifo_order() {
        let queue = OperationQueue::new();
        let first = request();
        let second = request();
        queue.push(first.clone(), 0).unwrap();
        queue.push(second.clone(), 0).unwrap();

        assert!(Arc::ptr_eq(&queue.pop().await.unwrap(), &first));
        assert!(Arc::ptr_eq(&queue.pop().await.unwrap(), &second));
    }

    #[tokio::test]
    async fn push_respects_capacity() {
        let queue = OperationQueue::new();
        queue.push(request(), 1).unwrap();
        assert_eq!(queue.push(request(), 1), Err(Error::OperationQueueFull));
    }

    #[tokio::test]
    async fn double_push_is_rejected() {
        let queue = OperationQueue::new();
        let req = request();
        queue.push(req.clone(), 0).unwrap();
        assert_eq!(queue.push(req, 0), Err(Error::RequestAlreadyQueued));
    }

    #[tokio::test]
    async fn remove_resets_membership() {
        let queue = OperationQueue::new();
        let req = request();
        queue.push(req.clone(), 0).unwrap();
        assert!(queue.remove(&req));
        assert!(queue.is_empty());
        // removal clears the back-reference, so a second push is legal
        queue.push(req, 0).unwrap();
    }

    #[tokio::test]
    async fn closed_queue_rejects_push_and_drains() {
        let queue = OperationQueue::new();
        let req = request();
        queue.push(req, 0).unwrap();
        queue.close();
        assert_eq!(queue.push(request(), 0), Err(Error::OperationQueueClosed));

        let mut drained = 0;
        queue.drain(|_| drained += 1);
        assert_eq!(drained, 1);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close() {
        let queue = OperationQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_request_is_rejected() {
        let queue = OperationQueue::new();
        let req = request();
        req.cancel(Error::RequestCanceled);
        assert_eq!(queue.push(req, 0), Err(Error::RequestCanceled));
    }
}
