//! Bucket router: one binary session per node, routed by vbucket
//!
//! The router owns the per-node sessions of one bucket, hashes keys to
//! partitions, dispatches requests to the owning session, and reacts to
//! topology changes by moving, stopping, or starting sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::binary::opcode::{Opcode, Status, datatype};
use crate::binary::packet::Packet;
use crate::binary::request::QueueRequest;
use crate::collections::{CollectionResolver, Dispatcher, WeakCollectionResolver};
use crate::error::{Error, Result};
use crate::options::{ClusterOptions, Credentials};
use crate::retry::{RetryReason, orchestrator};
use crate::session::{ConfigListener, HandlerDisposition, Session};
use crate::stream::TlsContext;
use crate::telemetry::meter::{AppTelemetryMeter, CounterKind, LatencyKind};
use crate::topology::{Config, ServiceType, diff_nodes};

pub(crate) struct BucketInner {
    client_id: String,
    name: String,
    log_prefix: String,
    options: ClusterOptions,
    credentials: Credentials,
    tls: Option<TlsContext>,
    seed_nodes: Vec<(String, u16)>,
    meter: Arc<AppTelemetryMeter>,

    closed: AtomicBool,
    configured: AtomicBool,
    config: Mutex<Option<Config>>,
    sessions: Mutex<HashMap<usize, Session>>,
    deferred: Mutex<VecDeque<Arc<QueueRequest>>>,
    config_listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
    resolver: Mutex<Option<WeakCollectionResolver>>,
}

/// Public handle to a bucket router. Cheap to clone.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
    resolver: CollectionResolver,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("name", &self.inner.name).finish()
    }
}

struct BucketConfigListener {
    inner: Arc<BucketInner>,
}

impl ConfigListener for BucketConfigListener {
    fn update_config(&self, config: Config) {
        self.inner.update_config(config);
    }
}

impl Bucket {
    pub fn new(
        client_id: impl Into<String>,
        name: impl Into<String>,
        options: ClusterOptions,
        credentials: Credentials,
        tls: Option<TlsContext>,
        seed_nodes: Vec<(String, u16)>,
        meter: Arc<AppTelemetryMeter>,
    ) -> Bucket {
        let client_id = client_id.into();
        let name = name.into();
        let log_prefix = format!("[{client_id}/{name}]");
        let max_queue_size = options.max_queue_size;
        let inner = Arc::new(BucketInner {
            client_id,
            name,
            log_prefix,
            options,
            credentials,
            tls,
            seed_nodes,
            meter,
            closed: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            config: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            config_listeners: Mutex::new(Vec::new()),
            resolver: Mutex::new(None),
        });
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(BucketDispatcher { inner: inner.clone() });
        let resolver = CollectionResolver::new(dispatcher, max_queue_size);
        *inner.resolver.lock().unwrap() = Some(resolver.downgrade());
        Bucket { inner, resolver }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_configured(&self) -> bool {
        self.inner.configured.load(Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    pub fn config_snapshot(&self) -> Option<Config> {
        self.inner.config.lock().unwrap().clone()
    }

    pub fn on_configuration_update(&self, listener: Arc<dyn ConfigListener>) {
        self.inner.config_listeners.lock().unwrap().push(listener);
    }

    /// Inject a topology update, exactly as a session push would.
    pub fn update_config(&self, config: Config) {
        self.inner.update_config(config);
    }

    /// Hash a key to its partition and owning node under the current config.
    pub fn map_key(&self, key: &[u8], replica_index: u32) -> (u16, Option<usize>) {
        match self.inner.config.lock().unwrap().as_ref() {
            Some(config) => config.map_key(key, replica_index),
            None => (0, None),
        }
    }

    /// Number of replica copies the current topology advertises.
    pub fn num_replicas(&self) -> usize {
        self.inner
            .config
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|config| config.vbmap.as_ref())
            .map_or(0, |vbmap| vbmap.num_replicas)
    }

    /// Open the first session and install the initial topology.
    pub async fn bootstrap(&self) -> Result<Config> {
        let mut last_error = Error::NoEndpointsLeft;
        for (hostname, port) in self.inner.seed_nodes.clone() {
            let session = self.inner.new_session(&hostname, port);
            match session.bootstrap().await {
                Ok(config) => {
                    self.inner.install_session(session);
                    self.inner.update_config(config.clone());
                    self.inner.drain_deferred_queue();
                    return Ok(config);
                }
                Err(error) => {
                    warn!(
                        prefix = %self.inner.log_prefix,
                        hostname = %hostname,
                        port,
                        %error,
                        "failed to bootstrap session"
                    );
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Route a request through the collection resolver and onto a session.
    pub async fn dispatch(&self, request: Arc<QueueRequest>) -> Result<()> {
        self.resolver.dispatch(request).await
    }

    /// Measure a NOOP round trip against every connected node.
    pub async fn ping(&self) -> Vec<(String, Result<std::time::Duration>)> {
        let sessions: Vec<Session> =
            self.inner.sessions.lock().unwrap().values().cloned().collect();
        let mut reports = Vec::with_capacity(sessions.len());
        for session in sessions {
            let endpoint = format!("{}:{}", session.bootstrap_hostname(), session.bootstrap_port());
            reports.push((endpoint, session.ping().await));
        }
        reports
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl BucketInner {
    fn new_session(self: &Arc<Self>, hostname: &str, port: u16) -> Session {
        Session::new(
            self.client_id.clone(),
            hostname,
            port,
            self.options.clone(),
            self.credentials.clone(),
            self.tls.clone(),
            Some(self.name.clone()),
        )
    }

    /// Register config/stop listeners and place the session at its index.
    fn install_session(self: &Arc<Self>, session: Session) {
        let index = if session.index() != usize::MAX { session.index() } else { 0 };
        session.on_configuration_update(Arc::new(BucketConfigListener { inner: self.clone() }));
        let inner = self.clone();
        let hostname = session.bootstrap_hostname().to_string();
        let port = session.bootstrap_port();
        session.on_stop(Box::new(move |reason| {
            if reason == RetryReason::SocketClosedWhileInFlight {
                inner.restart_node(index, hostname, port);
            }
        }));
        self.sessions.lock().unwrap().insert(index, session);
    }

    fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let deferred: Vec<Arc<QueueRequest>> =
            self.deferred.lock().unwrap().drain(..).collect();
        for request in deferred {
            request.cancel(Error::BucketClosed);
        }
        self.config_listeners.lock().unwrap().clear();
        let sessions: Vec<Session> = {
            let mut guard = self.sessions.lock().unwrap();
            guard.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.stop(RetryReason::DoNotRetry);
        }
    }

    fn defer_command(self: &Arc<Self>, request: Arc<QueueRequest>) {
        self.deferred.lock().unwrap().push_back(request);
    }

    fn drain_deferred_queue(self: &Arc<Self>) {
        let drained: Vec<Arc<QueueRequest>> =
            self.deferred.lock().unwrap().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        trace!(prefix = %self.log_prefix, count = drained.len(), "draining deferred commands");
        for request in drained {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(error) = inner.dispatch_inner(request.clone(), false).await {
                    request.try_callback(None, Some(error));
                }
            });
        }
    }

    fn find_session_by_index(&self, index: usize) -> Option<Session> {
        self.sessions.lock().unwrap().get(&index).cloned()
    }

    fn route_request(&self, request: &Arc<QueueRequest>) -> Option<Session> {
        let key = request.key();
        if key.is_empty() {
            let config = self.config.lock().unwrap();
            let server = config
                .as_ref()?
                .server_by_vbucket(request.vbucket(), request.replica_index)?;
            drop(config);
            return self.find_session_by_index(server);
        }
        let (partition, server) = {
            let config = self.config.lock().unwrap();
            config.as_ref()?.map_key(&key, request.replica_index)
        };
        request.set_vbucket(partition);
        self.find_session_by_index(server?)
    }

    async fn dispatch_inner(self: &Arc<Self>, request: Arc<QueueRequest>, is_retry: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            request.cancel(Error::BucketClosed);
            return Err(Error::BucketClosed);
        }
        if !self.configured.load(Ordering::SeqCst) {
            self.defer_command(request);
            return Ok(());
        }

        request.mark_dispatched();

        let Some(session) = self.route_request(&request) else {
            self.defer_command(request);
            return Ok(());
        };
        if !session.has_config() && !session.is_stopped() {
            self.defer_command(request);
            return Ok(());
        }
        if session.is_stopped() {
            if self.backoff_and_retry(request.clone(), RetryReason::NodeNotAvailable) {
                return Ok(());
            }
            let error = Error::ServiceNotAvailable("node session is stopped".into());
            if is_retry {
                warn!(prefix = %self.log_prefix, "reschedule failed, failing request");
            }
            request.try_callback(None, Some(error.clone()));
            return Err(error);
        }

        request.set_opaque(session.next_opaque());
        if is_retry {
            debug!(
                prefix = %self.log_prefix,
                opaque = request.opaque(),
                opcode = ?request.opcode(),
                "request being re-queued"
            );
        }
        let mut packet = request.packet_snapshot();
        if !packet.value.is_empty() && packet.datatype & datatype::SNAPPY == 0 {
            if let Some(compressed) = session.maybe_compress(&packet.value) {
                packet.value = compressed;
                packet.datatype |= datatype::SNAPPY;
            }
        }
        let bytes = match session.encode_packet(&packet) {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(prefix = %self.log_prefix, %error, "unable to encode packet");
                request.try_callback(None, Some(error.clone()));
                return Err(error);
            }
        };

        let inner = self.clone();
        let handler_request = request.clone();
        let handler_session = session.clone();
        session.write_and_subscribe(
            request.opaque(),
            bytes,
            Box::new(move |response, error, reason| {
                let persistent_pending = handler_request.persistent
                    && response
                        .as_ref()
                        .is_some_and(|r| r.status_code() == Status::Success);
                inner.resolve_response(
                    &handler_session,
                    handler_request.clone(),
                    response,
                    error,
                    reason,
                );
                if persistent_pending && !handler_request.is_cancelled() {
                    HandlerDisposition::Keep
                } else {
                    HandlerDisposition::Remove
                }
            }),
        );
        Ok(())
    }

    /// Map a response status or transport error to a retry reason and either
    /// schedule a retry or complete the request.
    fn resolve_response(
        self: &Arc<Self>,
        session: &Session,
        request: Arc<QueueRequest>,
        response: Option<Packet>,
        error: Option<Error>,
        mut reason: RetryReason,
    ) {
        self.record_telemetry(session, &request, response.as_ref(), error.as_ref());

        if let Some(error) = &error {
            if matches!(error, Error::AmbiguousTimeout | Error::UnambiguousTimeout) {
                let mapped = if request.idempotent() {
                    Error::UnambiguousTimeout
                } else {
                    Error::AmbiguousTimeout
                };
                request.try_callback(response, Some(mapped));
                return;
            }
            if matches!(error, Error::RequestCanceled) {
                if reason == RetryReason::DoNotRetry {
                    request.try_callback(response, Some(Error::RequestCanceled));
                    return;
                }
                if !self.backoff_and_retry(request.clone(), RetryReason::NodeNotAvailable) {
                    request.try_callback(response, Some(Error::RequestCanceled));
                }
                return;
            }
            request.try_callback(response, Some(error.clone()));
            return;
        }

        let status = response.as_ref().map_or(Status::Unknown, |r| r.status_code());
        match status {
            Status::NotMyVbucket => reason = RetryReason::KvNotMyVbucket,
            Status::Locked => {
                // unlock is the one command where a locked response is the
                // answer, not a transient state
                if request.opcode() != Opcode::Unlock {
                    reason = RetryReason::KvLocked;
                }
            }
            Status::TemporaryFailure => reason = RetryReason::KvTemporaryFailure,
            Status::SyncWriteInProgress => reason = RetryReason::KvSyncWriteInProgress,
            Status::SyncWriteReCommitInProgress => {
                reason = RetryReason::KvSyncWriteReCommitInProgress;
            }
            Status::UnknownCollection => {
                // id probes surface the status directly; retrying them here
                // would loop them through the resolver they came from
                if request.opcode() != Opcode::GetCollectionId
                    && self.resolver_retry_for_unknown_collection(&request)
                {
                    return;
                }
            }
            Status::Unknown => {
                if let Some(packet) = response.as_ref() {
                    if session.error_map_retry_indicated(packet.status) {
                        reason = RetryReason::KvErrorMapRetryIndicated;
                    }
                }
            }
            _ => {}
        }

        if reason == RetryReason::DoNotRetry || !self.backoff_and_retry(request.clone(), reason) {
            request.try_callback(response, None);
        }
    }

    fn resolver_retry_for_unknown_collection(&self, request: &Arc<QueueRequest>) -> bool {
        let resolver = self.resolver.lock().unwrap().clone();
        match resolver.and_then(|weak| weak.upgrade()) {
            Some(resolver) => resolver.handle_collection_unknown(request.clone()),
            None => false,
        }
    }

    fn backoff_and_retry(self: &Arc<Self>, request: Arc<QueueRequest>, reason: RetryReason) -> bool {
        let action = orchestrator::should_retry(&request, reason);
        if !action.need_to_retry() {
            return false;
        }
        let inner = self.clone();
        let delayed = request.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(action.duration()).await;
            if let Err(error) = inner.dispatch_inner(delayed.clone(), true).await {
                if !matches!(error, Error::BucketClosed) {
                    delayed.try_callback(None, Some(error));
                }
            }
        });
        request.set_retry_backoff(handle.abort_handle());
        true
    }

    fn record_telemetry(
        &self,
        session: &Session,
        request: &Arc<QueueRequest>,
        response: Option<&Packet>,
        error: Option<&Error>,
    ) {
        let Some(node_uuid) = session.node_uuid() else { return };
        let recorder = self.meter.value_recorder(&node_uuid, &self.name);
        recorder.update_counter(CounterKind::total_for(ServiceType::KeyValue));
        match error {
            Some(Error::AmbiguousTimeout) | Some(Error::UnambiguousTimeout) => {
                recorder.update_counter(CounterKind::timedout_for(ServiceType::KeyValue));
            }
            Some(Error::RequestCanceled) => {
                recorder.update_counter(CounterKind::canceled_for(ServiceType::KeyValue));
            }
            _ => {}
        }
        if error.is_none() && response.is_some() {
            if let Some(dispatched_at) = request.dispatched_at() {
                let kind = match request.opcode() {
                    Opcode::Set
                    | Opcode::Add
                    | Opcode::Replace
                    | Opcode::Delete
                    | Opcode::Increment
                    | Opcode::Decrement
                    | Opcode::Append
                    | Opcode::Prepend
                    | Opcode::SubdocMultiMutation => {
                        let durable =
                            request.with_packet(|packet| packet.durability.is_some());
                        if durable {
                            LatencyKind::KvMutationDurable
                        } else {
                            LatencyKind::KvMutationNondurable
                        }
                    }
                    _ => LatencyKind::KvRetrieval,
                };
                recorder.record_latency(kind, dispatched_at.elapsed());
            }
        }
    }

    fn restart_node(self: &Arc<Self>, index: usize, hostname: String, port: u16) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(
                prefix = %self.log_prefix,
                index,
                address = format!("{hostname}:{port}"),
                "requested to restart session, but the bucket has been closed already"
            );
            return;
        }
        {
            let config = self.config.lock().unwrap();
            let still_known = config
                .as_ref()
                .is_some_and(|c| c.has_node_with_hostname(&self.options.network, &hostname));
            if !still_known {
                trace!(
                    prefix = %self.log_prefix,
                    index,
                    address = format!("{hostname}:{port}"),
                    "node has been ejected from the configuration, skipping restart"
                );
                return;
            }
        }

        let session = self.new_session(&hostname, port);
        debug!(
            prefix = %self.log_prefix,
            index,
            session_id = session.id(),
            address = format!("{hostname}:{port}"),
            "restarting session"
        );
        self.sessions.lock().unwrap().insert(index, session.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            match session.bootstrap().await {
                Ok(config) => {
                    if inner.closed.load(Ordering::SeqCst) {
                        session.stop(RetryReason::DoNotRetry);
                        return;
                    }
                    session.on_configuration_update(Arc::new(BucketConfigListener {
                        inner: inner.clone(),
                    }));
                    let restart_inner = inner.clone();
                    let restart_hostname = hostname.clone();
                    session.on_stop(Box::new(move |reason| {
                        if reason == RetryReason::SocketClosedWhileInFlight {
                            restart_inner.restart_node(index, restart_hostname, port);
                        }
                    }));
                    inner.update_config(config);
                    inner.drain_deferred_queue();
                }
                Err(error) => {
                    warn!(
                        prefix = %inner.log_prefix,
                        index,
                        %error,
                        "failed to restart session"
                    );
                    inner.restart_node(index, hostname, port);
                }
            }
        });
    }

    fn update_config(self: &Arc<Self>, config: Config) {
        let network = self.options.network.clone();
        let (added, removed) = {
            let mut current = self.config.lock().unwrap();
            match current.as_ref() {
                None => {
                    debug!(prefix = %self.log_prefix, rev = config.rev, "initialize configuration");
                }
                Some(existing) if config.force => {
                    debug!(
                        prefix = %self.log_prefix,
                        old_rev = existing.rev,
                        new_rev = config.rev,
                        "forced to accept configuration"
                    );
                }
                Some(existing) => {
                    if config.vbmap.is_none() {
                        debug!(
                            prefix = %self.log_prefix,
                            old_rev = existing.rev,
                            new_rev = config.rev,
                            "will not update the configuration, new config has no partition map"
                        );
                        return;
                    }
                    if !config.supersedes(existing) {
                        return;
                    }
                    debug!(
                        prefix = %self.log_prefix,
                        old_rev = existing.rev,
                        new_rev = config.rev,
                        "will update the configuration"
                    );
                }
            }

            let added: Vec<usize> = match current.as_ref() {
                Some(existing) => diff_nodes(&existing.nodes, &config.nodes, &network)
                    .into_iter()
                    .map(|node| node.index)
                    .collect(),
                None => config.nodes.iter().map(|node| node.index).collect(),
            };
            let removed: Vec<usize> = match current.as_ref() {
                Some(existing) => diff_nodes(&config.nodes, &existing.nodes, &network)
                    .into_iter()
                    .map(|node| node.index)
                    .collect(),
                None => Vec::new(),
            };
            *current = Some(config.clone());
            self.configured.store(true, Ordering::SeqCst);
            (added, removed)
        };

        {
            let listeners = self.config_listeners.lock().unwrap().clone();
            for listener in listeners {
                listener.update_config(config.clone());
            }
        }

        if added.is_empty() && removed.is_empty() {
            self.drain_deferred_queue();
            return;
        }

        let tls = self.tls.is_some();
        let mut sessions = self.sessions.lock().unwrap();
        let mut next_sessions: HashMap<usize, Session> = HashMap::new();

        for (index, session) in sessions.drain() {
            let new_index = config.nodes.iter().find_map(|node| {
                let kv_port = node.port_or(&network, ServiceType::KeyValue, tls, 0);
                if node.hostname_for(&network) == session.bootstrap_hostname()
                    && kv_port == session.bootstrap_port()
                {
                    Some(node.index)
                } else {
                    None
                }
            });
            match new_index {
                Some(new_index) => {
                    debug!(
                        prefix = %self.log_prefix,
                        rev = config.rev,
                        session_id = session.id(),
                        old_index = index,
                        new_index,
                        "preserve session"
                    );
                    next_sessions.insert(new_index, session);
                }
                None => {
                    debug!(
                        prefix = %self.log_prefix,
                        rev = config.rev,
                        session_id = session.id(),
                        index,
                        "drop session"
                    );
                    tokio::spawn(async move {
                        session.stop(RetryReason::DoNotRetry);
                    });
                }
            }
        }

        for node in &config.nodes {
            if next_sessions.contains_key(&node.index) {
                continue;
            }
            let hostname = node.hostname_for(&network).to_string();
            let port = node.port_or(&network, ServiceType::KeyValue, tls, 0);
            if port == 0 {
                continue;
            }
            let session = self.new_session(&hostname, port);
            debug!(
                prefix = %self.log_prefix,
                rev = config.rev,
                session_id = session.id(),
                address = format!("{hostname}:{port}"),
                "add session"
            );
            next_sessions.insert(node.index, session.clone());

            let inner = self.clone();
            let node_index = node.index;
            tokio::spawn(async move {
                match session.bootstrap().await {
                    Ok(config) => {
                        session.on_configuration_update(Arc::new(BucketConfigListener {
                            inner: inner.clone(),
                        }));
                        let stop_inner = inner.clone();
                        let stop_hostname = session.bootstrap_hostname().to_string();
                        let stop_port = session.bootstrap_port();
                        session.on_stop(Box::new(move |reason| {
                            if reason == RetryReason::SocketClosedWhileInFlight {
                                stop_inner.restart_node(node_index, stop_hostname, stop_port);
                            }
                        }));
                        inner.update_config(config);
                        inner.drain_deferred_queue();
                    }
                    Err(error) => {
                        warn!(
                            prefix = %inner.log_prefix,
                            index = node_index,
                            %error,
                            "failed to bootstrap added session"
                        );
                    }
                }
            });
        }
        *sessions = next_sessions;
        drop(sessions);

        self.drain_deferred_queue();
    }
}

struct BucketDispatcher {
    inner: Arc<BucketInner>,
}

#[async_trait]
impl Dispatcher for BucketDispatcher {
    async fn direct_dispatch(&self, request: Arc<QueueRequest>) -> Result<()> {
        self.inner.dispatch_inner(request, false).await
    }

    async fn direct_re_queue(&self, request: Arc<QueueRequest>, is_retry: bool) -> Result<()> {
        self.inner.dispatch_inner(request, is_retry).await
    }
}
