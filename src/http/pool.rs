//! Per-service HTTP session pools with node affinity
//!
//! Each service keeps three disjoint sets of sessions: idle (checked in,
//! idle timer armed), busy (checked out), and pending (still connecting).
//! Checkout prefers an idle session on the preferred node, falls back to
//! round-robin across nodes exposing the service, and defers entirely while
//! the cluster has not delivered its first configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::http::message::{HttpRequest, HttpResponse};
use crate::http::session::HttpSession;
use crate::http::streaming::RowCallback;
use crate::options::{ClusterOptions, Credentials};
use crate::session::ConfigListener;
use crate::stream::TlsContext;
use crate::topology::{Config, ServiceType};

/// One HTTP service operation, dispatched through the pool.
#[derive(Debug, Clone, Default)]
pub struct ServiceRequest {
    pub service: ServiceType,
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
    /// Route to this `host:port` when set (sticky node).
    pub send_to_node: Option<String>,
    /// Avoid this `host:port`; a random other node is chosen instead.
    pub undesired_node: Option<String>,
}

#[derive(Default)]
struct Pools {
    idle: HashMap<ServiceType, Vec<Arc<HttpSession>>>,
    busy: HashMap<ServiceType, Vec<Arc<HttpSession>>>,
    pending: HashMap<ServiceType, Vec<Arc<HttpSession>>>,
}

impl Pools {
    fn remove_everywhere(&mut self, service: ServiceType, id: &str) {
        for set in [&mut self.idle, &mut self.busy, &mut self.pending] {
            if let Some(sessions) = set.get_mut(&service) {
                sessions.retain(|session| session.id() != id);
            }
        }
    }
}

struct ManagerInner {
    client_id: String,
    tls: Option<TlsContext>,
    credentials: Mutex<Credentials>,
    options: Mutex<ClusterOptions>,
    config: Mutex<Option<Config>>,
    configured_tx: watch::Sender<bool>,
    configured_rx: watch::Receiver<bool>,
    last_bootstrap_error: Mutex<Option<Error>>,
    next_index: Mutex<usize>,
    pools: Mutex<Pools>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct HttpSessionManager {
    inner: Arc<ManagerInner>,
}

impl ConfigListener for HttpSessionManager {
    fn update_config(&self, config: Config) {
        self.apply_config(config);
    }
}

#[derive(Debug)]
pub struct PingReport {
    pub service: ServiceType,
    pub endpoint: String,
    pub latency: Result<Duration>,
}

impl HttpSessionManager {
    pub fn new(client_id: impl Into<String>, tls: Option<TlsContext>) -> HttpSessionManager {
        let (configured_tx, configured_rx) = watch::channel(false);
        HttpSessionManager {
            inner: Arc::new(ManagerInner {
                client_id: client_id.into(),
                tls,
                credentials: Mutex::new(Credentials::default()),
                options: Mutex::new(ClusterOptions::default()),
                config: Mutex::new(None),
                configured_tx,
                configured_rx,
                last_bootstrap_error: Mutex::new(None),
                next_index: Mutex::new(0),
                pools: Mutex::new(Pools::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Install the initial configuration, randomizing the round-robin start.
    pub fn set_configuration(
        &self,
        config: Config,
        options: ClusterOptions,
        credentials: Credentials,
    ) {
        let next_index = if config.nodes.len() > 1 {
            rand::rng().random_range(0..config.nodes.len())
        } else {
            0
        };
        {
            *self.inner.options.lock().unwrap() = options;
            *self.inner.credentials.lock().unwrap() = credentials;
            *self.inner.next_index.lock().unwrap() = next_index;
            *self.inner.config.lock().unwrap() = Some(config);
            self.inner.last_bootstrap_error.lock().unwrap().take();
        }
        let _ = self.inner.configured_tx.send(true);
    }

    fn apply_config(&self, config: Config) {
        let network = self.inner.options.lock().unwrap().network.clone();
        let tls = self.inner.tls.is_some();
        {
            let mut current = self.inner.config.lock().unwrap();
            let mut pools = self.inner.pools.lock().unwrap();
            for (service, sessions) in pools.idle.iter_mut() {
                sessions.retain(|session| {
                    config.has_node(&network, *service, tls, session.hostname(), session.port())
                });
            }
            *current = Some(config);
        }
        let _ = self.inner.configured_tx.send(true);
    }

    /// Record a bootstrap failure so queued submissions can fail fast.
    pub fn notify_bootstrap_error(&self, error: Error) {
        debug!(%error, "received bootstrap error notification");
        *self.inner.last_bootstrap_error.lock().unwrap() = Some(error);
        // wake the deferred submissions; they observe the error on resume
        let _ = self.inner.configured_tx.send(true);
    }

    pub fn is_configured(&self) -> bool {
        *self.inner.configured_rx.borrow()
    }

    /// Borrow a session for `service`, honoring node affinity.
    pub fn check_out(
        &self,
        service: ServiceType,
        mut preferred_node: Option<String>,
        undesired_node: Option<String>,
    ) -> Result<Arc<HttpSession>> {
        if preferred_node.is_none() {
            if let Some(undesired) = &undesired_node {
                if let Some((hostname, port)) = self.pick_random_node(service, undesired) {
                    preferred_node = Some(format!("{hostname}:{port}"));
                }
            }
        }

        let mut pools = self.inner.pools.lock().unwrap();
        let idle = pools.idle.entry(service).or_default();

        let mut session: Option<Arc<HttpSession>> = None;
        match &preferred_node {
            None => {
                while let Some(candidate) = idle.first().cloned() {
                    idle.remove(0);
                    if candidate.reset_idle() {
                        session = Some(candidate);
                        break;
                    }
                    trace!(
                        "{} idle timer has expired, selecting another session",
                        candidate.log_prefix()
                    );
                }
            }
            Some(preferred) => {
                let (hostname, port) = split_host_port(preferred);
                while let Some(position) = idle.iter().position(|candidate| {
                    candidate.remote_address() == *preferred
                        || (candidate.hostname() == hostname && candidate.port() == port)
                }) {
                    let candidate = idle.remove(position);
                    if candidate.reset_idle() {
                        session = Some(candidate);
                        break;
                    }
                    trace!(
                        "{} idle timer has expired, selecting another session",
                        candidate.log_prefix()
                    );
                }
            }
        }

        let session = match session {
            Some(session) => session,
            None => {
                let endpoint = match &preferred_node {
                    Some(preferred) => self.lookup_node(service, preferred),
                    None => self.next_node(service),
                };
                let Some((hostname, port)) = endpoint else {
                    return Err(Error::ServiceNotAvailable(format!(
                        "no node exposes the {} service",
                        service.as_str()
                    )));
                };
                self.create_session(service, &hostname, port)
            }
        };

        if session.is_connected() {
            pools.busy.entry(service).or_default().push(session.clone());
        } else {
            pools.pending.entry(service).or_default().push(session.clone());
        }
        Ok(session)
    }

    /// Return a session to the pool, keeping it only when it may be reused.
    pub fn check_in(&self, service: ServiceType, session: Arc<HttpSession>) {
        if !session.is_connected() {
            debug!("{} HTTP session never connected, skipping check-in", session.log_prefix());
            let mut pools = self.inner.pools.lock().unwrap();
            pools.remove_everywhere(service, session.id());
            return;
        }
        let endpoint_known = {
            let network = self.inner.options.lock().unwrap().network.clone();
            let config = self.inner.config.lock().unwrap();
            config.as_ref().is_some_and(|config| {
                config.has_node(
                    &network,
                    service,
                    self.inner.tls.is_some(),
                    session.hostname(),
                    session.port(),
                )
            })
        };
        if !session.keep_alive() || !endpoint_known {
            let mut pools = self.inner.pools.lock().unwrap();
            pools.remove_everywhere(service, session.id());
            drop(pools);
            session.stop();
            return;
        }
        if !session.is_stopped() {
            let idle_timeout = self.inner.options.lock().unwrap().idle_http_connection_timeout;
            session.set_idle(idle_timeout);
            debug!("{} put HTTP session back to idle connections", session.log_prefix());
            let mut pools = self.inner.pools.lock().unwrap();
            pools.remove_everywhere(service, session.id());
            pools.idle.entry(service).or_default().push(session);
        }
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.configured_tx.send(true);
        let pools = {
            let mut guard = self.inner.pools.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for sessions in pools.idle.into_values() {
            for session in sessions {
                session.reset_idle();
                session.stop();
            }
        }
        for set in [pools.busy, pools.pending] {
            for sessions in set.into_values() {
                for session in sessions {
                    session.stop();
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Execute a buffered service request.
    pub async fn execute(&self, request: ServiceRequest) -> Result<HttpResponse> {
        self.execute_inner(request, None).await
    }

    /// Execute a streaming service request; rows at `pointer` go to `rows`.
    pub async fn execute_streaming(
        &self,
        request: ServiceRequest,
        pointer: &str,
        rows: RowCallback,
    ) -> Result<HttpResponse> {
        self.execute_inner(request, Some((pointer.to_string(), rows))).await
    }

    async fn execute_inner(
        &self,
        request: ServiceRequest,
        streaming: Option<(String, RowCallback)>,
    ) -> Result<HttpResponse> {
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.inner.options.lock().unwrap().http_timeout);
        let deadline = Instant::now() + timeout;

        self.wait_until_configured(deadline).await?;

        let (resolve_timeout, connect_timeout) = {
            let options = self.inner.options.lock().unwrap();
            (options.resolve_timeout, options.connect_timeout)
        };

        let http_request = HttpRequest {
            method: request.method.clone(),
            path: request.path.clone(),
            headers: Vec::new(),
            content_type: request.content_type.clone(),
            body: request.body.clone(),
        };

        let mut session =
            self.check_out(request.service, request.send_to_node.clone(), request.undesired_node.clone())?;

        // connect-with-timeout orchestration: a dead candidate is stopped and
        // replaced with the next node until the deadline passes
        while !session.is_connected() {
            if Instant::now() >= deadline {
                session.stop();
                self.forget(request.service, &session);
                return Err(Error::UnambiguousTimeout);
            }
            match session.connect(resolve_timeout, connect_timeout).await {
                Ok(()) => {
                    self.promote_to_busy(request.service, &session);
                }
                Err(error) => {
                    trace!(
                        "{} failed to connect, selecting another node: {error}",
                        session.log_prefix()
                    );
                    session.stop();
                    self.forget(request.service, &session);
                    let endpoint = match &request.send_to_node {
                        Some(preferred) => self.lookup_node(request.service, preferred),
                        None => self.next_node(request.service),
                    };
                    let Some((hostname, port)) = endpoint else {
                        return Err(Error::ServiceNotAvailable(format!(
                            "no node exposes the {} service",
                            request.service.as_str()
                        )));
                    };
                    let replacement = self.create_session(request.service, &hostname, port);
                    self.inner
                        .pools
                        .lock()
                        .unwrap()
                        .pending
                        .entry(request.service)
                        .or_default()
                        .push(replacement.clone());
                    session = replacement;
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let send = async {
            match streaming {
                None => session.send(&http_request).await,
                Some((pointer, rows)) => {
                    session.send_streaming(&http_request, &pointer, rows).await
                }
            }
        };
        let result = match tokio::time::timeout(remaining, send).await {
            Ok(result) => result,
            Err(_) => {
                session.stop();
                self.forget(request.service, &session);
                return Err(Error::UnambiguousTimeout);
            }
        };

        match result {
            Ok(response) => {
                self.check_in(request.service, session);
                Ok(response)
            }
            Err(error) => {
                self.forget(request.service, &session);
                Err(error)
            }
        }
    }

    /// NOOP-equivalent reachability probe against every node of each service.
    pub async fn ping(&self, services: &[ServiceType]) -> Vec<PingReport> {
        let endpoints: Vec<(ServiceType, String, u16)> = {
            let network = self.inner.options.lock().unwrap().network.clone();
            let tls = self.inner.tls.is_some();
            let config = self.inner.config.lock().unwrap();
            let Some(config) = config.as_ref() else {
                return Vec::new();
            };
            let mut endpoints = Vec::new();
            for node in &config.nodes {
                for service in services {
                    let port = node.port_or(&network, *service, tls, 0);
                    if port != 0 {
                        endpoints.push((*service, node.hostname_for(&network).to_string(), port));
                    }
                }
            }
            endpoints
        };

        let mut reports = Vec::with_capacity(endpoints.len());
        for (service, hostname, port) in endpoints {
            let endpoint = format!("{hostname}:{port}");
            let started = Instant::now();
            let request = ServiceRequest {
                service,
                method: "GET".into(),
                path: ping_path(service).into(),
                send_to_node: Some(endpoint.clone()),
                ..Default::default()
            };
            let latency = self.execute(request).await.map(|_| started.elapsed());
            reports.push(PingReport { service, endpoint, latency });
        }
        reports
    }

    async fn wait_until_configured(&self, deadline: Instant) -> Result<()> {
        let mut configured_rx = self.inner.configured_rx.clone();
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::ClusterClosed);
            }
            if let Some(error) = self.inner.last_bootstrap_error.lock().unwrap().clone() {
                return Err(error);
            }
            if *configured_rx.borrow() && self.inner.config.lock().unwrap().is_some() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::UnambiguousTimeout);
            }
            match tokio::time::timeout(remaining, configured_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::ClusterClosed),
                Err(_) => return Err(Error::UnambiguousTimeout),
            }
        }
    }

    fn promote_to_busy(&self, service: ServiceType, session: &Arc<HttpSession>) {
        let mut pools = self.inner.pools.lock().unwrap();
        pools.remove_everywhere(service, session.id());
        pools.busy.entry(service).or_default().push(session.clone());
    }

    fn forget(&self, service: ServiceType, session: &Arc<HttpSession>) {
        let mut pools = self.inner.pools.lock().unwrap();
        pools.remove_everywhere(service, session.id());
    }

    fn create_session(&self, service: ServiceType, hostname: &str, port: u16) -> Arc<HttpSession> {
        let credentials = self.inner.credentials.lock().unwrap().clone();
        let session = HttpSession::new(
            service,
            self.inner.client_id.clone(),
            credentials,
            hostname,
            port,
            self.inner.tls.clone(),
        );
        let manager = self.clone();
        let id = session.id().to_string();
        session.on_stop(Box::new(move || {
            manager.inner.pools.lock().unwrap().remove_everywhere(service, &id);
        }));
        session
    }

    fn next_node(&self, service: ServiceType) -> Option<(String, u16)> {
        let network = self.inner.options.lock().unwrap().network.clone();
        let tls = self.inner.tls.is_some();
        let config = self.inner.config.lock().unwrap();
        let config = config.as_ref()?;
        let mut next_index = self.inner.next_index.lock().unwrap();
        let mut candidates = config.nodes.len();
        while candidates > 0 {
            candidates -= 1;
            let node = &config.nodes[*next_index];
            *next_index = (*next_index + 1) % config.nodes.len();
            let port = node.port_or(&network, service, tls, 0);
            if port != 0 {
                return Some((node.hostname_for(&network).to_string(), port));
            }
        }
        None
    }

    fn lookup_node(&self, service: ServiceType, preferred_node: &str) -> Option<(String, u16)> {
        let network = self.inner.options.lock().unwrap().network.clone();
        let tls = self.inner.tls.is_some();
        let config = self.inner.config.lock().unwrap();
        let config = config.as_ref()?;
        let (hostname, port) = split_host_port(preferred_node);
        if port == 0 {
            return None;
        }
        config
            .nodes
            .iter()
            .any(|node| {
                node.hostname_for(&network) == hostname
                    && node.port_or(&network, service, tls, 0) == port
            })
            .then(|| (hostname, port))
    }

    fn pick_random_node(&self, service: ServiceType, undesired_node: &str) -> Option<(String, u16)> {
        let network = self.inner.options.lock().unwrap().network.clone();
        let tls = self.inner.tls.is_some();
        let config = self.inner.config.lock().unwrap();
        let config = config.as_ref()?;
        let candidates: Vec<(String, u16)> = config
            .nodes
            .iter()
            .filter_map(|node| {
                let endpoint = node.endpoint(&network, service, tls)?;
                if endpoint == undesired_node {
                    return None;
                }
                Some((node.hostname_for(&network).to_string(), node.port_or(&network, service, tls, 0)))
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..candidates.len());
        Some(candidates[index].clone())
    }

    /// Membership counts `(idle, busy, pending)`, for diagnostics and tests.
    pub fn pool_sizes(&self, service: ServiceType) -> (usize, usize, usize) {
        let pools = self.inner.pools.lock().unwrap();
        (
            pools.idle.get(&service).map_or(0, Vec::len),
            pools.busy.get(&service).map_or(0, Vec::len),
            pools.pending.get(&service).map_or(0, Vec::len),
        )
    }
}

fn split_host_port(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((hostname, port)) => {
            (hostname.to_string(), port.parse().unwrap_or(0))
        }
        None => (address.to_string(), 0),
    }
}

fn ping_path(service: ServiceType) -> &'static str {
    match service {
        ServiceType::Query => "/admin/ping",
        ServiceType::Search => "/api/ping",
        ServiceType::Analytics => "/admin/ping",
        ServiceType::Views => "/",
        ServiceType::Eventing => "/api/v1/config",
        ServiceType::Management | ServiceType::KeyValue => "/pools",
    }
}
