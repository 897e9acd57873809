//! Binary session: one multiplexed connection to one node
//!
//! A session owns exactly one TCP/TLS stream. Commands are correlated by
//! opaque id through a pending map; writes funnel through a single writer
//! task so they complete in submission order. Bootstrap walks the handshake
//! state machine before the steady-state reader/writer tasks start.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::binary::codec::Codec;
use crate::binary::opcode::{HelloFeature, Opcode, REQUESTED_FEATURES, Status};
use crate::binary::packet::Packet;
use crate::error::{Error, Result};
use crate::options::{ClusterOptions, Credentials};
use crate::retry::RetryReason;
use crate::sasl::{self, SaslMechanism};
use crate::stream::{Stream, TlsContext};
use crate::topology::Config;

/// Consumer of topology updates pushed by a session.
pub trait ConfigListener: Send + Sync {
    fn update_config(&self, config: Config);
}

/// What the session should do with a response handler after invoking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerDisposition {
    Remove,
    Keep,
}

/// Handler registered per opaque. Receives a response packet or an error,
/// plus the retry reason derived from the transport.
pub type ResponseHandler =
    Box<dyn FnMut(Option<Packet>, Option<Error>, RetryReason) -> HandlerDisposition + Send>;

pub type StopListener = Box<dyn FnOnce(RetryReason) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Resolving,
    Connecting,
    Hello,
    SaslList,
    SaslAuth,
    SelectBucket,
    GetClusterConfig,
    Ready,
    Stopped,
}

struct SessionInner {
    id: String,
    client_id: String,
    bucket_name: Option<String>,
    hostname: String,
    port: u16,
    options: ClusterOptions,
    credentials: Credentials,
    tls: Option<TlsContext>,

    state: Mutex<SessionState>,
    codec: Mutex<Codec>,
    features: Mutex<HashSet<HelloFeature>>,
    error_map: Mutex<HashMap<u16, Vec<String>>>,
    pending: Mutex<HashMap<u32, ResponseHandler>>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    opaque_counter: AtomicU32,
    node_index: AtomicUsize,
    node_uuid: Mutex<Option<String>>,

    config_listeners: Mutex<Vec<Arc<dyn ConfigListener>>>,
    stop_listeners: Mutex<Vec<StopListener>>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("hostname", &self.inner.hostname)
            .field("port", &self.inner.port)
            .field("state", &*self.inner.state.lock().unwrap())
            .finish()
    }
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        options: ClusterOptions,
        credentials: Credentials,
        tls: Option<TlsContext>,
        bucket_name: Option<String>,
    ) -> Session {
        let id = format!("{:08x}", rand::random::<u32>());
        Session {
            inner: Arc::new(SessionInner {
                id,
                client_id: client_id.into(),
                bucket_name,
                hostname: hostname.into(),
                port,
                options,
                credentials,
                tls,
                state: Mutex::new(SessionState::Disconnected),
                codec: Mutex::new(Codec::default()),
                features: Mutex::new(HashSet::new()),
                error_map: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                write_tx: Mutex::new(None),
                opaque_counter: AtomicU32::new(1),
                node_index: AtomicUsize::new(usize::MAX),
                node_uuid: Mutex::new(None),
                config_listeners: Mutex::new(Vec::new()),
                stop_listeners: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn bootstrap_hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn bootstrap_port(&self) -> u16 {
        self.inner.port
    }

    /// Node index this session was assigned in the most recent topology.
    pub fn index(&self) -> usize {
        self.inner.node_index.load(Ordering::SeqCst)
    }

    pub fn node_uuid(&self) -> Option<String> {
        self.inner.node_uuid.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn has_config(&self) -> bool {
        *self.inner.state.lock().unwrap() == SessionState::Ready
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn supports_feature(&self, feature: HelloFeature) -> bool {
        self.inner.features.lock().unwrap().contains(&feature)
    }

    pub fn next_opaque(&self) -> u32 {
        self.inner.opaque_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether the server's error map marks `status` as retryable.
    pub fn error_map_retry_indicated(&self, status: u16) -> bool {
        self.inner.error_map.lock().unwrap().get(&status).is_some_and(|attrs| {
            attrs.iter().any(|attr| attr == "retry-now" || attr == "retry-later" || attr == "auto-retry")
        })
    }

    pub fn encode_packet(&self, packet: &Packet) -> Result<Vec<u8>> {
        self.inner.codec.lock().unwrap().encode_packet(packet)
    }

    /// Snappy-compress `value` when the feature is negotiated and it pays off.
    pub fn maybe_compress(&self, value: &[u8]) -> Option<Vec<u8>> {
        self.inner.codec.lock().unwrap().maybe_compress(value)
    }

    pub fn on_configuration_update(&self, listener: Arc<dyn ConfigListener>) {
        self.inner.config_listeners.lock().unwrap().push(listener);
    }

    pub fn on_stop(&self, listener: StopListener) {
        self.inner.stop_listeners.lock().unwrap().push(listener);
    }

    /// Register `handler` under `opaque` and enqueue `bytes` for the writer.
    /// The handler fires at most once per response (and exactly once per
    /// intermediate response for persistent commands).
    pub fn write_and_subscribe(&self, opaque: u32, bytes: Vec<u8>, handler: ResponseHandler) {
        if self.is_stopped() {
            let mut handler = handler;
            handler(None, Some(Error::RequestCanceled), RetryReason::SocketNotAvailable);
            return;
        }
        self.inner.pending.lock().unwrap().insert(opaque, handler);
        let sent = {
            let guard = self.inner.write_tx.lock().unwrap();
            guard.as_ref().map(|tx| tx.send(bytes).is_ok()).unwrap_or(false)
        };
        if !sent {
            if let Some(mut handler) = self.inner.pending.lock().unwrap().remove(&opaque) {
                handler(None, Some(Error::RequestCanceled), RetryReason::SocketNotAvailable);
            }
        }
    }

    /// Measure a NOOP round trip.
    pub async fn ping(&self) -> Result<std::time::Duration> {
        let started = std::time::Instant::now();
        let opaque = self.next_opaque();
        let mut packet = Packet::request(Opcode::Noop);
        packet.opaque = opaque;
        let bytes = self.encode_packet(&packet)?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut tx = Some(tx);
        self.write_and_subscribe(
            opaque,
            bytes,
            Box::new(move |response, error, _reason| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(match (response, error) {
                        (Some(_), None) => Ok(()),
                        (_, Some(error)) => Err(error),
                        _ => Err(Error::ProtocolError("noop yielded no response".into())),
                    });
                }
                HandlerDisposition::Remove
            }),
        );
        rx.await.map_err(|_| Error::RequestCanceled)??;
        Ok(started.elapsed())
    }

    /// Drive the bootstrap state machine to READY and return the initial
    /// topology. On success the steady-state reader and writer tasks are
    /// running.
    pub async fn bootstrap(&self) -> Result<Config> {
        let result = self.bootstrap_inner().await;
        if let Err(error) = &result {
            debug!(
                session_id = %self.inner.id,
                hostname = %self.inner.hostname,
                port = self.inner.port,
                %error,
                "bootstrap failed"
            );
            self.set_state(SessionState::Stopped);
            self.inner.stopped.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn bootstrap_inner(&self) -> Result<Config> {
        self.set_state(SessionState::Resolving);
        self.set_state(SessionState::Connecting);
        let mut stream = Stream::connect(
            &self.inner.hostname,
            self.inner.port,
            self.inner.options.resolve_timeout,
            self.inner.options.connect_timeout,
            self.inner.tls.as_ref(),
        )
        .await?;

        let mut read_buffer = BytesMut::with_capacity(16 * 1024);

        // HELLO
        self.set_state(SessionState::Hello);
        let mut hello = Packet::request(Opcode::Hello);
        hello.key = format!(
            "{{\"a\":\"cellar-rust/{}\",\"i\":\"{}/{}\"}}",
            env!("CARGO_PKG_VERSION"),
            self.inner.client_id,
            self.inner.id
        )
        .into_bytes();
        for feature in REQUESTED_FEATURES {
            hello.value.extend_from_slice(&(*feature as u16).to_be_bytes());
        }
        let response = self.round_trip(&mut stream, &mut read_buffer, hello).await?;
        if response.status_code() == Status::Success {
            let mut features = HashSet::new();
            for chunk in response.value.chunks_exact(2) {
                if let Some(feature) = HelloFeature::from_u16(u16::from_be_bytes([chunk[0], chunk[1]])) {
                    features.insert(feature);
                }
            }
            trace!(session_id = %self.inner.id, ?features, "negotiated features");
            {
                let mut codec = self.inner.codec.lock().unwrap();
                for feature in &features {
                    codec.enable_feature(*feature);
                }
            }
            *self.inner.features.lock().unwrap() = features;
        }

        // GET_ERROR_MAP (best effort; absence is not fatal)
        if self.supports_feature(HelloFeature::Xerror) {
            let mut request = Packet::request(Opcode::GetErrorMap);
            request.value = 2u16.to_be_bytes().to_vec();
            let response = self.round_trip(&mut stream, &mut read_buffer, request).await?;
            if response.status_code() == Status::Success {
                self.store_error_map(&response.value);
            }
        }

        // SASL
        self.set_state(SessionState::SaslList);
        let response = self
            .round_trip(&mut stream, &mut read_buffer, Packet::request(Opcode::SaslListMechs))
            .await?;
        let mechanisms = sasl::parse_mechanism_list(&response.value);
        let mechanism = sasl::select_mechanism(
            &mechanisms,
            self.inner.tls.is_some(),
            self.inner.credentials.allowed_sasl_mechanisms.as_deref(),
        )
        .ok_or_else(|| {
            Error::AuthenticationFailure(format!("no acceptable SASL mechanism in {mechanisms:?}"))
        })?;

        self.set_state(SessionState::SaslAuth);
        match mechanism {
            SaslMechanism::Plain => {
                let mut auth = Packet::request(Opcode::SaslAuth);
                auth.key = mechanism.as_str().as_bytes().to_vec();
                auth.value = sasl::plain_payload(
                    &self.inner.credentials.username,
                    &self.inner.credentials.password,
                );
                let response = self.round_trip(&mut stream, &mut read_buffer, auth).await?;
                if response.status_code() != Status::Success {
                    return Err(Error::AuthenticationFailure("PLAIN authentication rejected".into()));
                }
            }
            _ => {
                let mut client = sasl::ScramClient::new(
                    mechanism,
                    &self.inner.credentials.username,
                    &self.inner.credentials.password,
                );
                let mut auth = Packet::request(Opcode::SaslAuth);
                auth.key = mechanism.as_str().as_bytes().to_vec();
                auth.value = client.client_first_message().into_bytes();
                let response = self.round_trip(&mut stream, &mut read_buffer, auth).await?;
                match response.status_code() {
                    Status::AuthContinue => {
                        let final_message = client.handle_server_first(&response.value)?;
                        let mut step = Packet::request(Opcode::SaslStep);
                        step.key = mechanism.as_str().as_bytes().to_vec();
                        step.value = final_message.into_bytes();
                        let response = self.round_trip(&mut stream, &mut read_buffer, step).await?;
                        if response.status_code() != Status::Success {
                            return Err(Error::AuthenticationFailure(
                                "SCRAM final step rejected".into(),
                            ));
                        }
                        client.verify_server_final(&response.value)?;
                    }
                    Status::Success => {}
                    _ => {
                        return Err(Error::AuthenticationFailure("SCRAM authentication rejected".into()));
                    }
                }
            }
        }

        // SELECT_BUCKET only applies to bucket-scoped sessions
        if let Some(bucket_name) = &self.inner.bucket_name {
            self.set_state(SessionState::SelectBucket);
            let mut select = Packet::request(Opcode::SelectBucket);
            select.key = bucket_name.as_bytes().to_vec();
            let response = self.round_trip(&mut stream, &mut read_buffer, select).await?;
            if response.status_code() != Status::Success {
                return Err(Error::AuthenticationFailure(format!(
                    "unable to select bucket \"{bucket_name}\""
                )));
            }
        }

        self.set_state(SessionState::GetClusterConfig);
        let response = self
            .round_trip(&mut stream, &mut read_buffer, Packet::request(Opcode::GetClusterConfig))
            .await?;
        if response.status_code() != Status::Success {
            return Err(Error::ConfigurationNotAvailable);
        }
        let text = String::from_utf8_lossy(&response.value).to_string();
        let config = Config::parse(&text, &self.inner.hostname)?;
        self.remember_identity(&config);

        self.set_state(SessionState::Ready);
        self.start_io(stream, read_buffer);
        Ok(config)
    }

    fn remember_identity(&self, config: &Config) {
        for node in &config.nodes {
            let matched = node.addresses.values().any(|address| {
                address.hostname == self.inner.hostname
                    && (address.services_plain.kv == Some(self.inner.port)
                        || address.services_tls.kv == Some(self.inner.port))
            });
            if matched {
                self.inner.node_index.store(node.index, Ordering::SeqCst);
                if !node.node_uuid.is_empty() {
                    *self.inner.node_uuid.lock().unwrap() = Some(node.node_uuid.clone());
                }
                return;
            }
        }
    }

    fn store_error_map(&self, payload: &[u8]) {
        #[derive(serde::Deserialize)]
        struct RawErrorMap {
            #[serde(default)]
            errors: HashMap<String, RawErrorEntry>,
        }
        #[derive(serde::Deserialize)]
        struct RawErrorEntry {
            #[serde(default)]
            attrs: Vec<String>,
        }
        match serde_json::from_slice::<RawErrorMap>(payload) {
            Ok(map) => {
                let mut parsed = HashMap::new();
                for (code, entry) in map.errors {
                    if let Ok(status) = u16::from_str_radix(&code, 16) {
                        parsed.insert(status, entry.attrs);
                    }
                }
                *self.inner.error_map.lock().unwrap() = parsed;
            }
            Err(error) => debug!(%error, "unable to parse error map, ignoring"),
        }
    }

    async fn round_trip(
        &self,
        stream: &mut Stream,
        buffer: &mut BytesMut,
        packet: Packet,
    ) -> Result<Packet> {
        let mut packet = packet;
        packet.opaque = self.next_opaque();
        let bytes = self.encode_packet(&packet)?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        loop {
            let decoded = {
                let codec = self.inner.codec.lock().unwrap();
                codec.decode_packet(buffer)
            };
            match decoded {
                Ok((response, consumed)) => {
                    buffer.advance(consumed);
                    if response.opaque != packet.opaque {
                        // unsolicited traffic during bootstrap is dropped
                        continue;
                    }
                    return Ok(response);
                }
                Err(Error::NeedMoreData) | Err(Error::EndOfStream) => {
                    let read = stream.read_buf(buffer).await?;
                    if read == 0 {
                        return Err(Error::EndOfStream);
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.inner.state.lock().unwrap() = state;
    }

    fn start_io(&self, stream: Stream, read_buffer: BytesMut) {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.inner.write_tx.lock().unwrap() = Some(tx);

        let writer_session = self.clone();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() || write_half.flush().await.is_err() {
                    writer_session.handle_socket_closed();
                    return;
                }
            }
        });

        let reader_session = self.clone();
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buffer = read_buffer;
            loop {
                loop {
                    let decoded = {
                        let codec = reader_session.inner.codec.lock().unwrap();
                        codec.decode_packet(&buffer)
                    };
                    match decoded {
                        Ok((packet, consumed)) => {
                            buffer.advance(consumed);
                            reader_session.dispatch_packet(packet);
                        }
                        Err(Error::NeedMoreData) | Err(Error::EndOfStream) => break,
                        Err(error) => {
                            warn!(session_id = %reader_session.inner.id, %error, "protocol error, closing session");
                            reader_session.handle_socket_closed();
                            return;
                        }
                    }
                }
                match read_half.read_buf(&mut buffer).await {
                    Ok(0) | Err(_) => {
                        reader_session.handle_socket_closed();
                        return;
                    }
                    Ok(_) => {}
                }
            }
        });

        let keepalive_session = self.clone();
        let keepalive_interval = self.inner.options.keepalive_interval;
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_session.is_stopped() {
                    return;
                }
                if keepalive_session.ping().await.is_err() {
                    return;
                }
            }
        });

        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.push(writer);
        tasks.push(reader);
        tasks.push(keepalive);
    }

    fn dispatch_packet(&self, packet: Packet) {
        // piggy-backed topology in a not-my-vbucket body converges routing
        // without waiting for the next config poll
        if packet.magic.is_response()
            && packet.status_code() == Status::NotMyVbucket
            && !packet.value.is_empty()
        {
            let text = String::from_utf8_lossy(&packet.value).to_string();
            if let Ok(config) = Config::parse(&text, &self.inner.hostname) {
                self.fan_out_config(config);
            }
        }

        let opaque = packet.opaque;
        let handler = self.inner.pending.lock().unwrap().remove(&opaque);
        match handler {
            Some(mut handler) => {
                let disposition = handler(Some(packet), None, RetryReason::DoNotRetry);
                if disposition == HandlerDisposition::Keep {
                    // persistent commands stay subscribed for further responses
                    self.inner.pending.lock().unwrap().insert(opaque, handler);
                }
            }
            None => {
                if packet.opcode == Opcode::GetClusterConfig && !packet.value.is_empty() {
                    let text = String::from_utf8_lossy(&packet.value).to_string();
                    if let Ok(config) = Config::parse(&text, &self.inner.hostname) {
                        self.fan_out_config(config);
                    }
                } else {
                    trace!(
                        session_id = %self.inner.id,
                        opaque = packet.opaque,
                        "response without a subscriber, dropping"
                    );
                }
            }
        }
    }

    fn fan_out_config(&self, config: Config) {
        let listeners = self.inner.config_listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.update_config(config.clone());
        }
    }

    fn handle_socket_closed(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Stopped);
        self.inner.write_tx.lock().unwrap().take();
        self.fail_pending(RetryReason::SocketClosedWhileInFlight);
        self.run_stop_listeners(RetryReason::SocketClosedWhileInFlight);
    }

    /// Close the stream and fail everything in flight with `request_canceled`.
    pub fn stop(&self, reason: RetryReason) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Stopped);
        self.inner.write_tx.lock().unwrap().take();
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.fail_pending(reason);
        self.run_stop_listeners(reason);
    }

    fn fail_pending(&self, reason: RetryReason) {
        let pending: Vec<(u32, ResponseHandler)> =
            self.inner.pending.lock().unwrap().drain().collect();
        for (opaque, mut handler) in pending {
            trace!(session_id = %self.inner.id, opaque, "failing in-flight command");
            handler(None, Some(Error::RequestCanceled), reason);
        }
    }

    fn run_stop_listeners(&self, reason: RetryReason) {
        let listeners: Vec<StopListener> =
            self.inner.stop_listeners.lock().unwrap().drain(..).collect();
        for listener in listeners {
            listener(reason);
        }
    }
}
