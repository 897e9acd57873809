//! Application-telemetry reporter: reverse WebSocket to the collector
//!
//! The client dials a collector endpoint discovered from the topology (or
//! configured explicitly), then answers server-initiated `GET_TELEMETRY`
//! requests with the meter's report. Reconnection cycles round-robin over
//! the candidate endpoints; once a full cycle fails, exponential backoff
//! with jitter kicks in until a handshake succeeds again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::options::{ClusterOptions, Credentials};
use crate::session::ConfigListener;
use crate::stream::{Stream, TlsContext};
use crate::telemetry::meter::AppTelemetryMeter;
use crate::topology::{Config, TelemetryAddress, app_telemetry_addresses};
use crate::websocket::{WebSocketCodec, WsEvent};

const TELEMETRY_OPCODE_GET: u8 = 0x00;
const TELEMETRY_STATUS_SUCCESS: u8 = 0x00;
const TELEMETRY_STATUS_UNKNOWN_COMMAND: u8 = 0x01;

const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: f64 = 2.0;
const BACKOFF_JITTER: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

struct ReporterState {
    connection: ConnectionState,
    addresses: Vec<TelemetryAddress>,
    next_address_index: usize,
    /// Consecutive failed attempts; reset once the handshake completes.
    connection_attempts: u32,
    use_backoff: bool,
    fixed_endpoint: bool,
    session_generation: u64,
    stop_tx: Option<watch::Sender<bool>>,
    backoff_task: Option<AbortHandle>,
}

struct ReporterInner {
    meter: Arc<AppTelemetryMeter>,
    options: ClusterOptions,
    credentials: Credentials,
    tls: Option<TlsContext>,
    state: Mutex<ReporterState>,
}

#[derive(Clone)]
pub struct AppTelemetryReporter {
    inner: Arc<ReporterInner>,
}

impl ConfigListener for AppTelemetryReporter {
    fn update_config(&self, config: Config) {
        self.handle_config(&config);
    }
}

impl AppTelemetryReporter {
    pub fn new(
        meter: Arc<AppTelemetryMeter>,
        options: ClusterOptions,
        credentials: Credentials,
        tls: Option<TlsContext>,
    ) -> AppTelemetryReporter {
        let mut addresses = Vec::new();
        let mut fixed_endpoint = false;
        if options.enable_app_telemetry {
            if let Some(endpoint) = &options.app_telemetry_endpoint {
                match parse_ws_endpoint(endpoint) {
                    Some(address) => {
                        addresses.push(address);
                        fixed_endpoint = true;
                    }
                    None => {
                        warn!(
                            endpoint = %endpoint,
                            "unable to use value as an app telemetry endpoint (expected ws:// and hostname)"
                        );
                    }
                }
            }
        } else {
            meter.disable();
        }
        AppTelemetryReporter {
            inner: Arc::new(ReporterInner {
                meter,
                options,
                credentials,
                tls,
                state: Mutex::new(ReporterState {
                    connection: ConnectionState::Disconnected,
                    addresses,
                    next_address_index: 0,
                    connection_attempts: 0,
                    use_backoff: false,
                    fixed_endpoint,
                    session_generation: 0,
                    stop_tx: None,
                    backoff_task: None,
                }),
            }),
        }
    }

    pub fn stop(&self) {
        self.inner.meter.disable();
        let mut state = self.inner.state.lock().unwrap();
        state.connection = ConnectionState::Stopped;
        state.session_generation += 1;
        if let Some(task) = state.backoff_task.take() {
            task.abort();
        }
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
    }

    fn handle_config(&self, config: &Config) {
        if !self.inner.options.enable_app_telemetry {
            self.inner.meter.disable();
            return;
        }
        self.inner.meter.update_config(config);

        let dial_now = {
            let mut state = self.inner.state.lock().unwrap();
            if state.connection == ConnectionState::Stopped {
                return;
            }
            if !state.fixed_endpoint {
                state.addresses = app_telemetry_addresses(
                    config,
                    self.inner.tls.is_some(),
                    &self.inner.options.network,
                );
                state.next_address_index = 0;
            }
            if state.addresses.is_empty() {
                self.inner.meter.disable();
                false
            } else {
                self.inner.meter.enable();
                state.connection == ConnectionState::Disconnected
            }
        };
        if dial_now {
            self.dial_next();
        }
    }

    /// Pick the current address and spawn a session task for it.
    fn dial_next(&self) {
        let (address, generation, stop_rx) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.connection == ConnectionState::Stopped || state.addresses.is_empty() {
                return;
            }
            state.session_generation += 1;
            state.connection = ConnectionState::Connecting;
            let (stop_tx, stop_rx) = watch::channel(false);
            state.stop_tx = Some(stop_tx);
            let index = state.next_address_index.min(state.addresses.len() - 1);
            (state.addresses[index].clone(), state.session_generation, stop_rx)
        };

        debug!(hostname = %address.hostname, port = address.port, "connecting app telemetry WebSocket");
        let reporter = self.clone();
        tokio::spawn(async move {
            let error = run_session(&reporter, &address, generation, stop_rx).await;
            reporter.on_session_end(generation, &address, error);
        });
    }

    fn on_websocket_ready(&self, generation: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if state.session_generation != generation {
            return;
        }
        state.connection = ConnectionState::Connected;
        state.connection_attempts = 0;
        state.use_backoff = false;
    }

    fn on_session_end(&self, generation: u64, address: &TelemetryAddress, error: Option<Error>) {
        let backoff = {
            let mut state = self.inner.state.lock().unwrap();
            if state.session_generation != generation
                || state.connection == ConnectionState::Stopped
            {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.stop_tx = None;

            if state.addresses.is_empty() {
                warn!(
                    hostname = %address.hostname,
                    "not reconnecting application telemetry, no node exposes the collector endpoint"
                );
                return;
            }

            state.connection_attempts += 1;
            state.next_address_index += 1;
            if state.next_address_index >= state.addresses.len() {
                // a full pass over the candidates failed; randomize the order
                // and start backing off
                state.addresses.shuffle(&mut rand::rng());
                state.next_address_index = 0;
                state.use_backoff = true;
            }
            let backoff = if state.use_backoff {
                backoff_with_jitter(
                    BACKOFF_MIN,
                    self.inner.options.app_telemetry_backoff_interval,
                    state.connection_attempts,
                )
            } else {
                Duration::ZERO
            };
            warn!(
                error = %error.map(|e| e.to_string()).unwrap_or_else(|| "peer closed".into()),
                connection_attempts = state.connection_attempts,
                hostname = %address.hostname,
                backoff_ms = backoff.as_millis() as u64,
                "error from app telemetry endpoint, reconnecting"
            );
            backoff
        };

        if backoff.is_zero() {
            self.dial_next();
            return;
        }
        let reporter = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let disconnected = {
                let state = reporter.inner.state.lock().unwrap();
                state.connection == ConnectionState::Disconnected
            };
            if disconnected {
                reporter.dial_next();
            }
        });
        self.inner.state.lock().unwrap().backoff_task = Some(handle.abort_handle());
    }
}

fn parse_ws_endpoint(endpoint: &str) -> Option<TelemetryAddress> {
    let url = url::Url::parse(endpoint).ok()?;
    if url.scheme() != "ws" {
        return None;
    }
    let hostname = url.host_str()?.to_string();
    Some(TelemetryAddress {
        hostname,
        port: url.port().unwrap_or(80),
        path: url.path().to_string(),
        node_uuid: None,
    })
}

fn backoff_with_jitter(min: Duration, max: Duration, attempts: u32) -> Duration {
    let min_ms = min.as_millis() as f64;
    let max_ms = max.as_millis() as f64;
    let backoff = (min_ms * BACKOFF_FACTOR.powi(attempts as i32)).clamp(min_ms, max_ms);
    let jitter_offset = backoff * BACKOFF_JITTER;
    let low = (min_ms - backoff).max(-jitter_offset);
    let high = (max_ms - backoff).min(jitter_offset);
    let jitter = if high > low { rand::rng().random_range(low..=high) } else { 0.0 };
    Duration::from_millis((backoff + jitter).max(0.0) as u64)
}

/// Run one WebSocket session to completion. Returns the terminal error, or
/// `None` when the peer closed cleanly or a stop was requested.
async fn run_session(
    reporter: &AppTelemetryReporter,
    address: &TelemetryAddress,
    generation: u64,
    mut stop_rx: watch::Receiver<bool>,
) -> Option<Error> {
    let inner = &reporter.inner;
    let mut stream = match Stream::connect(
        &address.hostname,
        address.port,
        inner.options.resolve_timeout,
        inner.options.connect_timeout,
        inner.tls.as_ref(),
    )
    .await
    {
        Ok(stream) => stream,
        Err(error) => return Some(error),
    };

    let mut codec = WebSocketCodec::new();
    let authorization = BASE64.encode(format!(
        "{}:{}",
        inner.credentials.username, inner.credentials.password
    ));
    let handshake =
        codec.handshake_request(&address.path, &address.hostname, address.port, &authorization);
    if let Err(error) = stream.write_all(&handshake).await {
        return Some(error.into());
    }

    let mut buffer = bytes::BytesMut::with_capacity(4096);
    let mut ready = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;
    let mut ping_ticker = tokio::time::interval(inner.options.app_telemetry_ping_interval);
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_ticker.tick().await;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return None;
                }
            }
            _ = ping_ticker.tick(), if ready => {
                if stream.write_all(&codec.ping(b"")).await.is_err() {
                    return Some(Error::ConnectionError("failed to write ping".into()));
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(
                        tokio::time::Instant::now() + inner.options.app_telemetry_ping_timeout,
                    );
                }
            }
            _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(tokio::time::Instant::now)),
                if pong_deadline.is_some() =>
            {
                debug!(
                    hostname = %address.hostname,
                    "app telemetry websocket did not respond in time for ping request"
                );
                return Some(Error::UnambiguousTimeout);
            }
            read = stream.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => return Some(Error::EndOfStream),
                    Err(error) => return Some(error.into()),
                    Ok(_) => {}
                }
                let events = codec.feed(&buffer.split().freeze());
                for event in events {
                    match event {
                        WsEvent::Ready => {
                            ready = true;
                            reporter.on_websocket_ready(generation);
                            // probe immediately; the ticker takes over after
                            if stream.write_all(&codec.ping(b"")).await.is_err() {
                                return Some(Error::ConnectionError("failed to write ping".into()));
                            }
                            pong_deadline = Some(
                                tokio::time::Instant::now()
                                    + inner.options.app_telemetry_ping_timeout,
                            );
                        }
                        WsEvent::Binary(payload) => {
                            let response = build_telemetry_response(&inner.meter, &payload);
                            match response {
                                Some(response) => {
                                    if stream.write_all(&codec.binary(&response)).await.is_err() {
                                        return Some(Error::ConnectionError(
                                            "failed to write telemetry response".into(),
                                        ));
                                    }
                                }
                                None => {
                                    return Some(Error::ProtocolError(
                                        "invalid telemetry request".into(),
                                    ));
                                }
                            }
                        }
                        WsEvent::Text(_) => {
                            warn!(hostname = %address.hostname, "text messages are not supported");
                            return Some(Error::ProtocolError("unsupported frame: text".into()));
                        }
                        WsEvent::Ping(payload) => {
                            if stream.write_all(&codec.pong(&payload)).await.is_err() {
                                return Some(Error::ConnectionError("failed to write pong".into()));
                            }
                        }
                        WsEvent::Pong(_) => {
                            pong_deadline = None;
                        }
                        WsEvent::Close(_) => {
                            debug!(hostname = %address.hostname, "remote peer closed WebSocket");
                            return None;
                        }
                        WsEvent::Error(message) => {
                            warn!(hostname = %address.hostname, %message, "error from WebSocket codec");
                            return Some(Error::ProtocolError(message));
                        }
                    }
                }
            }
        }
    }
}

/// Status byte plus report for `GET_TELEMETRY`; `None` for an empty request.
fn build_telemetry_response(meter: &AppTelemetryMeter, payload: &[u8]) -> Option<Vec<u8>> {
    let opcode = *payload.first()?;
    if opcode != TELEMETRY_OPCODE_GET {
        let mut response = Vec::with_capacity(1);
        response.push(TELEMETRY_STATUS_UNKNOWN_COMMAND);
        return Some(response);
    }
    let mut response = vec![TELEMETRY_STATUS_SUCCESS];
    meter.generate_report(&mut response);
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_endpoint_requires_ws_scheme() {
        assert!(parse_ws_endpoint("wss://collector:9102/path").is_none());
        assert!(parse_ws_endpoint("http://collector/path").is_none());
        let address = parse_ws_endpoint("ws://collector:9102/v1/collect").unwrap();
        assert_eq!(address.hostname, "collector");
        assert_eq!(address.port, 9102);
        assert_eq!(address.path, "/v1/collect");
    }

    #[test]
    fn explicit_endpoint_defaults_port_and_path() {
        let address = parse_ws_endpoint("ws://collector").unwrap();
        assert_eq!(address.port, 80);
        assert_eq!(address.path, "/");
    }

    #[test]
    fn backoff_grows_and_respects_cap() {
        let max = Duration::from_secs(10);
        for attempts in 0..20 {
            let backoff = backoff_with_jitter(BACKOFF_MIN, max, attempts);
            assert!(backoff <= max + max.mul_f64(BACKOFF_JITTER));
        }
        // with jitter at ±50%, attempt 6 is at least (100ms * 2^6) / 2
        let sixth = backoff_with_jitter(BACKOFF_MIN, max, 6);
        assert!(sixth >= Duration::from_millis(3200));
    }

    #[test]
    fn unknown_telemetry_opcode_yields_error_status() {
        let meter = AppTelemetryMeter::new();
        let response = build_telemetry_response(&meter, &[0x42]).unwrap();
        assert_eq!(response, vec![TELEMETRY_STATUS_UNKNOWN_COMMAND]);
    }

    #[test]
    fn get_telemetry_yields_success_status_and_report() {
        let meter = AppTelemetryMeter::new();
        let response = build_telemetry_response(&meter, &[TELEMETRY_OPCODE_GET]).unwrap();
        assert_eq!(response[0], TELEMETRY_STATUS_SUCCESS);
    }

    #[test]
    fn empty_payload_is_invalid() {
        let meter = AppTelemetryMeter::new();
        assert!(build_telemetry_response(&meter, &[]).is_none());
    }
}
