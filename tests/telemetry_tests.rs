//! Telemetry reporter tests against a hand-rolled WebSocket endpoint

use std::time::Duration;

use cellar_client::options::{ClusterOptions, Credentials};
use cellar_client::telemetry::meter::{AppTelemetryMeter, CounterKind, LatencyKind};
use cellar_client::telemetry::reporter::AppTelemetryReporter;
use cellar_client::topology::{Config, ServiceType};
use cellar_client::websocket::accept_signature;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct WsHarness {
    socket: TcpStream,
}

impl WsHarness {
    /// Accept the client handshake, validating the key and auth headers.
    async fn accept(listener: &TcpListener) -> WsHarness {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let read = socket.read(&mut chunk).await.unwrap();
            assert!(read > 0, "client hung up during handshake");
            buffer.extend_from_slice(&chunk[..read]);
            if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&buffer).to_string();
        assert!(head.starts_with("GET /_telemetry HTTP/1.1\r\n"), "head: {head}");
        assert!(head.contains("Upgrade: websocket"));
        assert!(head.contains("Sec-WebSocket-Version: 13"));
        assert!(head.contains("Authorization: Basic "));

        let key = head
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .expect("handshake carries a key")
            .trim()
            .to_string();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_signature(&key)
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        WsHarness { socket }
    }

    /// Send an unmasked server frame.
    async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mut frame = vec![0x80 | opcode];
        assert!(payload.len() <= 125);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        self.socket.write_all(&frame).await.unwrap();
    }

    /// Read one client frame, unmasking the payload.
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.socket.read_exact(&mut header).await.unwrap();
        let opcode = header[0] & 0x0f;
        let masked = header[1] & 0x80 != 0;
        assert!(masked, "client frames must be masked");
        let length = match header[1] & 0x7f {
            126 => {
                let mut extended = [0u8; 2];
                self.socket.read_exact(&mut extended).await.unwrap();
                u16::from_be_bytes(extended) as usize
            }
            127 => {
                let mut extended = [0u8; 8];
                self.socket.read_exact(&mut extended).await.unwrap();
                u64::from_be_bytes(extended) as usize
            }
            short => short as usize,
        };
        let mut mask = [0u8; 4];
        self.socket.read_exact(&mut mask).await.unwrap();
        let mut payload = vec![0u8; length];
        self.socket.read_exact(&mut payload).await.unwrap();
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[index % 4];
        }
        (opcode, payload)
    }

    /// Skip ping frames until a frame of `wanted` arrives.
    async fn read_frame_of(&mut self, wanted: u8) -> Vec<u8> {
        loop {
            let (opcode, payload) = self.read_frame().await;
            if opcode == wanted {
                return payload;
            }
        }
    }
}

fn reporter_for(endpoint: &str, meter: std::sync::Arc<AppTelemetryMeter>) -> AppTelemetryReporter {
    let options = ClusterOptions::builder()
        .app_telemetry_endpoint(Some(endpoint.to_string()))
        .app_telemetry_ping_interval(Duration::from_secs(30))
        .app_telemetry_ping_timeout(Duration::from_secs(5))
        .build();
    AppTelemetryReporter::new(meter, options, Credentials::new("tester", "secret"), None)
}

fn empty_config() -> Config {
    Config::parse(r#"{"rev": 1, "nodes": []}"#, "localhost").unwrap()
}

const OPCODE_BINARY: u8 = 0x02;
const OPCODE_TEXT: u8 = 0x01;
const OPCODE_PING: u8 = 0x09;
const OPCODE_PONG: u8 = 0x0a;

#[tokio::test]
async fn answers_get_telemetry_with_the_meter_report() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://127.0.0.1:{}/_telemetry", listener.local_addr().unwrap().port());

    let meter = AppTelemetryMeter::new();
    let recorder = meter.value_recorder("uuid-1", "travel");
    recorder.record_latency(LatencyKind::KvRetrieval, Duration::from_millis(3));
    recorder.update_counter(CounterKind::total_for(ServiceType::KeyValue));

    let reporter = reporter_for(&endpoint, meter.clone());
    // a topology update triggers the dial; explicit endpoints ignore its nodes
    cellar_client::session::ConfigListener::update_config(&reporter, empty_config());

    let mut harness = WsHarness::accept(&listener).await;
    // the client probes with a ping immediately after the upgrade
    let _ = harness.read_frame_of(OPCODE_PING).await;
    harness.send_frame(OPCODE_PONG, b"").await;

    harness.send_frame(OPCODE_BINARY, &[0x00]).await;
    let response = harness.read_frame_of(OPCODE_BINARY).await;
    assert_eq!(response[0], 0x00, "status byte");
    let report = String::from_utf8_lossy(&response[1..]).to_string();
    assert!(report.contains("sdk_kv_retrieval_duration_milliseconds_bucket"), "report: {report}");
    assert!(report.contains("node_uuid=\"uuid-1\""));

    reporter.stop();
}

#[tokio::test]
async fn unknown_telemetry_opcodes_get_the_error_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://127.0.0.1:{}/_telemetry", listener.local_addr().unwrap().port());
    let reporter = reporter_for(&endpoint, AppTelemetryMeter::new());
    cellar_client::session::ConfigListener::update_config(&reporter, empty_config());

    let mut harness = WsHarness::accept(&listener).await;
    let _ = harness.read_frame_of(OPCODE_PING).await;
    harness.send_frame(OPCODE_PONG, b"").await;

    harness.send_frame(OPCODE_BINARY, &[0x7f]).await;
    let response = harness.read_frame_of(OPCODE_BINARY).await;
    assert_eq!(response, vec![0x01]);

    reporter.stop();
}

#[tokio::test]
async fn server_pings_are_answered_with_matching_pongs() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://127.0.0.1:{}/_telemetry", listener.local_addr().unwrap().port());
    let reporter = reporter_for(&endpoint, AppTelemetryMeter::new());
    cellar_client::session::ConfigListener::update_config(&reporter, empty_config());

    let mut harness = WsHarness::accept(&listener).await;
    let _ = harness.read_frame_of(OPCODE_PING).await;
    harness.send_frame(OPCODE_PONG, b"").await;

    harness.send_frame(OPCODE_PING, b"heartbeat").await;
    let payload = harness.read_frame_of(OPCODE_PONG).await;
    assert_eq!(payload, b"heartbeat");

    reporter.stop();
}

#[tokio::test]
async fn text_frames_terminate_the_session_and_reconnection_follows() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://127.0.0.1:{}/_telemetry", listener.local_addr().unwrap().port());
    let reporter = reporter_for(&endpoint, AppTelemetryMeter::new());
    cellar_client::session::ConfigListener::update_config(&reporter, empty_config());

    {
        let mut harness = WsHarness::accept(&listener).await;
        let _ = harness.read_frame_of(OPCODE_PING).await;
        harness.send_frame(OPCODE_PONG, b"").await;
        harness.send_frame(OPCODE_TEXT, b"not allowed").await;
        // the client treats text as a protocol error and drops the socket
        let mut probe = [0u8; 1];
        let read = harness.socket.read(&mut probe).await.unwrap_or(0);
        assert_eq!(read, 0, "expected the client to close the connection");
    }

    // with a single endpoint the cycle completes instantly and backoff
    // engages, so the next dial arrives after a small delay
    let reconnected =
        tokio::time::timeout(Duration::from_secs(5), WsHarness::accept(&listener)).await;
    assert!(reconnected.is_ok(), "expected a reconnection attempt");

    reporter.stop();
}
