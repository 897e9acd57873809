//! In-process node speaking the binary protocol
//!
//! Covers the bootstrap sequence (HELLO, error map, SASL with PLAIN and
//! SCRAM-SHA256, select-bucket, cluster config) and a small scripted command
//! surface on top of an in-memory document store. Tests use it to drive the
//! whole stack end to end without a real cluster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::binary::codec::Codec;
use crate::binary::opcode::{HelloFeature, Magic, Opcode, Status, datatype};
use crate::binary::packet::Packet;
use crate::bucket::Bucket;
use crate::error::Error;
use crate::options::{ClusterOptions, Credentials};
use crate::sasl::{self, SaslMechanism};
use crate::testing::fixtures;

const MOCK_USERNAME: &str = "tester";
const MOCK_PASSWORD: &str = "secret";

/// One canned response. When an opcode has scripted replies queued, the next
/// request of that opcode consumes one entry and sends every packet in it.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub status: Status,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub delay: Option<Duration>,
}

impl ScriptedReply {
    pub fn with_status(status: Status) -> ScriptedReply {
        ScriptedReply { status, ..Default::default() }
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

struct NodeState {
    config_json: Mutex<String>,
    documents: Mutex<HashMap<Vec<u8>, StoredDocument>>,
    collections: Mutex<HashMap<String, u32>>,
    request_counts: Mutex<HashMap<Opcode, u64>>,
    /// opcode -> queue of multi-packet replies
    scripted: Mutex<HashMap<Opcode, VecDeque<Vec<ScriptedReply>>>>,
    response_delay: Mutex<HashMap<Opcode, Duration>>,
    /// Collection ids decoded from incoming document commands, in order.
    seen_collection_ids: Mutex<Vec<u32>>,
    cas_counter: AtomicU64,
}

/// A live TCP endpoint behaving like one cluster node.
pub struct MockNode {
    port: u16,
    state: Arc<NodeState>,
    accept_task: JoinHandle<()>,
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl MockNode {
    pub async fn start() -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock node");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(NodeState {
            config_json: Mutex::new(fixtures::single_node_config(1, "127.0.0.1", port)),
            documents: Mutex::new(HashMap::new()),
            collections: Mutex::new(HashMap::new()),
            request_counts: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            response_delay: Mutex::new(HashMap::new()),
            seen_collection_ids: Mutex::new(Vec::new()),
            cas_counter: AtomicU64::new(1),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let connection_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, connection_state).await;
                });
            }
        });

        MockNode { port, state, accept_task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_string(&self) -> String {
        format!("cellar://127.0.0.1:{}", self.port)
    }

    pub fn credentials() -> Credentials {
        Credentials::new(MOCK_USERNAME, MOCK_PASSWORD)
    }

    /// Options tuned for fast tests against the mock.
    pub fn options() -> ClusterOptions {
        ClusterOptions::builder()
            .key_value_timeout(Duration::from_millis(2500))
            .enable_app_telemetry(false)
            .build()
    }

    /// Convenience: a bootstrapped bucket router pointed at this node.
    pub async fn bucket(&self, name: &str) -> Bucket {
        let bucket = Bucket::new(
            "test-client",
            name,
            Self::options(),
            Self::credentials(),
            None,
            vec![("127.0.0.1".to_string(), self.port)],
            crate::telemetry::meter::AppTelemetryMeter::new(),
        );
        bucket.bootstrap().await.expect("mock bucket bootstrap");
        bucket
    }

    pub fn set_config_json(&self, config: String) {
        *self.state.config_json.lock().unwrap() = config;
    }

    pub fn put_document(&self, key: &[u8], value: &[u8]) {
        let cas = self.state.cas_counter.fetch_add(1, Ordering::SeqCst);
        self.state.documents.lock().unwrap().insert(
            key.to_vec(),
            StoredDocument { value: value.to_vec(), flags: 0, cas },
        );
    }

    pub fn document(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.documents.lock().unwrap().get(key).map(|doc| doc.value.clone())
    }

    pub fn define_collection(&self, scope: &str, collection: &str, id: u32) {
        self.state
            .collections
            .lock()
            .unwrap()
            .insert(format!("{scope}.{collection}"), id);
    }

    pub fn request_count(&self, opcode: Opcode) -> u64 {
        self.state.request_counts.lock().unwrap().get(&opcode).copied().unwrap_or(0)
    }

    /// Queue a multi-packet reply for the next request of `opcode`.
    pub fn script_reply(&self, opcode: Opcode, packets: Vec<ScriptedReply>) {
        self.state.scripted.lock().unwrap().entry(opcode).or_default().push_back(packets);
    }

    /// Delay every response of `opcode`; used for timeout tests.
    pub fn delay_responses(&self, opcode: Opcode, delay: Duration) {
        self.state.response_delay.lock().unwrap().insert(opcode, delay);
    }

    /// Collection ids carried by document commands, in arrival order.
    pub fn seen_collection_ids(&self) -> Vec<u32> {
        self.state.seen_collection_ids.lock().unwrap().clone()
    }
}

struct ScramServer {
    mechanism: SaslMechanism,
    server_first: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
    auth_prefix: String,
}

fn start_scram_server(mechanism: SaslMechanism, client_first: &str) -> Option<ScramServer> {
    let bare = client_first.strip_prefix("n,,")?;
    let attributes = sasl::parse_attributes(bare);
    let client_nonce = attributes.get(&'r')?.clone();

    let mut salt = [0u8; 12];
    rand::rng().fill_bytes(&mut salt);
    let mut server_nonce_tail = [0u8; 12];
    rand::rng().fill_bytes(&mut server_nonce_tail);
    let server_nonce = format!("{client_nonce}{}", BASE64.encode(server_nonce_tail));
    let iterations = 4096;

    let salted = sasl::salted_password(mechanism, MOCK_PASSWORD, &salt, iterations);
    let client_key = sasl::hmac_digest(mechanism, &salted, b"Client Key");
    let stored_key = sasl::message_digest(mechanism, &client_key);
    let server_key = sasl::hmac_digest(mechanism, &salted, b"Server Key");

    let server_first =
        format!("r={server_nonce},s={},i={iterations}", BASE64.encode(salt));
    Some(ScramServer {
        mechanism,
        server_first: server_first.clone(),
        stored_key,
        server_key,
        auth_prefix: format!("{bare},{server_first}"),
    })
}

impl ScramServer {
    fn verify_client_final(&self, client_final: &str) -> Option<String> {
        let attributes = sasl::parse_attributes(client_final);
        let proof = BASE64.decode(attributes.get(&'p')?).ok()?;
        let without_proof = client_final.rsplit_once(",p=")?.0;
        let auth_message = format!("{},{}", self.auth_prefix, without_proof);

        let client_signature =
            sasl::hmac_digest(self.mechanism, &self.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> =
            proof.iter().zip(client_signature.iter()).map(|(p, s)| p ^ s).collect();
        if sasl::message_digest(self.mechanism, &client_key) != self.stored_key {
            return None;
        }
        let server_signature =
            sasl::hmac_digest(self.mechanism, &self.server_key, auth_message.as_bytes());
        Some(format!("v={}", BASE64.encode(server_signature)))
    }
}

async fn serve_connection(mut socket: TcpStream, state: Arc<NodeState>) -> Result<(), Error> {
    let mut codec = Codec::default();
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut scram: Option<ScramServer> = None;

    loop {
        let request = loop {
            match codec.decode_packet(&buffer) {
                Ok((packet, consumed)) => {
                    buffer.advance(consumed);
                    break packet;
                }
                Err(Error::NeedMoreData) | Err(Error::EndOfStream) => {
                    if socket.read_buf(&mut buffer).await? == 0 {
                        return Ok(());
                    }
                }
                Err(error) => return Err(error),
            }
        };

        trace!(opcode = ?request.opcode, opaque = request.opaque, "mock node received request");
        *state.request_counts.lock().unwrap().entry(request.opcode).or_insert(0) += 1;

        let delay = state.response_delay.lock().unwrap().get(&request.opcode).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = state
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.opcode)
            .and_then(VecDeque::pop_front);
        if let Some(replies) = scripted {
            for reply in replies {
                if let Some(delay) = reply.delay {
                    tokio::time::sleep(delay).await;
                }
                let mut response = Packet::response(request.opcode);
                response.opaque = request.opaque;
                response.status = reply.status as u16;
                response.extras = reply.extras;
                response.key = reply.key;
                response.value = reply.value;
                socket.write_all(&codec.encode_packet(&response)?).await?;
            }
            continue;
        }

        let mut response = Packet::response(request.opcode);
        response.opaque = request.opaque;

        match request.opcode {
            Opcode::Hello => {
                let mut accepted = Vec::new();
                for chunk in request.value.chunks_exact(2) {
                    let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                    if let Some(feature) = HelloFeature::from_u16(code) {
                        accepted.push(feature);
                        response.value.extend_from_slice(&code.to_be_bytes());
                    }
                }
                socket.write_all(&codec.encode_packet(&response)?).await?;
                // the connection speaks with the negotiated feature set from
                // here on, collections and alt-requests included
                codec = Codec::new(HashSet::from_iter(accepted));
                continue;
            }
            Opcode::GetErrorMap => {
                response.value =
                    br#"{"version":2,"revision":1,"errors":{"86":{"name":"ETMPFAIL","attrs":["temp","retry-later"]}}}"#
                        .to_vec();
            }
            Opcode::SaslListMechs => {
                response.value = b"SCRAM-SHA256 PLAIN".to_vec();
            }
            Opcode::SaslAuth => {
                let mechanism = String::from_utf8_lossy(&request.key).to_string();
                match mechanism.as_str() {
                    "PLAIN" => {
                        let expected = sasl::plain_payload(MOCK_USERNAME, MOCK_PASSWORD);
                        if request.value == expected {
                            response.value = b"Authenticated".to_vec();
                        } else {
                            response.status = Status::AuthError as u16;
                        }
                    }
                    "SCRAM-SHA256" => {
                        let client_first = String::from_utf8_lossy(&request.value).to_string();
                        match start_scram_server(SaslMechanism::ScramSha256, &client_first) {
                            Some(server) => {
                                response.status = Status::AuthContinue as u16;
                                response.value = server.server_first.clone().into_bytes();
                                scram = Some(server);
                            }
                            None => response.status = Status::AuthError as u16,
                        }
                    }
                    _ => response.status = Status::AuthError as u16,
                }
            }
            Opcode::SaslStep => {
                let client_final = String::from_utf8_lossy(&request.value).to_string();
                match scram.take().and_then(|server| server.verify_client_final(&client_final)) {
                    Some(server_final) => response.value = server_final.into_bytes(),
                    None => response.status = Status::AuthError as u16,
                }
            }
            Opcode::SelectBucket => {}
            Opcode::GetClusterConfig => {
                response.datatype = datatype::JSON;
                response.value = state.config_json.lock().unwrap().clone().into_bytes();
            }
            Opcode::GetCollectionId => {
                let name = String::from_utf8_lossy(&request.value).to_string();
                match state.collections.lock().unwrap().get(&name) {
                    Some(id) => {
                        response.extras.extend_from_slice(&1u64.to_be_bytes());
                        response.extras.extend_from_slice(&id.to_be_bytes());
                    }
                    None => response.status = Status::UnknownCollection as u16,
                }
            }
            Opcode::Get => {
                state.seen_collection_ids.lock().unwrap().push(request.collection_id);
                match state.documents.lock().unwrap().get(&request.key) {
                    Some(document) => {
                        response.extras = document.flags.to_be_bytes().to_vec();
                        response.value = document.value.clone();
                        response.cas = document.cas;
                    }
                    None => response.status = Status::NotFound as u16,
                }
            }
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                state.seen_collection_ids.lock().unwrap().push(request.collection_id);
                let value = if request.datatype & datatype::SNAPPY != 0 {
                    snap::raw::Decoder::new()
                        .decompress_vec(&request.value)
                        .unwrap_or_else(|_| request.value.clone())
                } else {
                    request.value.clone()
                };
                let mut documents = state.documents.lock().unwrap();
                let exists = documents.contains_key(&request.key);
                if request.opcode == Opcode::Add && exists {
                    response.status = Status::Exists as u16;
                } else if request.opcode == Opcode::Replace && !exists {
                    response.status = Status::NotFound as u16;
                } else {
                    let flags = if request.extras.len() >= 4 {
                        u32::from_be_bytes(request.extras[0..4].try_into().unwrap())
                    } else {
                        0
                    };
                    let cas = state.cas_counter.fetch_add(1, Ordering::SeqCst);
                    documents.insert(request.key.clone(), StoredDocument { value, flags, cas });
                    response.cas = cas;
                }
            }
            Opcode::Delete => {
                if state.documents.lock().unwrap().remove(&request.key).is_none() {
                    response.status = Status::NotFound as u16;
                }
            }
            Opcode::Noop => {}
            _ => {
                response.status = Status::UnknownCommand as u16;
            }
        }

        // the mock always answers with classic magic; alt responses only
        // matter for frame extras, which it never sends
        if request.magic == Magic::AltClientRequest || request.magic == Magic::ClientRequest {
            socket.write_all(&codec.encode_packet(&response)?).await?;
        }
    }
}
