//! One HTTP/1.1 connection to a service endpoint
//!
//! Sessions are checked out of the pool for exclusive use, so a session
//! carries at most one request at a time. Idle lifetime is cooperative: the
//! pool arms an idle timer at check-in and must successfully reset it at
//! checkout before reusing the connection.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::http::message::{HttpRequest, HttpResponse};
use crate::http::parser::ResponseParser;
use crate::http::streaming::{JsonRowStreamer, RowCallback};
use crate::options::Credentials;
use crate::stream::{Stream, TlsContext};
use crate::topology::ServiceType;

pub struct HttpSession {
    id: String,
    service: ServiceType,
    client_id: String,
    hostname: String,
    port: u16,
    credentials: Credentials,
    tls: Option<TlsContext>,

    stream: Mutex<Option<Stream>>,
    connected: AtomicBool,
    stopped: AtomicBool,
    keep_alive: AtomicBool,
    idle_timer: StdMutex<Option<AbortHandle>>,
    on_stop: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

impl HttpSession {
    pub fn new(
        service: ServiceType,
        client_id: impl Into<String>,
        credentials: Credentials,
        hostname: impl Into<String>,
        port: u16,
        tls: Option<TlsContext>,
    ) -> Arc<HttpSession> {
        Arc::new(HttpSession {
            id: format!("{:08x}", rand::random::<u32>()),
            service,
            client_id: client_id.into(),
            hostname: hostname.into(),
            port,
            credentials,
            tls,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            keep_alive: AtomicBool::new(true),
            idle_timer: StdMutex::new(None),
            on_stop: StdMutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log_prefix(&self) -> String {
        format!("[{}/{}/{}]", self.client_id, self.id, self.service.as_str())
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    pub fn on_stop(&self, handler: Box<dyn FnOnce() + Send>) {
        *self.on_stop.lock().unwrap() = Some(handler);
    }

    pub async fn connect(&self, resolve_timeout: Duration, connect_timeout: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::RequestCanceled);
        }
        let stream = Stream::connect(
            &self.hostname,
            self.port,
            resolve_timeout,
            connect_timeout,
            self.tls.as_ref(),
        )
        .await?;
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        trace!("{} connected", self.log_prefix());
        Ok(())
    }

    /// Send a request and buffer the whole response.
    pub async fn send(self: &Arc<Self>, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_with_parser(request, ResponseParser::buffered()).await
    }

    /// Send a request, invoking `rows` for each element of the array at
    /// `pointer`; the returned response carries the remaining metadata.
    pub async fn send_streaming(
        self: &Arc<Self>,
        request: &HttpRequest,
        pointer: &str,
        rows: RowCallback,
    ) -> Result<HttpResponse> {
        let parser = ResponseParser::streaming(JsonRowStreamer::new(pointer, rows));
        self.send_with_parser(request, parser).await
    }

    async fn send_with_parser(
        self: &Arc<Self>,
        request: &HttpRequest,
        mut parser: ResponseParser,
    ) -> Result<HttpResponse> {
        if self.is_stopped() {
            return Err(Error::RequestCanceled);
        }
        let authorization = BASE64.encode(format!(
            "{}:{}",
            self.credentials.username, self.credentials.password
        ));
        let bytes = request.to_bytes(&self.hostname, self.port, &authorization);

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(Error::EndOfStream)?;
        if let Err(error) = stream.write_all(&bytes).await {
            drop(guard);
            self.stop();
            return Err(error.into());
        }
        debug!("{} {} {}", self.log_prefix(), request.method, request.path);

        let mut buffer = [0u8; 16 * 1024];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) => {
                    if parser.finish_on_eof() {
                        break;
                    }
                    drop(guard);
                    self.stop();
                    return Err(Error::EndOfStream);
                }
                Ok(read) => match parser.feed(&buffer[..read]) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(error) => {
                        drop(guard);
                        self.stop();
                        return Err(error);
                    }
                },
                Err(error) => {
                    drop(guard);
                    self.stop();
                    return Err(error.into());
                }
            }
        }
        drop(guard);

        let response = parser.take_response();
        trace!("{} response status: {}", self.log_prefix(), response.status_code);
        self.keep_alive.store(response.keep_alive(), Ordering::SeqCst);
        if !response.keep_alive() {
            self.stop();
        }
        Ok(response)
    }

    /// Arm the idle timer; when it fires the session stops itself.
    pub fn set_idle(self: &Arc<Self>, timeout: Duration) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!("{} idle timer has expired", session.log_prefix());
            session.stop();
        });
        let mut timer = self.idle_timer.lock().unwrap();
        if let Some(previous) = timer.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Disarm the idle timer. Returns false when the session already stopped
    /// (the timer fired first) and must not be reused.
    pub fn reset_idle(&self) -> bool {
        if let Some(handle) = self.idle_timer.lock().unwrap().take() {
            handle.abort();
        }
        !self.is_stopped() && self.is_connected()
    }

    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.idle_timer.lock().unwrap().take() {
            handle.abort();
        }
        let session = self.clone();
        tokio::spawn(async move {
            session.stream.lock().await.take();
        });
        if let Some(handler) = self.on_stop.lock().unwrap().take() {
            handler();
        }
    }
}
