//! Cluster facade: lifecycle, bootstrap, and top-level dispatch

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::bucket::Bucket;
use crate::crud::{GetResult, KeyOptions, MutationResult, StoreOptions};
use crate::error::{Error, Result};
use crate::http::message::HttpResponse;
use crate::http::pool::{HttpSessionManager, PingReport, ServiceRequest};
use crate::http::streaming::RowCallback;
use crate::options::{ClusterOptions, ConnectionString, Credentials};
use crate::retry::RetryReason;
use crate::session::{ConfigListener, Session};
use crate::stream::TlsContext;
use crate::telemetry::meter::AppTelemetryMeter;
use crate::telemetry::reporter::AppTelemetryReporter;
use crate::topology::{Config, ServiceType};

/// A key/value operation expressed as data, for transport-level dispatch.
#[derive(Debug)]
pub enum KvRequest {
    Get { bucket: String, key: Vec<u8>, options: KeyOptions },
    Upsert { bucket: String, key: Vec<u8>, value: Vec<u8>, options: StoreOptions },
    Remove { bucket: String, key: Vec<u8>, cas: u64, options: KeyOptions },
}

/// Top-level request, tagged by transport.
#[derive(Debug)]
pub enum CoreRequest {
    Http(ServiceRequest),
    Kv(KvRequest),
}

#[derive(Debug)]
pub enum CoreResponse {
    Http(HttpResponse),
    Get(GetResult),
    Mutation(MutationResult),
    Removed(MutationResult),
}

struct ClusterInner {
    id: String,
    options: Mutex<ClusterOptions>,
    credentials: Credentials,
    seeds: Mutex<Vec<(String, u16)>>,
    tls: Option<TlsContext>,
    session: Mutex<Option<Session>>,
    buckets: Mutex<HashMap<String, Bucket>>,
    http: HttpSessionManager,
    meter: Arc<AppTelemetryMeter>,
    reporter: AppTelemetryReporter,
    closed: AtomicBool,
}

/// Entry point to the client core. Cheap to clone; the last clone dropping
/// does not close connections, call [`Cluster::close`] explicitly.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Bootstrap against `connection_string` (`cellar://` or `cellars://`).
    pub async fn connect(
        connection_string: &str,
        mut options: ClusterOptions,
        credentials: Credentials,
    ) -> Result<Cluster> {
        let parsed = ConnectionString::parse(connection_string)?;
        if parsed.use_tls {
            options.enable_tls = true;
        }
        let tls = if options.enable_tls {
            Some(TlsContext::from_options(&options)?)
        } else {
            None
        };

        let id = format!("{:08x}", rand::random::<u32>());
        let meter = AppTelemetryMeter::new();
        let http = HttpSessionManager::new(id.clone(), tls.clone());
        let reporter = AppTelemetryReporter::new(
            meter.clone(),
            options.clone(),
            credentials.clone(),
            tls.clone(),
        );

        let inner = Arc::new(ClusterInner {
            id: id.clone(),
            options: Mutex::new(options.clone()),
            credentials: credentials.clone(),
            seeds: Mutex::new(parsed.nodes.clone()),
            tls,
            session: Mutex::new(None),
            buckets: Mutex::new(HashMap::new()),
            http,
            meter,
            reporter,
            closed: AtomicBool::new(false),
        });
        let cluster = Cluster { inner };
        cluster.open(parsed.nodes).await?;
        Ok(cluster)
    }

    async fn open(&self, seeds: Vec<(String, u16)>) -> Result<()> {
        let mut last_error = Error::NoEndpointsLeft;
        for (hostname, port) in seeds {
            let session = Session::new(
                self.inner.id.clone(),
                hostname.clone(),
                port,
                self.inner.options.lock().unwrap().clone(),
                self.inner.credentials.clone(),
                self.inner.tls.clone(),
                None,
            );
            match session.bootstrap().await {
                Ok(config) => {
                    self.finish_open(session, config);
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        cluster_id = %self.inner.id,
                        hostname = %hostname,
                        port,
                        %error,
                        "failed to bootstrap cluster session"
                    );
                    self.inner.http.notify_bootstrap_error(error.clone());
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    fn finish_open(&self, session: Session, config: Config) {
        // network selection runs before anything consumes the topology
        {
            let mut options = self.inner.options.lock().unwrap();
            if options.network == "auto" {
                options.network = config.select_network(session.bootstrap_hostname());
                if options.network == "default" {
                    debug!(cluster_id = %self.inner.id, network = %options.network, "detected network");
                } else {
                    info!(cluster_id = %self.inner.id, network = %options.network, "detected network");
                }
            }
            if options.network != "default" {
                let tls = self.inner.tls.is_some();
                let seeds: Vec<(String, u16)> = config
                    .nodes
                    .iter()
                    .filter_map(|node| {
                        let port =
                            node.port_or(&options.network, ServiceType::KeyValue, tls, 0);
                        if port == 0 {
                            return None;
                        }
                        Some((node.hostname_for(&options.network).to_string(), port))
                    })
                    .collect();
                if !seeds.is_empty() {
                    info!(
                        cluster_id = %self.inner.id,
                        network = %options.network,
                        "replacing bootstrap nodes with alternative network addresses"
                    );
                    *self.inner.seeds.lock().unwrap() = seeds;
                }
            }
        }

        let options = self.inner.options.lock().unwrap().clone();
        self.inner.http.set_configuration(
            config.clone(),
            options,
            self.inner.credentials.clone(),
        );
        session.on_configuration_update(Arc::new(self.inner.http.clone()));
        session.on_configuration_update(Arc::new(self.inner.reporter.clone()));
        self.inner.reporter.update_config(config);

        let inner = self.inner.clone();
        session.on_stop(Box::new(move |_reason| {
            inner.session.lock().unwrap().take();
        }));
        *self.inner.session.lock().unwrap() = Some(session);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn telemetry_meter(&self) -> Arc<AppTelemetryMeter> {
        self.inner.meter.clone()
    }

    /// Open (or fetch the already-open) bucket router for `name`.
    pub async fn bucket(&self, name: &str) -> Result<Bucket> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        if let Some(bucket) = self.inner.buckets.lock().unwrap().get(name) {
            return Ok(bucket.clone());
        }

        let bucket = Bucket::new(
            self.inner.id.clone(),
            name,
            self.inner.options.lock().unwrap().clone(),
            self.inner.credentials.clone(),
            self.inner.tls.clone(),
            self.inner.seeds.lock().unwrap().clone(),
            self.inner.meter.clone(),
        );
        // topology updates seen by the bucket flow on to the shared consumers
        bucket.on_configuration_update(Arc::new(self.inner.http.clone()));
        bucket.on_configuration_update(Arc::new(self.inner.reporter.clone()));

        self.inner.buckets.lock().unwrap().insert(name.to_string(), bucket.clone());
        match bucket.bootstrap().await {
            Ok(_) => Ok(bucket),
            Err(error) => {
                self.inner.buckets.lock().unwrap().remove(name);
                bucket.close();
                Err(error)
            }
        }
    }

    /// Dispatch a request by its transport: binary ones route through the
    /// owning bucket router, HTTP ones through the service pool.
    pub async fn execute(&self, request: CoreRequest) -> Result<CoreResponse> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        match request {
            CoreRequest::Http(request) => {
                self.inner.http.execute(request).await.map(CoreResponse::Http)
            }
            CoreRequest::Kv(kv) => match kv {
                KvRequest::Get { bucket, key, options } => {
                    let bucket = self.bucket(&bucket).await?;
                    bucket.get(key, options).await.map(CoreResponse::Get)
                }
                KvRequest::Upsert { bucket, key, value, options } => {
                    let bucket = self.bucket(&bucket).await?;
                    bucket.upsert(key, value, options).await.map(CoreResponse::Mutation)
                }
                KvRequest::Remove { bucket, key, cas, options } => {
                    let bucket = self.bucket(&bucket).await?;
                    bucket.remove(key, cas, options).await.map(CoreResponse::Removed)
                }
            },
        }
    }

    /// Execute an HTTP service request.
    pub async fn execute_http(&self, request: ServiceRequest) -> Result<HttpResponse> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        self.inner.http.execute(request).await
    }

    /// Execute an HTTP service request, streaming rows at `pointer`.
    pub async fn execute_http_streaming(
        &self,
        request: ServiceRequest,
        pointer: &str,
        rows: RowCallback,
    ) -> Result<HttpResponse> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        self.inner.http.execute_streaming(request, pointer, rows).await
    }

    /// Reachability probe over the HTTP services.
    pub async fn ping(&self, services: &[ServiceType]) -> Result<Vec<PingReport>> {
        if self.is_closed() {
            return Err(Error::ClusterClosed);
        }
        Ok(self.inner.http.ping(services).await)
    }

    /// Tear everything down. Errors during close are swallowed.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let buckets: Vec<Bucket> = {
            let mut guard = self.inner.buckets.lock().unwrap();
            guard.drain().map(|(_, bucket)| bucket).collect()
        };
        for bucket in buckets {
            bucket.close();
        }
        if let Some(session) = self.inner.session.lock().unwrap().take() {
            session.stop(RetryReason::DoNotRetry);
        }
        self.inner.reporter.stop();
        self.inner.http.close();
        self.inner.meter.disable();
    }
}
