//! Connection options and credentials

use std::sync::Arc;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};
use crate::retry::{BestEffortRetryStrategy, RetryStrategy};
use crate::sasl::SaslMechanism;
use crate::topology::ServiceType;

/// Flat bag of tuning knobs applied at open time. Every field has a
/// documented default; construct with [`ClusterOptions::builder`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterOptions {
    /// Use TLS for every connection (binary, HTTP, telemetry). Default: false.
    #[builder(default = false)]
    pub enable_tls: bool,

    /// Network to select from the topology: `"auto"`, `"default"`, or a
    /// named alternate network. Default: `"auto"`.
    #[builder(default = String::from("auto"))]
    pub network: String,

    /// DNS resolution budget per connect attempt. Default: 2s.
    #[builder(default = Duration::from_secs(2))]
    pub resolve_timeout: Duration,

    /// TCP/TLS connect budget per endpoint. Default: 10s.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,

    /// Default deadline for key/value operations. Default: 2500ms.
    #[builder(default = Duration::from_millis(2500))]
    pub key_value_timeout: Duration,

    /// Default deadline for range-scan continuation batches. Default: 75s.
    #[builder(default = Duration::from_secs(75))]
    pub key_value_scan_timeout: Duration,

    /// Default deadline for HTTP service requests. Default: 75s.
    #[builder(default = Duration::from_secs(75))]
    pub http_timeout: Duration,

    /// Idle lifetime of a checked-in HTTP connection. Default: 4500ms.
    #[builder(default = Duration::from_millis(4500))]
    pub idle_http_connection_timeout: Duration,

    /// Interval between keepalive probes on binary sessions. Default: 30s.
    #[builder(default = Duration::from_secs(30))]
    pub keepalive_interval: Duration,

    /// Cap on queued requests per queue; 0 means unbounded. Default: 2048.
    #[builder(default = 2048)]
    pub max_queue_size: usize,

    /// Participate in application telemetry when the cluster exposes it.
    /// Default: true.
    #[builder(default = true)]
    pub enable_app_telemetry: bool,

    /// Explicit telemetry collector endpoint (`ws://host[:port][/path]`).
    /// When set, topology-advertised endpoints are ignored. Default: none.
    #[builder(default)]
    pub app_telemetry_endpoint: Option<String>,

    /// Telemetry WebSocket ping cadence. Default: 30s.
    #[builder(default = Duration::from_secs(30))]
    pub app_telemetry_ping_interval: Duration,

    /// How long to wait for a pong before failing the session. Default: 2s.
    #[builder(default = Duration::from_secs(2))]
    pub app_telemetry_ping_timeout: Duration,

    /// Ceiling of the telemetry reconnect backoff. Default: 1h.
    #[builder(default = Duration::from_secs(3600))]
    pub app_telemetry_backoff_interval: Duration,

    /// Refuse TLS 1.0/1.1 (always true with the rustls backend; kept for
    /// wire-level option compatibility). Default: true.
    #[builder(default = true)]
    pub tls_disable_deprecated_protocols: bool,

    /// Require TLS 1.3. Default: false.
    #[builder(default = false)]
    pub tls_disable_v1_2: bool,

    /// PEM bundle to trust instead of the default stores. Default: none.
    #[builder(default)]
    pub trust_certificate_value: Option<String>,

    /// Skip loading the bundled Mozilla CA list. Default: false.
    #[builder(default = false)]
    pub disable_default_ca_certificates: bool,

    /// Accept any server certificate. Development only. Default: false.
    #[builder(default = false)]
    pub insecure_skip_verify: bool,

    /// Strategy consulted for retry decisions when a request does not carry
    /// its own. Default: best-effort exponential backoff.
    #[builder(default = Arc::new(BestEffortRetryStrategy::default()))]
    pub default_retry_strategy: Arc<dyn RetryStrategy>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions::builder().build()
    }
}

impl ClusterOptions {
    pub fn default_timeout_for(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::KeyValue => self.key_value_timeout,
            _ => self.http_timeout,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Restrict SASL negotiation to these mechanisms when present.
    pub allowed_sasl_mechanisms: Option<Vec<SaslMechanism>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Credentials {
        Credentials {
            username: username.into(),
            password: password.into(),
            allowed_sasl_mechanisms: None,
        }
    }
}

/// Parsed `cellar://` / `cellars://` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub use_tls: bool,
    pub nodes: Vec<(String, u16)>,
}

pub const DEFAULT_PLAIN_PORT: u16 = 11210;
pub const DEFAULT_TLS_PORT: u16 = 11207;

impl ConnectionString {
    pub fn parse(input: &str) -> Result<ConnectionString> {
        let (use_tls, rest) = if let Some(rest) = input.strip_prefix("cellars://") {
            (true, rest)
        } else if let Some(rest) = input.strip_prefix("cellar://") {
            (false, rest)
        } else {
            (false, input)
        };
        let rest = rest.split('?').next().unwrap_or(rest);
        let default_port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };

        let mut nodes = Vec::new();
        for entry in rest.split(',') {
            let entry = entry.trim().trim_end_matches('/');
            if entry.is_empty() {
                continue;
            }
            match entry.rsplit_once(':') {
                Some((host, port)) if !port.is_empty() => {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::InvalidArgument(format!("invalid port in \"{entry}\""))
                    })?;
                    nodes.push((host.to_string(), port));
                }
                _ => nodes.push((entry.to_string(), default_port)),
            }
        }
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("connection string has no nodes".into()));
        }
        Ok(ConnectionString { use_tls, nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_ports() {
        let parsed = ConnectionString::parse("cellar://10.0.0.1,10.0.0.2:11310").unwrap();
        assert!(!parsed.use_tls);
        assert_eq!(
            parsed.nodes,
            vec![("10.0.0.1".into(), DEFAULT_PLAIN_PORT), ("10.0.0.2".into(), 11310)]
        );

        let parsed = ConnectionString::parse("cellars://db.example.com").unwrap();
        assert!(parsed.use_tls);
        assert_eq!(parsed.nodes, vec![("db.example.com".into(), DEFAULT_TLS_PORT)]);
    }

    #[test]
    fn bare_hostname_is_accepted() {
        let parsed = ConnectionString::parse("localhost").unwrap();
        assert_eq!(parsed.nodes, vec![("localhost".into(), DEFAULT_PLAIN_PORT)]);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(ConnectionString::parse("cellar://").is_err());
        assert!(ConnectionString::parse("cellar://host:abc").is_err());
    }

    #[test]
    fn options_have_sane_defaults() {
        let options = ClusterOptions::default();
        assert_eq!(options.network, "auto");
        assert_eq!(options.key_value_timeout, Duration::from_millis(2500));
        assert!(options.enable_app_telemetry);
        assert_eq!(
            options.default_timeout_for(ServiceType::Query),
            options.http_timeout
        );
    }
}
