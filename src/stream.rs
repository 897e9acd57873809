//! Unified plain-TCP / TLS stream with timeout-bounded connect

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::options::ClusterOptions;

/// TLS material shared by every connection of a cluster.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TlsContext")
    }
}

impl TlsContext {
    /// Assemble the client TLS configuration. SSLv2/3 and TLS 1.0/1.1 are
    /// never offered (the backend does not implement them); TLS 1.2 can be
    /// disabled on request. Trust comes from, in order of precedence:
    /// explicit PEM material, else the system store plus the bundled Mozilla
    /// list (unless disabled).
    pub fn from_options(options: &ClusterOptions) -> Result<TlsContext> {
        let versions: &[&rustls::SupportedProtocolVersion] = if options.tls_disable_v1_2 {
            &[&rustls::version::TLS13]
        } else {
            &[&rustls::version::TLS12, &rustls::version::TLS13]
        };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(|err| Error::InvalidArgument(format!("TLS versions: {err}")))?;

        let config = if options.insecure_skip_verify {
            warn!("TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            if let Some(pem) = &options.trust_certificate_value {
                for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
                    let cert = cert.map_err(|err| {
                        Error::InvalidArgument(format!("trust certificate: {err:?}"))
                    })?;
                    roots.add(cert).map_err(|err| {
                        Error::InvalidArgument(format!("trust certificate: {err}"))
                    })?;
                }
            } else {
                let native = rustls_native_certs::load_native_certs();
                for error in &native.errors {
                    debug!("unable to load a system CA certificate: {error}");
                }
                for cert in native.certs {
                    let _ = roots.add(cert);
                }
                if !options.disable_default_ca_certificates {
                    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(TlsContext { config: Arc::new(config) })
    }

    fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// One connected byte stream, plain or encrypted.
#[derive(Debug)]
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Resolve `hostname`, then connect to the candidate endpoints in order,
    /// wrapping in TLS when a context is provided. The resolve and connect
    /// phases each get their own budget.
    pub async fn connect(
        hostname: &str,
        port: u16,
        resolve_timeout: Duration,
        connect_timeout: Duration,
        tls: Option<&TlsContext>,
    ) -> Result<Stream> {
        let lookup = tokio::time::timeout(
            resolve_timeout,
            tokio::net::lookup_host((hostname, port)),
        )
        .await
        .map_err(|_| Error::UnambiguousTimeout)?
        .map_err(|err| Error::ConnectionError(format!("resolve {hostname}: {err}")))?;

        let mut last_error = Error::NoEndpointsLeft;
        for endpoint in lookup {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(tcp)) => {
                    let _ = tcp.set_nodelay(true);
                    match tls {
                        None => return Ok(Stream::Plain(tcp)),
                        Some(context) => {
                            let server_name = ServerName::try_from(hostname.to_string())
                                .map_err(|err| {
                                    Error::InvalidArgument(format!("server name: {err}"))
                                })?;
                            match tokio::time::timeout(
                                connect_timeout,
                                context.connector().connect(server_name, tcp),
                            )
                            .await
                            {
                                Ok(Ok(stream)) => return Ok(Stream::Tls(Box::new(stream))),
                                Ok(Err(err)) => {
                                    last_error = Error::ConnectionError(format!(
                                        "TLS handshake with {endpoint}: {err}"
                                    ));
                                }
                                Err(_) => last_error = Error::UnambiguousTimeout,
                            }
                        }
                    }
                }
                Ok(Err(err)) => {
                    last_error = Error::ConnectionError(format!("connect {endpoint}: {err}"));
                }
                Err(_) => last_error = Error::UnambiguousTimeout,
            }
        }
        Err(last_error)
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(inner) => Pin::new(inner).poll_read(cx, buf),
            Stream::Tls(inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(inner) => Pin::new(inner).poll_write(cx, buf),
            Stream::Tls(inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(inner) => Pin::new(inner).poll_flush(cx),
            Stream::Tls(inner) => Pin::new(inner.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(inner) => Pin::new(inner).poll_shutdown(cx),
            Stream::Tls(inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
        }
    }
}
