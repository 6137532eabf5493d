//! Upstream connection construction: a narrow swappable seam between the
//! proxy and the transport layer used to dial each upstream target.
//!
//! Only the two modes this proxy actually needs are supported: plaintext
//! (the default) and TLS with an optional skip-verify escape hatch.
//! Unix-socket dialing, mTLS client certificates, and `SSLKEYLOGFILE`
//! support are out of scope here.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::{ProxyError, Result};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// How a `ReflectClient` dials its upstream target.
#[derive(Debug, Clone)]
pub struct DialOptions {
    tls: TlsMode,
    connect_timeout: Duration,
}

#[derive(Debug, Clone)]
enum TlsMode {
    /// Plain-text HTTP/2, no TLS. The proxy's default.
    Plaintext,
    /// TLS with standard certificate verification against native roots.
    Tls,
    /// TLS that skips server certificate verification entirely.
    TlsSkipVerify,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions::plaintext()
    }
}

impl DialOptions {
    /// Plain-text dialing; the proxy's default per SPEC_FULL.md §4.7.
    pub fn plaintext() -> Self {
        DialOptions {
            tls: TlsMode::Plaintext,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// TLS with standard certificate verification against the system's
    /// native root store.
    pub fn tls() -> Self {
        DialOptions {
            tls: TlsMode::Tls,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// TLS that skips server certificate verification. Only meant for
    /// talking to upstreams with self-signed certificates in development.
    pub fn tls_skip_verify() -> Self {
        DialOptions {
            tls: TlsMode::TlsSkipVerify,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Dials `target` (a `host:port` upstream) and returns the resulting
    /// channel, or a `Dial` error if the connection cannot be established.
    pub async fn dial(&self, target: &str) -> Result<Channel> {
        let scheme = match self.tls {
            TlsMode::Plaintext => "http",
            TlsMode::Tls | TlsMode::TlsSkipVerify => "https",
        };
        let uri = format!("{scheme}://{target}");

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| ProxyError::Dial(format!("{target}: invalid address: {e}")))?
            .connect_timeout(self.connect_timeout);

        endpoint = match self.tls {
            TlsMode::Plaintext => endpoint,
            TlsMode::Tls => {
                let tls = ClientTlsConfig::new().with_native_roots();
                endpoint
                    .tls_config(tls)
                    .map_err(|e| ProxyError::Dial(format!("{target}: TLS configuration: {e}")))?
            }
            TlsMode::TlsSkipVerify => {
                return self.dial_skip_verify(target).await;
            }
        };

        endpoint
            .connect()
            .await
            .map_err(|e| ProxyError::Dial(format!("{target}: {e}")))
    }

    async fn dial_skip_verify(&self, target: &str) -> Result<Channel> {
        use tower::service_fn;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let rustls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Dial(format!("{target}: TLS configuration: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(rustls_config));

        let host = target.split(':').next().unwrap_or(target).to_string();
        let addr = target.to_string();
        let endpoint = Endpoint::from_shared(format!("https://{target}"))
            .map_err(|e| ProxyError::Dial(format!("{target}: invalid address: {e}")))?
            .connect_timeout(self.connect_timeout);

        endpoint
            .connect_with_connector(service_fn(move |_: http::Uri| {
                let connector = connector.clone();
                let host = host.clone();
                let addr = addr.clone();
                async move {
                    let tcp = tokio::net::TcpStream::connect(&addr).await?;
                    let server_name = rustls::pki_types::ServerName::try_from(host.as_str())
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
                        .to_owned();
                    let tls_stream = connector.connect(server_name, tcp).await?;
                    Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(tls_stream))
                }
            }))
            .await
            .map_err(|e| ProxyError::Dial(format!("{target}: {e}")))
    }
}

/// Accepts any server certificate without validation. Only reachable via
/// `DialOptions::tls_skip_verify`.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_is_default() {
        let opts = DialOptions::default();
        assert!(matches!(opts.tls, TlsMode::Plaintext));
    }

    #[tokio::test]
    async fn dial_rejects_invalid_address() {
        let opts = DialOptions::plaintext();
        let result = opts.dial("not a valid uri///").await;
        assert!(result.is_err());
    }
}
