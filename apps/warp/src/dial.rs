//! Dialing the relay over TCP or TLS.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use warp_proto::{ENV_WARPD_INSECURE_TLS, ENV_WARPD_NO_TLS};

/// A byte-stream connection to the relay, plain or TLS.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid server name in address {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Clone)]
pub struct DialOptions {
    pub address: String,
    pub no_tls: bool,
    pub insecure_tls: bool,
}

impl DialOptions {
    /// Combine CLI flags with their environment overrides; a non-empty env
    /// variable counts as set.
    pub fn resolve(address: &str, no_tls: bool, insecure_tls: bool) -> DialOptions {
        let env_set = |name: &str| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
        DialOptions {
            address: address.to_string(),
            no_tls: no_tls || env_set(ENV_WARPD_NO_TLS),
            insecure_tls: insecure_tls || env_set(ENV_WARPD_INSECURE_TLS),
        }
    }
}

/// Dial the relay, wrapping the TCP stream in TLS unless disabled.
pub async fn dial(options: &DialOptions) -> Result<Box<dyn Conn>, DialError> {
    let tcp = TcpStream::connect(&options.address).await?;
    let _ = tcp.set_nodelay(true);
    if options.no_tls {
        return Ok(Box::new(tcp));
    }

    let host = options
        .address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&options.address);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| DialError::InvalidName(options.address.clone()))?;
    let connector = TlsConnector::from(Arc::new(client_config(options.insecure_tls)));
    let tls = connector.connect(server_name, tcp).await?;
    Ok(Box::new(tls))
}

fn client_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Accepts any certificate. Only installed behind `insecure_tls`.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
