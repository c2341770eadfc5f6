//! TLS configuration and client-side wrapping
//!
//! Provides TLS-encrypted connections using rustls (pure Rust, easy static linking):
//! the tunnel client's connector, the upstream connector used after MITM
//! termination, the tunnel server's acceptor identity, and [`wrap_client`]
//! which moves an existing [`SharedStream`] under a TLS session.

use crate::config::{ServerConfig as TunnelServerConfig, TlsConfig};
use crate::stream::SharedStream;
use anyhow::{anyhow, Context, Result};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Subject of the generated tunnel server certificate
const SELF_SIGNED_NAME: &str = "sotproxy";

fn native_roots() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for cert in native_certs.certs {
        root_store.add(cert).ok();
    }
    root_store
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file: {}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from: {}", path))
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open key file: {}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key from: {}", path))?
        .ok_or_else(|| anyhow!("No private key found in: {}", path))
}

fn insecure_client() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

/// Connector for the tunnel client
pub fn tunnel_connector(config: &TlsConfig) -> Result<TlsConnector> {
    if config.skip_verify {
        return Ok(TlsConnector::from(Arc::new(insecure_client())));
    }

    let mut root_store = native_roots();
    if let Some(ref root_path) = config.trusted_root {
        for cert in read_certs(root_path)? {
            root_store
                .add(cert)
                .with_context(|| "Failed to add certificate to store")?;
        }
    }

    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Connector used to re-encrypt toward origin servers
pub fn upstream_connector(verify: bool) -> TlsConnector {
    let tls_config = if verify {
        ClientConfig::builder()
            .with_root_certificates(native_roots())
            .with_no_client_auth()
    } else {
        insecure_client()
    };
    TlsConnector::from(Arc::new(tls_config))
}

/// Acceptor for the tunnel server
///
/// Uses the configured PEM pair, or a freshly generated self-signed
/// certificate when none is configured.
pub fn tunnel_acceptor(config: &TunnelServerConfig) -> Result<TlsAcceptor> {
    let (certs, key) = match (&config.certificate, &config.cert_key) {
        (Some(cert), Some(key)) => (read_certs(cert)?, read_key(key)?),
        _ => {
            debug!("No server certificate configured, generating a self-signed one");
            self_signed()?
        }
    };
    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| "Invalid server certificate or key")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key = rcgen::KeyPair::generate().with_context(|| "Failed to generate key pair")?;
    let params = rcgen::CertificateParams::new(vec![SELF_SIGNED_NAME.to_string()])
        .with_context(|| "Invalid certificate parameters")?;
    let cert = params
        .self_signed(&key)
        .with_context(|| "Failed to self-sign certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

/// SNI value for `host` (DNS name or IP literal)
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(bare.to_string()).with_context(|| format!("Invalid hostname: {}", host))
}

/// Run a client handshake over an already wrapped stream
///
/// The old handle is destroyed so it never closes the transport the TLS
/// session now owns; the returned handle holds one reference.
pub async fn wrap_client(
    connector: &TlsConnector,
    stream: SharedStream,
    host: &str,
) -> Result<SharedStream> {
    let name = server_name(host)?;
    let raw = stream
        .destroy()
        .ok_or_else(|| anyhow!("Stream {} already released", stream.id()))?;
    let tls = connector
        .connect(name, raw)
        .await
        .with_context(|| format!("TLS handshake failed with {}", host))?;
    debug!("TLS session established to {}", host);
    Ok(SharedStream::wrap(tls))
}

/// Certificate verifier that accepts all certificates (dangerous!)
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_tunnel_connector_skip_verify() {
        let config = TlsConfig {
            hostname: Some("example.com".to_string()),
            trusted_root: None,
            skip_verify: true,
        };
        assert!(tunnel_connector(&config).is_ok());
    }

    #[test]
    fn test_tunnel_connector_missing_root() {
        let config = TlsConfig {
            hostname: None,
            trusted_root: Some("/nonexistent/root.pem".to_string()),
            skip_verify: false,
        };
        assert!(tunnel_connector(&config).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("bad name").is_err());
    }

    #[test]
    fn test_tunnel_acceptor_self_signed() {
        assert!(tunnel_acceptor(&TunnelServerConfig::default()).is_ok());
    }

    #[test]
    fn test_tunnel_acceptor_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["relay.test".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        let config = TunnelServerConfig {
            certificate: Some(cert_path.to_string_lossy().into_owned()),
            cert_key: Some(key_path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert!(tunnel_acceptor(&config).is_ok());
    }

    #[tokio::test]
    async fn test_wrap_client_handshake() {
        let acceptor = tunnel_acceptor(&TunnelServerConfig::default()).unwrap();
        let (client, server) = duplex(16 * 1024);

        let server_task = tokio::spawn(async move {
            let mut tls = acceptor.accept(server).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
            // Stay up until the client's close_notify arrives.
            let mut rest = Vec::new();
            tls.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let plain = SharedStream::wrap(client);
        let old = plain.open();
        let mut tls = wrap_client(&upstream_connector(false), plain, "sotproxy")
            .await
            .unwrap();
        // The old handle no longer owns the transport.
        assert_eq!(old.ref_count(), 0);
        old.close().await.unwrap();

        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        tls.close().await.unwrap();
        assert!(server_task.await.unwrap().is_empty());
    }
}
