use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BusError, Result};

/// ALPN protocol id negotiated on QUIC transports.
pub const QUIC_ALPN: &[u8] = b"edgehive";

/// Certificate material for TLS transports and the tunnel dialer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate. Test deployments only.
    pub insecure_skip_verify: bool,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| BusError::Config(format!("failed to open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BusError::Config(format!("failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(BusError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| BusError::Config(format!("failed to open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| BusError::Config(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| BusError::Config(format!("no private key in {}", path.display())))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn identity(settings: &TlsSettings) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_private_key(key)?))),
        (None, None) => Ok(None),
        _ => Err(BusError::Config(
            "cert_file and key_file must be set together".to_string(),
        )),
    }
}

/// Client configuration: the CA file (or the bundled web roots) as trust
/// anchors, plus a client certificate when one is configured.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    Ok(Arc::new(build_client_config(settings)?))
}

fn build_client_config(settings: &TlsSettings) -> Result<ClientConfig> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let builder = if settings.insecure_skip_verify {
        tracing::warn!("TLS server certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(root_store(settings.ca_file.as_deref())?)
    };
    let config = match identity(settings)? {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Server configuration. A configured CA file turns on client certificate
/// verification.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>> {
    Ok(Arc::new(build_server_config(settings)?))
}

fn build_server_config(settings: &TlsSettings) -> Result<ServerConfig> {
    let (certs, key) = identity(settings)?.ok_or_else(|| {
        BusError::Config("a TLS listener needs cert_file and key_file".to_string())
    })?;
    let provider = provider();
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let builder = match &settings.ca_file {
        Some(ca) => {
            let roots = Arc::new(root_store(Some(ca))?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| BusError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    Ok(builder.with_single_cert(certs, key)?)
}

/// QUIC client configuration over the same trust settings as
/// [`client_config`]. QUIC negotiates TLS 1.3 only.
pub fn quic_client_config(settings: &TlsSettings) -> Result<quinn::ClientConfig> {
    let mut crypto = build_client_config(settings)?;
    crypto.alpn_protocols = vec![QUIC_ALPN.to_vec()];
    let crypto = QuicClientConfig::try_from(crypto).map_err(|e| BusError::Tls(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

pub fn quic_server_config(settings: &TlsSettings) -> Result<quinn::ServerConfig> {
    let mut crypto = build_server_config(settings)?;
    crypto.alpn_protocols = vec![QUIC_ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(crypto).map_err(|e| BusError::Tls(e.to_string()))?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_use_web_roots() {
        let config = client_config(&TlsSettings::default()).expect("client config");
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn insecure_client_config_builds() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            ..Default::default()
        };
        client_config(&settings).expect("insecure client config");
    }

    #[test]
    fn half_configured_identity_is_rejected() {
        let settings = TlsSettings {
            cert_file: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            client_config(&settings),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let settings = TlsSettings {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(
            client_config(&settings),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").expect("write");
        assert!(matches!(load_certs(&path), Err(BusError::Config(_))));
        assert!(matches!(load_private_key(&path), Err(BusError::Config(_))));
    }

    #[test]
    fn quic_configs_share_trust_settings() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            ..Default::default()
        };
        quic_client_config(&settings).expect("quic client config");
        assert!(matches!(
            quic_server_config(&TlsSettings::default()),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn server_config_needs_identity() {
        assert!(matches!(
            server_config(&TlsSettings::default()),
            Err(BusError::Config(_))
        ));
    }
}
