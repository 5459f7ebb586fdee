//! TLS material for both sides of the proxy.
//!
//! The TLS listener presents a self-signed certificate generated at start for
//! the configured host names, so a client under test can trust it explicitly.
//! Origin connections accept any certificate: the proxy relays test traffic
//! and is not the party deciding whether an origin is trustworthy.

use crate::error::TlsError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Listener certificate plus the server config built from it.
pub struct TlsIdentity {
    certificate_pem: String,
    certificate_der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl TlsIdentity {
    /// Generate a fresh self-signed certificate valid for `hosts`.
    ///
    /// Entries that parse as IP addresses become IP subject alternative names,
    /// everything else a DNS name.
    pub fn self_signed(hosts: &[String]) -> Result<Self, TlsError> {
        if hosts.is_empty() {
            return Err(TlsError::CertGeneration(
                "at least one host name is required".to_string(),
            ));
        }

        let mut params = CertificateParams::new(hosts.to_vec())
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hosts[0].as_str());
        dn.push(DnType::OrganizationName, "Capture Proxy");
        params.distinguished_name = dn;

        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(30);

        let key_pair = KeyPair::generate().map_err(|e| TlsError::CertGeneration(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertGeneration(e.to_string()))?;

        let certificate_pem = cert.pem();
        let cert_chain = rustls_pemfile::certs(&mut certificate_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;
        let certificate_der = cert_chain
            .first()
            .cloned()
            .ok_or_else(|| TlsError::InvalidCert("empty certificate chain".to_string()))?;

        let private_key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| TlsError::InvalidCert(format!("Invalid private key: {e}")))?;

        let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)?;
        server_config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        tracing::debug!(hosts = ?hosts, "Generated TLS listener certificate");

        Ok(Self {
            certificate_pem,
            certificate_der,
            server_config: Arc::new(server_config),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }
}

/// Client config for origin connections. Accepts any server certificate and
/// offers `h2` before `http/1.1`.
pub fn origin_client_config() -> Result<Arc<ClientConfig>, TlsError> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyOrigin(provider)))
        .with_no_client_auth();
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyOrigin(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyOrigin {
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

    // Signatures are still checked so the handshake proves key possession.
    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_hosts() -> Vec<String> {
        vec!["localhost".to_string(), "127.0.0.1".to_string()]
    }

    #[test]
    fn test_self_signed_identity() {
        let identity = TlsIdentity::self_signed(&default_hosts()).expect("identity");

        assert!(identity.certificate_pem().contains("BEGIN CERTIFICATE"));
        assert!(identity.certificate_pem().contains("END CERTIFICATE"));
        assert!(!identity.certificate_der().is_empty());
    }

    #[test]
    fn test_server_config_advertises_alpn() {
        let identity = TlsIdentity::self_signed(&default_hosts()).expect("identity");
        let config = identity.server_config();

        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_each_identity_is_fresh() {
        let first = TlsIdentity::self_signed(&default_hosts()).expect("identity");
        let second = TlsIdentity::self_signed(&default_hosts()).expect("identity");

        assert_ne!(first.certificate_pem(), second.certificate_pem());
    }

    #[test]
    fn test_no_hosts_is_rejected() {
        assert!(matches!(
            TlsIdentity::self_signed(&[]),
            Err(TlsError::CertGeneration(_))
        ));
    }

    #[test]
    fn test_origin_client_config_offers_h2() {
        let config = origin_client_config().expect("client config");

        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
