//! TLS client configuration for ldaps:// connections: system roots, an optional
//! extra CA bundle, or no verification at all.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::sync::Arc;

/// Verifier that accepts any server certificate. Only for `tls.skip_verify` (tests, internal networks).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Client config that skips server certificate verification.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Arc::new(config)
}

/// Client config trusting the system roots plus, optionally, the PEM bundle at `ca_file`.
pub fn client_config_with_ca(ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        let _ = root_store.add(cert);
    }
    if let Some(path) = ca_file {
        for cert in load_ca_file(path)? {
            root_store
                .add(cert)
                .with_context(|| format!("Add CA certificate from {}", path))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn client_config(skip_verify: bool, ca_file: Option<&str>) -> Result<Arc<ClientConfig>> {
    if skip_verify {
        return Ok(insecure_client_config());
    }
    client_config_with_ca(ca_file)
}

pub fn load_ca_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("Open CA file: {}", path))?;
    load_ca_pem(&pem).with_context(|| format!("Load CA file: {}", path))
}

pub fn load_ca_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = certs(&mut std::io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates in PEM data");
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_insecure_client_config() {
        let config = client_config(true, Some("/nonexistent/ca.pem")).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_load_ca_pem_without_certificates() {
        let err = load_ca_pem(b"not a certificate\n").unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }

    #[test]
    fn test_load_ca_file_errors() {
        assert!(load_ca_file("/nonexistent/path/ca.pem").is_err());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"# empty bundle\n").unwrap();
        file.flush().unwrap();
        let err = load_ca_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(format!("{:#}", err).contains("No certificates"));
    }

    #[test]
    fn test_verified_config_with_missing_ca_file() {
        assert!(client_config(false, Some("/nonexistent/ca.pem")).is_err());
    }
}
