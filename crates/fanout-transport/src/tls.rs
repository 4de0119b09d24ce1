// TLS configuration loading for the broker and its clients.
use anyhow::{Context, Result, anyhow};
use quinn::{ClientConfig as QuinnClientConfig, ServerConfig as QuinnServerConfig};
use rustls::DigitallySignedStruct;
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load an X.509 certificate chain and private key pair from PEM files and
/// build the server config presented on both listeners.
pub fn build_server_config(cert_path: &Path, key_path: &Path) -> Result<QuinnServerConfig> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_path.display()));
    }
    let key = load_private_key(key_path)?;
    QuinnServerConfig::with_single_cert(certs, key).context("build QUIC server config")
}

/// Build a client config trusting the CA certificate at `<certs_dir>/ca.pem`.
pub fn build_client_config(certs_dir: &Path) -> Result<QuinnClientConfig> {
    let ca_path = certs_dir.join("ca.pem");
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&ca_path)? {
        roots
            .add(cert)
            .with_context(|| format!("add root cert from {}", ca_path.display()))?;
    }
    if roots.is_empty() {
        return Err(anyhow!("no CA certificates found in {}", ca_path.display()));
    }
    Ok(QuinnClientConfig::with_root_certificates(Arc::new(roots))?)
}

/// Client config that skips certificate chain validation. Handshake
/// signatures are still verified; only the trust decision is bypassed.
/// For tests and local runs against a self-signed broker.
pub fn insecure_client_config() -> Result<QuinnClientConfig> {
    let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
    let tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
        .with_no_client_auth();
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
    Ok(QuinnClientConfig::new(Arc::new(crypto)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("open certificate {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("parse certificates in {}", path.display()))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open private key {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

// Trusts whatever certificate the broker presents, while leaving signature
// verification to the provider's own algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use std::fs;

    #[test]
    fn loads_server_config_from_pem_files() -> Result<()> {
        let certified = generate_simple_self_signed(vec!["localhost".into()])?;
        let dir = std::env::temp_dir().join("fanout-tls-server-test");
        fs::create_dir_all(&dir)?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("private.key");
        fs::write(&cert_path, certified.cert.pem())?;
        fs::write(&key_path, certified.key_pair.serialize_pem())?;

        build_server_config(&cert_path, &key_path)?;
        Ok(())
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = build_server_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .expect_err("missing cert");
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn loads_client_roots_from_ca_pem() -> Result<()> {
        let certified = generate_simple_self_signed(vec!["localhost".into()])?;
        let dir = std::env::temp_dir().join("fanout-tls-client-test");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("ca.pem"), certified.cert.pem())?;

        build_client_config(&dir)?;
        Ok(())
    }

    #[test]
    fn insecure_config_advertises_provider_schemes() -> Result<()> {
        insecure_client_config()?;
        let algorithms =
            rustls::crypto::ring::default_provider().signature_verification_algorithms;
        let verifier = AcceptAnyServerCert { algorithms };
        assert!(!verifier.supported_verify_schemes().is_empty());
        Ok(())
    }
}
