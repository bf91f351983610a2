//! rustls configuration for the QUIC/HTTP3 transport: ALPN `h3`, server
//! certificate/key loading, optional client-certificate (mTLS)
//! verification, and the client's matching trust configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig as RustlsClientConfig, RootCertStore, ServerConfig as RustlsServerConfig};

use crate::error::{Result, TunnelError};

const ALPN_H3: &[u8] = b"h3";

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Config(format!("opening cert {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Config(format!("parsing cert {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Config(format!("opening key {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TunnelError::Config(format!("parsing key {}: {e}", path.display())))?
        .ok_or_else(|| TunnelError::Config(format!("no private key found in {}", path.display())))
}

/// Build the server-side QUIC TLS config. When `client_ca` is given, the
/// server requires and verifies an mTLS client certificate; otherwise
/// clients authenticate purely via HTTP Basic over the capsule stream.
pub fn server_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<Arc<RustlsServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = if let Some(ca_path) = client_ca {
        let ca_certs = load_certs(ca_path)?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| TunnelError::Config(format!("invalid client CA: {e}")))?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TunnelError::Config(format!("building client verifier: {e}")))?;
        RustlsServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
    } else {
        RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
    }
    .map_err(|e| TunnelError::Config(format!("building server TLS config: {e}")))?;

    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Ok(Arc::new(config))
}

/// Build the client-side QUIC TLS config. `insecure_skip_verify` disables
/// server certificate verification entirely; it exists for lab use against
/// self-signed deployments and must never be the default.
pub fn client_tls_config(
    ca_path: Option<&Path>,
    client_identity: Option<(&Path, &Path)>,
    insecure_skip_verify: bool,
) -> Result<Arc<RustlsClientConfig>> {
    let builder = RustlsClientConfig::builder();

    let builder = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
    } else {
        let mut roots = RootCertStore::empty();
        if let Some(ca_path) = ca_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TunnelError::Config(format!("invalid CA cert: {e}")))?;
            }
        } else {
            roots.extend(webpki_roots_placeholder());
        }
        builder.with_root_certificates(roots)
    };

    let mut config = if let Some((cert_path, key_path)) = client_identity {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TunnelError::Config(format!("building client TLS identity: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_H3.to_vec()];
    Ok(Arc::new(config))
}

/// Placeholder trust anchor set used only when no explicit `--ca` is given
/// and mTLS to a private deployment is not the intent; callers are expected
/// to supply `ca_path` for anything beyond local testing.
fn webpki_roots_placeholder() -> Vec<CertificateDer<'static>> {
    Vec::new()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
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
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ]
        }
    }
}
