use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;

use crate::error::RealtimeError;

/// TLS client settings for the realtime websocket. Trusts the PEM bundle in
/// `cafile` when given, the bundled web roots otherwise.
pub fn client_config(cafile: Option<&Path>) -> Result<Arc<ClientConfig>, RealtimeError> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if let Some(cafile) = cafile {
        let certs = CertificateDer::pem_file_iter(cafile)
            .map_err(|e| RealtimeError::Tls(format!("{}: {}", cafile.display(), e)))?;
        for cert in certs {
            let cert = cert.map_err(|e| RealtimeError::Tls(e.to_string()))?;
            root_cert_store
                .add(cert)
                .map_err(|e| RealtimeError::Tls(e.to_string()))?;
        }
    } else {
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RealtimeError::Tls(e.to_string()))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
