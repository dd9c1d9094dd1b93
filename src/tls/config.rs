//! TLS configuration utilities

use crate::error::{Error, Result};
use crate::tls::credential::ServerCredential;
use rustls::{Certificate, ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// rustls server config for a TLS listener; only HTTP/1.1 is offered over ALPN.
pub fn server_config(credential: &ServerCredential) -> Result<Arc<ServerConfig>> {
    debug!("Creating TLS server configuration");

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(credential.certs().to_vec(), credential.key().clone())
        .map_err(|e| Error::Tls(format!("Failed to create TLS server config: {}", e)))?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// rustls client config for `https://` origins, trusting the system root store.
pub fn client_config() -> Arc<ClientConfig> {
    client_config_with_roots(native_root_store())
}

/// rustls client config trusting only `roots`.
pub fn client_config_with_roots(roots: RootCertStore) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn native_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut failed = 0;
            for cert_der in certs {
                if root_store.add(&Certificate(cert_der.to_vec())).is_err() {
                    failed += 1;
                }
            }
            info!("Root certificate store initialized with {} certificate(s)", root_store.len());
            if failed > 0 {
                debug!("Skipped {} unparsable system certificate(s)", failed);
            }
        }
        Err(e) => {
            // Plain-HTTP proxying keeps working without a system store.
            warn!("Could not load system root certificates: {}", e);
        }
    }

    root_store
}
