//! Server certificate chain and private key

use crate::error::{Error, Result};
use rustls::{Certificate, PrivateKey};
use rustls_pemfile::Item;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Certificate chain plus private key served by a TLS listener
pub struct ServerCredential {
    certs: Vec<Certificate>,
    key: PrivateKey,
}

impl ServerCredential {
    /// Load PEM files from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        debug!("Loading certificate from {} and key from {}", cert_path.display(), key_path.display());

        let cert_pem = fs::read(cert_path).map_err(|e| {
            Error::Tls(format!("Failed to read certificate file {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read(key_path).map_err(|e| {
            Error::Tls(format!("Failed to read private key file {}: {}", key_path.display(), e))
        })?;

        let credential = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            "Loaded {} certificate(s) from {}",
            credential.certs.len(),
            cert_path.display()
        );
        Ok(credential)
    }

    /// Parse a PEM certificate chain and a PKCS#8, RSA or SEC1 private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs: Vec<Certificate> = rustls_pemfile::certs(&mut &cert_pem[..])
            .map_err(|e| Error::Tls(format!("Invalid certificate PEM: {}", e)))?
            .into_iter()
            .map(Certificate)
            .collect();
        if certs.is_empty() {
            return Err(Error::Tls("No certificate found in PEM data".to_string()));
        }

        let key = rustls_pemfile::read_all(&mut &key_pem[..])
            .map_err(|e| Error::Tls(format!("Invalid private key PEM: {}", e)))?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
                _ => None,
            })
            .ok_or_else(|| Error::Tls("No private key found in PEM data".to_string()))?;

        Ok(Self { certs, key })
    }

    pub fn certs(&self) -> &[Certificate] {
        &self.certs
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }
}
