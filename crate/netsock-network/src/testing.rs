//! Helpers for tests: generated certificates and scratch files.

use crate::tls::{KeyStore, TrustStore};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, SanType};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// A freshly generated self-signed certificate and its key.
///
/// The certificate is valid for the given DNS name and for
/// 127.0.0.1. Used as key store, it identifies its owner; used as
/// trust store, it lets peers trust that owner.
pub struct TestCerts {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestCerts {
    pub fn generate(dns_name: &str) -> Self {
        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("Failed to generate test key");
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, dns_name.to_string());
        params.subject_alt_names = vec![
            SanType::DnsName(dns_name.try_into().expect("Invalid test DNS name")),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        let cert = params
            .self_signed(&key_pair)
            .expect("Failed to self-sign test certificate");

        Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    /// Write certificate and key into a single PEM key store.
    pub fn write_key_store(&self, path: &Path) -> io::Result<KeyStore> {
        fs::write(path, format!("{}{}", self.cert_pem, self.key_pem))?;

        Ok(KeyStore::new(path))
    }

    /// Write the certificate alone into a PEM trust store.
    pub fn write_trust_store(&self, path: &Path) -> io::Result<TrustStore> {
        fs::write(path, &self.cert_pem)?;

        Ok(TrustStore::new(path))
    }
}

/// Create `path` with the given content, replacing any existing
/// file.
pub fn write_scratch_file(path: &Path, content: &[u8]) -> io::Result<()> {
    remove_if_exists(path)?;
    fs::File::create(path)?;
    fs::write(path, content)
}

/// Delete `path` if it exists; a missing file isn't an error.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }

    Ok(())
}
