//! Certificate Authority management for MITM proxy.
//!
//! Generates and manages the root CA certificate used to sign per-host
//! leaf certificates on the fly.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

pub use crate::error::CaManagerError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "tapline-ca.crt";
const CA_KEY_FILENAME: &str = "tapline-ca.key";

/// Common name of the generated root.
const CA_COMMON_NAME: &str = "Tapline Root CA";

/// Leaf validity, counted from issuance.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager using the default Tapline data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "tapline", "Tapline")
            .ok_or_else(|| CaManagerError::Generation("Failed to get project dirs".into()))?;

        let ca_dir = project_dirs.data_dir().join("ca");
        Ok(Self::new(ca_dir))
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Ensures the CA certificate exists, generating it if necessary.
    ///
    /// Returns the loaded authority ready to sign leaf certificates.
    pub fn ensure_ca(&self) -> Result<CertificateAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Tapline");

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS * 10);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());

        Ok(())
    }

    /// Loads the CA certificate and key into a signing authority.
    pub fn load_authority(&self) -> Result<CertificateAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;
        CertificateAuthority::from_pem(&cert_pem, &key_pem)
    }

    /// Reads the CA certificate PEM (for installation into client trust stores).
    pub fn read_cert_pem(&self) -> Result<String, CaManagerError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }
}

/// A loaded root authority able to sign per-host leaf certificates.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_der_len", &self.cert_der.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Builds an authority from PEM-encoded root certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaManagerError> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaManagerError::Parse("no certificate in PEM".into()))?
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            cert_der,
            provider: Arc::new(default_provider()),
        })
    }

    /// DER encoding of the root certificate.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Crypto provider used for leaf keys and TLS configurations.
    pub fn provider(&self) -> Arc<CryptoProvider> {
        self.provider.clone()
    }

    /// Signs a fresh leaf certificate for `host`.
    ///
    /// `host` must not carry a port. IP literals get an IP SAN.
    pub fn sign_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>, CaManagerError> {
        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        // rcgen turns IP literals into IP SANs and everything else into DNS SANs.
        let san = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let mut params = CertificateParams::new(vec![san])
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.use_authority_key_identifier_extension = true;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key_der)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let chain = vec![cert.der().clone(), self.cert_der.clone()];
        tracing::debug!(
            "Signed leaf certificate for {} ({})",
            host,
            if host.parse::<IpAddr>().is_ok() { "ip" } else { "dns" }
        );

        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(
            manager.cert_path(),
            PathBuf::from("/tmp/test-ca/tapline-ca.crt")
        );
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/tmp/test-ca/tapline-ca.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn ca_manager_generate_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        assert!(manager.ca_exists());

        let authority = manager.load_authority().unwrap();
        assert!(!authority.cert_der().is_empty());
    }

    #[test]
    fn ensure_ca_keeps_existing_root() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let first = manager.ensure_ca().unwrap();
        let second = manager.ensure_ca().unwrap();
        assert_eq!(first.cert_der(), second.cert_der());
    }

    #[test]
    fn read_cert_pem_returns_certificate() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();

        let pem = manager.read_cert_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn leaf_is_chained_to_root() {
        let temp_dir = TempDir::new().unwrap();
        let authority = CaManager::new(temp_dir.path()).ensure_ca().unwrap();

        let leaf = authority.sign_leaf("example.com").unwrap();
        assert_eq!(leaf.cert.len(), 2);
        assert_eq!(&leaf.cert[1], authority.cert_der());
        assert_ne!(&leaf.cert[0], authority.cert_der());
    }

    #[test]
    fn leaf_for_ip_literal() {
        let temp_dir = TempDir::new().unwrap();
        let authority = CaManager::new(temp_dir.path()).ensure_ca().unwrap();
        assert!(authority.sign_leaf("127.0.0.1").is_ok());
    }
}
