//! Per-host leaf certificates and the TLS server configurations built on them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, trace};

use crate::ca::CertificateAuthority;
use crate::ctx::ProxyCtx;
use crate::error::{CaManagerError, Result};

/// ALPN identifiers offered to intercepted clients when HTTP/2 relaying is on.
pub const ALPN_H2_AND_H1: &[&[u8]] = &[b"h2", b"http/1.1"];

/// ALPN identifiers offered to intercepted clients otherwise.
pub const ALPN_H1: &[&[u8]] = &[b"http/1.1"];

/// Produces the server-side TLS configuration for an intercepted host.
pub type TlsConfigFn = Arc<dyn Fn(&str, &ProxyCtx) -> Result<Arc<ServerConfig>> + Send + Sync>;

/// Storage for signed leaf certificates, keyed by hostname.
///
/// `fetch` returns the stored leaf for `hostname`, or calls `generate`,
/// stores the result and returns it. Eviction and single-flight generation
/// are up to the implementation.
pub trait CertStorage: Send + Sync {
    /// Fetches or generates the leaf for `hostname`.
    fn fetch(
        &self,
        hostname: &str,
        generate: &dyn Fn() -> std::result::Result<Arc<CertifiedKey>, CaManagerError>,
    ) -> std::result::Result<Arc<CertifiedKey>, CaManagerError>;
}

/// Unbounded in-memory certificate store.
#[derive(Default)]
pub struct MemoryCertStorage {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl MemoryCertStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored leaves.
    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    /// Returns true if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }

    /// Drops every stored leaf.
    pub fn clear(&self) {
        self.certs.write().clear();
    }
}

impl fmt::Debug for MemoryCertStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCertStorage")
            .field("len", &self.len())
            .finish()
    }
}

impl CertStorage for MemoryCertStorage {
    fn fetch(
        &self,
        hostname: &str,
        generate: &dyn Fn() -> std::result::Result<Arc<CertifiedKey>, CaManagerError>,
    ) -> std::result::Result<Arc<CertifiedKey>, CaManagerError> {
        let key = hostname.to_ascii_lowercase();
        if let Some(cert) = self.certs.read().get(&key) {
            trace!("Certificate cache hit for {}", hostname);
            return Ok(cert.clone());
        }

        // Generated outside the lock; two racing misses both sign, the first insert wins.
        let cert = generate()?;
        let mut certs = self.certs.write();
        Ok(certs.entry(key).or_insert(cert).clone())
    }
}

/// Resolver that always presents the leaf chosen for the CONNECT target.
///
/// The host comes from the CONNECT line, so clients without SNI still get
/// a matching certificate.
struct HostCertResolver {
    host: String,
    cert: Arc<CertifiedKey>,
}

impl fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCertResolver")
            .field("host", &self.host)
            .finish()
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(sni) = client_hello.server_name() {
            if !sni.eq_ignore_ascii_case(&self.host) {
                trace!("SNI {} differs from CONNECT host {}", sni, self.host);
            }
        }
        Some(self.cert.clone())
    }
}

/// Builds a [`TlsConfigFn`] that signs leaves with `authority` and caches them in `storage`.
pub fn tls_config_from_ca(
    authority: Arc<CertificateAuthority>,
    storage: Arc<dyn CertStorage>,
    alpn: &[&[u8]],
) -> TlsConfigFn {
    let alpn: Vec<Vec<u8>> = alpn.iter().map(|p| p.to_vec()).collect();

    Arc::new(move |host: &str, ctx: &ProxyCtx| {
        let hostname = strip_port(host);
        let cert = storage.fetch(hostname, &|| authority.sign_leaf(hostname))?;
        debug!(session = ctx.session(), "Serving leaf certificate for {}", hostname);

        let mut config = ServerConfig::builder_with_provider(authority.provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(HostCertResolver {
                host: hostname.to_string(),
                cert,
            }));
        config.alpn_protocols = alpn.clone();

        Ok(Arc::new(config))
    })
}

/// Removes a `:port` suffix (and IPv6 brackets) from `host`.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}
