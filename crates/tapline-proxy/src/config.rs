//! On-disk proxy settings.
//!
//! A JSON file read with `serde_json`. Every field is optional; missing
//! fields take the same defaults as [`ProxyConfig::with_ca`].

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ca::CaManager;
use crate::conditions::{always_mitm, always_plain_mitm, AlwaysDecide};
use crate::error::{ProxyError, Result};
use crate::http1::DEFAULT_MAX_BODY_BYTES;
use crate::origin::{OriginTls, DEFAULT_CONNECT_TIMEOUT};
use crate::proxy::ProxyConfig;
use crate::DEFAULT_PROXY_PORT;

/// Which interception policy the binary installs for every CONNECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptMode {
    /// Tunnel bytes untouched.
    #[default]
    None,
    /// Terminate TLS with a forged leaf and inspect the requests.
    Tls,
    /// Read cleartext HTTP from the tunnel.
    Plain,
}

impl InterceptMode {
    /// The connect filter implementing this mode, if any.
    pub fn connect_filter(self) -> Option<AlwaysDecide> {
        match self {
            InterceptMode::None => None,
            InterceptMode::Tls => Some(always_mitm()),
            InterceptMode::Plain => Some(always_plain_mitm()),
        }
    }
}

impl FromStr for InterceptMode {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(InterceptMode::None),
            "tls" | "mitm" => Ok(InterceptMode::Tls),
            "plain" => Ok(InterceptMode::Plain),
            other => Err(ProxyError::Config(format!(
                "unknown intercept mode '{}' (expected none, tls or plain)",
                other
            ))),
        }
    }
}

impl fmt::Display for InterceptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterceptMode::None => "none",
            InterceptMode::Tls => "tls",
            InterceptMode::Plain => "plain",
        };
        f.write_str(name)
    }
}

/// Settings file for the `tapline` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Address the proxy listens on.
    pub listen: SocketAddr,
    /// Where the root authority lives. Platform data dir when unset.
    pub ca_dir: Option<PathBuf>,
    pub intercept: InterceptMode,
    pub allow_http2: bool,
    pub keep_destination_headers: bool,
    pub preserve_header_case: bool,
    pub keep_accept_encoding: bool,
    /// Accept any origin certificate.
    pub skip_origin_verify: bool,
    /// Extra PEM trust anchors for origin connections.
    pub origin_ca_file: Option<PathBuf>,
    /// Directory for rotated log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Largest request body the proxy buffers.
    pub max_body_bytes: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_dir: None,
            intercept: InterceptMode::None,
            allow_http2: false,
            keep_destination_headers: false,
            preserve_header_case: false,
            keep_accept_encoding: false,
            skip_origin_verify: false,
            origin_ca_file: None,
            log_dir: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ProxySettings {
    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ProxyError::Config(format!("{}: {}", path.display(), e)))
    }

    /// The CA manager these settings point at.
    pub fn ca_manager(&self) -> Result<CaManager> {
        match &self.ca_dir {
            Some(dir) => Ok(CaManager::new(dir)),
            None => Ok(CaManager::with_default_dir()?),
        }
    }

    /// Builds the library configuration.
    ///
    /// Fails when the origin trust file cannot be read.
    pub fn into_config(&self) -> Result<ProxyConfig> {
        let mut origin_tls = OriginTls::new().skip_verify(self.skip_origin_verify);
        if let Some(file) = &self.origin_ca_file {
            origin_tls.add_roots_from_pem(file)?;
        }

        let timeout = if self.connect_timeout_secs == 0 {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            Duration::from_secs(self.connect_timeout_secs)
        };

        Ok(ProxyConfig::with_ca(self.ca_manager()?)
            .with_addr(self.listen)
            .with_http2(self.allow_http2)
            .with_destination_headers(self.keep_destination_headers)
            .with_header_case(self.preserve_header_case)
            .with_accept_encoding(self.keep_accept_encoding)
            .with_origin_tls(origin_tls)
            .with_connect_timeout(timeout)
            .with_max_body(self.max_body_bytes))
    }
}
