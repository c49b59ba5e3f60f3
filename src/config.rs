//! Engine configuration.
//!
//! Loadable from TOML with `${ENV_VAR}` substitution, or built in code.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::Error;
use crate::ft::{AddressSource, PortMapper, StreamHost};

/// Callback deciding whether a peer TLS certificate (DER bytes) is
/// acceptable. The engine default accepts everything, mirroring the
/// permissive posture of most IM deployments; override for strict setups.
#[derive(Clone)]
pub struct CertValidator(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>);

impl CertValidator {
    pub fn new(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        CertValidator(Arc::new(f))
    }

    /// Accepts any certificate.
    pub fn accept_all() -> Self {
        CertValidator(Arc::new(|_| true))
    }

    pub fn validate(&self, der: &[u8]) -> bool {
        (self.0)(der)
    }
}

impl Default for CertValidator {
    fn default() -> Self {
        CertValidator::accept_all()
    }
}

impl fmt::Debug for CertValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertValidator(..)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Requested resource; the server assigns one when absent.
    #[serde(default)]
    pub resource: Option<String>,
    /// Whether to upgrade with STARTTLS when the server offers it.
    #[serde(default = "default_tls")]
    pub tls: bool,
    #[serde(skip)]
    pub cert_validator: CertValidator,
    #[serde(default)]
    pub file_transfer: FileTransferConfig,
}

fn default_port() -> u16 {
    5222
}

fn default_tls() -> bool {
    true
}

#[derive(Clone, Deserialize)]
pub struct FileTransferConfig {
    /// Offer only in-band bytestreams, skipping SOCKS5 entirely.
    #[serde(default)]
    pub force_in_band: bool,
    /// Whether mediated (proxy) SOCKS5 transfers may be attempted.
    #[serde(default = "default_proxy_allowed")]
    pub proxy_allowed: bool,
    /// Request a port mapping from the configured [`PortMapper`] when the
    /// local address looks NATed.
    #[serde(default)]
    pub use_upnp: bool,
    /// User-supplied SOCKS5 proxies, tried before server discovery.
    #[serde(default)]
    pub proxies: Vec<StreamHost>,
    /// Inclusive local port range for the direct-mode SOCKS5 listener.
    #[serde(default = "default_port_from")]
    pub socks5_port_from: u16,
    #[serde(default = "default_port_to")]
    pub socks5_port_to: u16,
    #[serde(default)]
    pub stun_server: StunServer,
    #[serde(skip)]
    pub port_mapper: Option<Arc<dyn PortMapper>>,
    #[serde(skip)]
    pub address_source: Option<Arc<dyn AddressSource>>,
}

fn default_proxy_allowed() -> bool {
    true
}

fn default_port_from() -> u16 {
    49152
}

fn default_port_to() -> u16 {
    65535
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        FileTransferConfig {
            force_in_band: false,
            proxy_allowed: true,
            use_upnp: false,
            proxies: Vec::new(),
            socks5_port_from: default_port_from(),
            socks5_port_to: default_port_to(),
            stun_server: StunServer::default(),
            port_mapper: None,
            address_source: None,
        }
    }
}

impl fmt::Debug for FileTransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransferConfig")
            .field("force_in_band", &self.force_in_band)
            .field("proxy_allowed", &self.proxy_allowed)
            .field("use_upnp", &self.use_upnp)
            .field("proxies", &self.proxies)
            .field("socks5_port_from", &self.socks5_port_from)
            .field("socks5_port_to", &self.socks5_port_to)
            .field("stun_server", &self.stun_server)
            .field("port_mapper", &self.port_mapper.is_some())
            .field("address_source", &self.address_source.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl Default for StunServer {
    fn default() -> Self {
        StunServer {
            host: "stun.l.google.com".to_owned(),
            port: 19302,
        }
    }
}

impl Config {
    /// Loads a TOML configuration file, expanding `${ENV_VAR}` references.
    pub fn load(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)
            .map_err(|_| Error::InvalidState("undefined environment variable in config"))?;
        let config: Config = toml::from_str(&expanded)
            .map_err(|_| Error::InvalidState("malformed configuration file"))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::InvalidState("hostname must not be empty"));
        }
        if self.username.is_empty() {
            return Err(Error::InvalidState("username must not be empty"));
        }
        if self.file_transfer.socks5_port_from > self.file_transfer.socks5_port_to {
            return Err(Error::InvalidState(
                "socks5_port_from must not exceed socks5_port_to",
            ));
        }
        Ok(())
    }

    /// The account bare JID string (`username@hostname`).
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}
