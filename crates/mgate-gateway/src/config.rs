//! Gateway configuration: TOML file + CLI overrides.

use mgate_core::{GateError, GateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Listener protocol dispatch hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Raw forward to `forward_to`.
    Tcp,
    /// Sniff the ClientHello, terminate TLS, dispatch on ALPN.
    Tls,
    /// Auto-detect on the wire (TLS / H2 preface / HTTP/1 / SOCKS).
    Http,
    /// Terminate TLS and serve the mesh H2 surface.
    Https,
    /// SOCKS5 egress capture.
    Socks5,
    /// Virtual: no OS listener, lookup-only (handler or forward target).
    #[serde(rename = "-")]
    Virtual,
}

impl Protocol {
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
            Protocol::Virtual => "-",
        }
    }
}

/// One listener. Immutable after start; one OS listener backs 0 or 1 config.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// `host:port`. `":0"` or empty requests an ephemeral port; a leading
    /// `-` marks the listener virtual (non-binding, lookup-only).
    #[serde(default)]
    pub address: String,
    pub protocol: Protocol,
    /// Static forward override (`host:port` or identity:port).
    #[serde(default)]
    pub forward_to: Option<String>,
    /// ALPN protocols offered when this listener terminates TLS.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Name of an in-process handler. Mutually exclusive with `forward_to`.
    #[serde(default)]
    pub handler: Option<String>,
}

impl ListenerConfig {
    pub fn is_virtual(&self) -> bool {
        self.address.starts_with('-') || self.protocol == Protocol::Virtual
    }

    /// The port this listener answers for, virtual listeners included.
    pub fn port(&self) -> Option<u16> {
        let addr = self.address.trim_start_matches('-');
        addr.rsplit(':').next().and_then(|p| p.parse().ok())
    }

    pub fn validate(&self) -> GateResult<()> {
        if self.handler.is_some() && self.forward_to.is_some() {
            return Err(GateError::Config(format!(
                "listener {}: handler and forward_to are mutually exclusive",
                self.address
            )));
        }
        Ok(())
    }
}

/// A peer to keep a reverse tunnel to.
#[derive(Debug, Clone, Deserialize)]
pub struct PinnedPeer {
    /// Dial address of the rendezvous gateway.
    pub address: String,
    /// Expected identity; pinned during the TLS handshake when set.
    #[serde(default)]
    pub identity: Option<String>,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Reverse-tunnel upstreams (`[[h2r]]` tables).
    #[serde(default)]
    pub h2r: Vec<PinnedPeer>,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    /// Hex-encoded shared secret for bearer tokens. Random when absent.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            cert: default_cert_path(),
            key: default_key_path(),
            secret: None,
        }
    }
}

fn default_cert_path() -> String {
    "~/.mgate/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.mgate/key.pem".to_string()
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub secret: Option<Vec<u8>>,
    pub listeners: Vec<ListenerConfig>,
    pub h2r: Vec<PinnedPeer>,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_base_port: Option<u16>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_h2r: &[String],
    ) -> GateResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut listeners = file_config.listeners;
        for l in &listeners {
            l.validate()?;
        }

        // --port expands to the standard listener block at base..base+2
        if let Some(base) = cli_base_port {
            listeners.extend(standard_listeners(base));
        }

        let mut h2r = file_config.h2r;
        for addr in cli_h2r {
            h2r.push(PinnedPeer {
                address: addr.clone(),
                identity: None,
            });
        }

        let cert_str = cli_cert
            .map(|s| s.to_string())
            .unwrap_or(file_config.gateway.cert);
        let key_str = cli_key
            .map(|s| s.to_string())
            .unwrap_or(file_config.gateway.key);

        let secret = match &file_config.gateway.secret {
            Some(s) => Some(
                hex::decode(s).map_err(|_| GateError::Config("secret is not hex".into()))?,
            ),
            None => None,
        };

        Ok(Self {
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),
            secret,
            listeners,
            h2r,
        })
    }
}

/// The standard listener block rooted at `base`: mesh HTTPS, SOCKS egress,
/// and a sniffing TCP port.
pub fn standard_listeners(base: u16) -> Vec<ListenerConfig> {
    vec![
        ListenerConfig {
            address: format!("0.0.0.0:{base}"),
            protocol: Protocol::Https,
            forward_to: None,
            alpn: vec!["h2r".into(), "h2".into()],
            handler: None,
        },
        ListenerConfig {
            address: format!("127.0.0.1:{}", base + 1),
            protocol: Protocol::Socks5,
            forward_to: None,
            alpn: Vec::new(),
            handler: None,
        },
        ListenerConfig {
            address: format!("0.0.0.0:{}", base + 2),
            protocol: Protocol::Http,
            forward_to: None,
            alpn: Vec::new(),
            handler: None,
        },
    ]
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listener_table() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [gateway]
            cert = "/tmp/cert.pem"
            key = "/tmp/key.pem"

            [[listeners]]
            address = "0.0.0.0:15007"
            protocol = "https"
            alpn = ["h2r", "h2"]

            [[listeners]]
            address = "-:15012"
            protocol = "-"
            handler = "echo"

            [[h2r]]
            address = "gate.example.com:15007"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listeners.len(), 2);
        assert!(cfg.listeners[1].is_virtual());
        assert_eq!(cfg.listeners[1].port(), Some(15012));
        assert_eq!(cfg.h2r.len(), 1);
    }

    #[test]
    fn handler_and_forward_are_exclusive() {
        let l = ListenerConfig {
            address: "127.0.0.1:1".into(),
            protocol: Protocol::Tcp,
            forward_to: Some("127.0.0.1:2".into()),
            alpn: Vec::new(),
            handler: Some("echo".into()),
        };
        assert!(l.validate().is_err());
    }

    #[test]
    fn ephemeral_port_parses_as_zero() {
        let l = ListenerConfig {
            address: ":0".into(),
            protocol: Protocol::Http,
            forward_to: None,
            alpn: Vec::new(),
            handler: None,
        };
        assert_eq!(l.port(), Some(0));
    }
}
