//! Layered TOML configuration for tether.
//!
//! Loads from:
//! - Global config: `~/.config/tether/tether.toml`
//! - Project config: `<cwd>/.tether/tether.toml`
//!
//! Every field is optional. A field set in the project file overrides the
//! global one; anything still unset falls back to the built-in default when
//! the relay configuration is assembled.
//!
//! # Example
//!
//! ```no_run
//! use tether_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new(".")).unwrap();
//! println!("{:?}", config.relay.listen_port);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client-facing relay protocol as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolSetting {
    Socks5,
    Http,
}

impl fmt::Display for ProtocolSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolSetting::Socks5 => f.write_str("socks5"),
            ProtocolSetting::Http => f.write_str("http"),
        }
    }
}

/// Upstream SOCKS5 session setup as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeSetting {
    /// CONNECT request first, no method negotiation.
    Direct,
    /// Greeting `[5,1,0]`, then CONNECT.
    Negotiate,
}

/// TOML `[relay]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySettings {
    /// Port the browser connects to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Local end of the forwarded tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,

    /// Proxy port on the phone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<ProtocolSetting>,

    /// Bound on tunnel connect plus SOCKS5 reply, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,

    /// Bound on receiving an HTTP header block or a SOCKS5 request, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_handshake: Option<HandshakeSetting>,
}

/// TOML `[link]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSettings {
    /// `adb` executable. Defaults to `adb` on `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adb_path: Option<String>,

    /// Device serial to forward through when none is given on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Tunnel probe timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
}

/// Top-level tether configuration, corresponding to `tether.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub link: LinkSettings,
}

impl TetherConfig {
    /// Parse a `TetherConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `TetherConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Starter config written by `tether config init`: the built-in defaults
    /// spelled out so they can be edited.
    pub fn starter() -> Self {
        Self {
            relay: RelaySettings {
                listen_port: Some(7890),
                tunnel_port: Some(7891),
                remote_port: Some(7890),
                protocol: Some(ProtocolSetting::Socks5),
                handshake_timeout_secs: Some(15),
                header_timeout_secs: Some(30),
                upstream_handshake: Some(HandshakeSetting::Direct),
            },
            link: LinkSettings {
                adb_path: Some("adb".to_string()),
                device: None,
                probe_timeout_ms: Some(1500),
            },
        }
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// Every field is scalar: `other` wins when explicitly set (`Some`).
    #[must_use]
    pub fn merge(mut self, other: TetherConfig) -> TetherConfig {
        let relay = other.relay;
        overlay(&mut self.relay.listen_port, relay.listen_port);
        overlay(&mut self.relay.tunnel_port, relay.tunnel_port);
        overlay(&mut self.relay.remote_port, relay.remote_port);
        overlay(&mut self.relay.protocol, relay.protocol);
        overlay(&mut self.relay.handshake_timeout_secs, relay.handshake_timeout_secs);
        overlay(&mut self.relay.header_timeout_secs, relay.header_timeout_secs);
        overlay(&mut self.relay.upstream_handshake, relay.upstream_handshake);

        let link = other.link;
        overlay(&mut self.link.adb_path, link.adb_path);
        overlay(&mut self.link.device, link.device);
        overlay(&mut self.link.probe_timeout_ms, link.probe_timeout_ms);
        self
    }
}

fn overlay<T>(base: &mut Option<T>, project: Option<T>) {
    if project.is_some() {
        *base = project;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = TetherConfig::parse("").unwrap();
        assert_eq!(config, TetherConfig::default());
    }

    #[test]
    fn test_parse_relay_section() {
        let toml = "[relay]\nlisten_port = 1080\ntunnel_port = 9000\nprotocol = \"http\"";
        let config = TetherConfig::parse(toml).unwrap();
        assert_eq!(config.relay.listen_port, Some(1080));
        assert_eq!(config.relay.tunnel_port, Some(9000));
        assert_eq!(config.relay.protocol, Some(ProtocolSetting::Http));
        assert!(config.relay.remote_port.is_none());
    }

    #[test]
    fn test_parse_link_section() {
        let toml = "[link]\nadb_path = \"/opt/platform-tools/adb\"\ndevice = \"emulator-5554\"";
        let config = TetherConfig::parse(toml).unwrap();
        assert_eq!(
            config.link.adb_path.as_deref(),
            Some("/opt/platform-tools/adb")
        );
        assert_eq!(config.link.device.as_deref(), Some("emulator-5554"));
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        let result = TetherConfig::parse("[relay]\nprotocol = \"https\"");
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let result = TetherConfig::parse("[relay]\nlisten = 1080");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_port() {
        assert!(TetherConfig::parse("[relay]\nlisten_port = 70000").is_err());
    }

    #[test]
    fn test_parse_upstream_handshake() {
        let config = TetherConfig::parse("[relay]\nupstream_handshake = \"negotiate\"").unwrap();
        assert_eq!(
            config.relay.upstream_handshake,
            Some(HandshakeSetting::Negotiate)
        );
    }

    #[test]
    fn test_merge_scalar_project_wins() {
        let global = TetherConfig::parse("[relay]\nlisten_port = 7890\nprotocol = \"socks5\"").unwrap();
        let project = TetherConfig::parse("[relay]\nprotocol = \"http\"").unwrap();
        let merged = global.merge(project);
        assert_eq!(merged.relay.protocol, Some(ProtocolSetting::Http));
        assert_eq!(merged.relay.listen_port, Some(7890));
    }

    #[test]
    fn test_merge_global_kept_when_project_absent() {
        let global = TetherConfig::parse("[link]\ndevice = \"abc123\"").unwrap();
        let merged = global.merge(TetherConfig::default());
        assert_eq!(merged.link.device.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = TetherConfig::starter();
        let serialized = config.to_toml().unwrap();
        assert!(serialized.contains("[relay]"));
        assert!(serialized.contains("protocol = \"socks5\""));
        assert_eq!(TetherConfig::parse(&serialized).unwrap(), config);
    }

    #[test]
    fn test_default_serializes_without_unset_fields() {
        let serialized = TetherConfig::default().to_toml().unwrap();
        assert!(!serialized.contains("listen_port"));
        assert!(!serialized.contains("device"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tether.toml");

        let mut config = TetherConfig::default();
        config.relay.tunnel_port = Some(9100);
        config.save(&path).unwrap();

        let loaded = TetherConfig::load(&path).unwrap();
        assert_eq!(loaded.relay.tunnel_port, Some(9100));
    }

    #[test]
    fn test_protocol_setting_display() {
        assert_eq!(ProtocolSetting::Socks5.to_string(), "socks5");
        assert_eq!(ProtocolSetting::Http.to_string(), "http");
    }
}
