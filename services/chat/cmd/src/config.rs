//! Configuration handling for the mesh node binary.
//!
//! Settings come from a YAML file, then environment variables, then
//! command line flags, each layer overriding the previous one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// A statically configured peer: 8 hex digits of id plus an address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticPeer {
    /// Peer id, 8 hex digits
    pub id: String,
    /// Transport address, e.g. `10.0.0.2:4400`
    pub addr: String,
}

impl StaticPeer {
    /// Parse the hex id into peer id bytes
    pub fn id_bytes(&self) -> Result<[u8; 4]> {
        let raw = hex::decode(&self.id)
            .with_context(|| format!("peer id {:?} is not hex", self.id))?;
        raw.try_into()
            .map_err(|_| anyhow::anyhow!("peer id {:?} must be 8 hex digits", self.id))
    }
}

/// A channel joined at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelJoin {
    /// Channel name
    pub name: String,
    /// Channel password
    pub password: String,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Nickname announced to peers
    pub nickname: String,
    /// Listen address for the TCP transport
    pub listen: String,
    /// Path to the identity secret file; created on first run
    pub identity_file: String,
    /// Maximum simultaneous links
    pub max_links: usize,
    /// Radio duty cycle hint, 0.0..=1.0
    pub duty_cycle: f32,
    /// Statically configured peers dialed at startup
    #[serde(default)]
    pub peers: Vec<StaticPeer>,
    /// Channels joined at startup
    #[serde(default)]
    pub channels: Vec<ChannelJoin>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            nickname: "whisper".to_string(),
            listen: "0.0.0.0:4400".to_string(),
            identity_file: "./whisper.key".to_string(),
            max_links: 8,
            duty_cycle: 1.0,
            peers: Vec::new(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    node: Option<NodeFields>,
    #[serde(default)]
    peers: Vec<StaticPeer>,
    #[serde(default)]
    channels: Vec<ChannelJoin>,
}

#[derive(Debug, Deserialize)]
struct NodeFields {
    nickname: Option<String>,
    listen: Option<String>,
    identity_file: Option<String>,
    max_links: Option<usize>,
    duty_cycle: Option<f32>,
}

impl NodeSettings {
    /// Load settings from a YAML file, then apply environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut settings = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {:?}", config_path.as_ref()))?;
                settings.apply_root(root);
                info!("loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!(
                    "config file {:?} not found, using defaults",
                    config_path.as_ref()
                );
            }
        }

        settings.apply_environment_overrides();
        Ok(settings)
    }

    fn apply_root(&mut self, root: RootConfig) {
        if let Some(node) = root.node {
            if let Some(nickname) = node.nickname {
                self.nickname = nickname;
            }
            if let Some(listen) = node.listen {
                self.listen = listen;
            }
            if let Some(identity_file) = node.identity_file {
                self.identity_file = identity_file;
            }
            if let Some(max_links) = node.max_links {
                self.max_links = max_links;
            }
            if let Some(duty_cycle) = node.duty_cycle {
                self.duty_cycle = duty_cycle;
            }
        }
        self.peers = root.peers;
        self.channels = root.channels;
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(nickname) = std::env::var("WHISPER_NICKNAME") {
            info!("nickname overridden by environment: {}", nickname);
            self.nickname = nickname;
        }
        if let Ok(listen) = std::env::var("WHISPER_LISTEN") {
            info!("listen address overridden by environment: {}", listen);
            self.listen = listen;
        }
        if let Ok(identity_file) = std::env::var("WHISPER_IDENTITY_FILE") {
            self.identity_file = identity_file;
        }
        if let Ok(max_links) = std::env::var("WHISPER_MAX_LINKS") {
            match max_links.parse() {
                Ok(value) => self.max_links = value,
                Err(_) => warn!("ignoring non-numeric WHISPER_MAX_LINKS"),
            }
        }
        if let Ok(duty_cycle) = std::env::var("WHISPER_DUTY_CYCLE") {
            match duty_cycle.parse() {
                Ok(value) => self.duty_cycle = value,
                Err(_) => warn!("ignoring non-numeric WHISPER_DUTY_CYCLE"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = NodeSettings::default();
        assert_eq!(settings.nickname, "whisper");
        assert_eq!(settings.listen, "0.0.0.0:4400");
        assert_eq!(settings.max_links, 8);
        assert!(settings.peers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node:
  nickname: anna
  listen: 0.0.0.0:5500
  max_links: 4
  duty_cycle: 0.5

peers:
  - id: aabbccdd
    addr: 10.0.0.2:4400

channels:
  - name: general
    password: hunter2
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let settings = NodeSettings::load_from_file(temp_file.path()).unwrap();

        assert_eq!(settings.nickname, "anna");
        assert_eq!(settings.listen, "0.0.0.0:5500");
        assert_eq!(settings.max_links, 4);
        assert_eq!(settings.duty_cycle, 0.5);
        assert_eq!(settings.peers.len(), 1);
        assert_eq!(settings.peers[0].id_bytes().unwrap(), [0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(settings.channels[0].name, "general");
    }

    #[test]
    fn test_bad_peer_id_rejected() {
        let peer = StaticPeer {
            id: "not-hex".into(),
            addr: "1.2.3.4:5".into(),
        };
        assert!(peer.id_bytes().is_err());
        let short = StaticPeer {
            id: "aabb".into(),
            addr: "1.2.3.4:5".into(),
        };
        assert!(short.id_bytes().is_err());
    }
}
