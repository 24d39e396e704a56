//! Agent configuration file
//!
//! Optional `agent.toml` inside the agent root; command-line flags override
//! whatever is set here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uvnet_common::Result;

/// Persistent agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// PID file location
    pub pid_file: Option<PathBuf>,

    /// UDP port of the control-plane transport
    pub transport_port: u16,

    /// Bring up kernel tunnels, iptables and the router daemon config
    pub enable_net: bool,

    /// Start even if some allowed LANs were not detected locally
    pub allow_invalid_lans: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            transport_port: crate::agent::TRANSPORT_PORT,
            enable_net: true,
            allow_invalid_lans: false,
        }
    }
}

/// Configuration file name inside the agent root
pub const CONFIG_FILENAME: &str = "agent.toml";

impl AgentConfig {
    /// Load configuration from a file, or fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| uvnet_common::Error::InvalidConfig(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the configuration of an agent root
    pub fn load_root(root: &Path) -> Result<Self> {
        Self::load(&root.join(CONFIG_FILENAME))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| uvnet_common::Error::Internal(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);

        let missing = AgentConfig::load(&path).unwrap();
        assert!(missing.enable_net);
        assert_eq!(missing.transport_port, crate::agent::TRANSPORT_PORT);

        let config = AgentConfig {
            pid_file: Some("/run/uvnet/agent.pid".into()),
            transport_port: 51999,
            enable_net: false,
            allow_invalid_lans: true,
        };
        config.save(&path).unwrap();
        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.transport_port, 51999);
        assert!(!loaded.enable_net);
        assert!(loaded.allow_invalid_lans);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "transport_port = \"not a port\"").unwrap();
        assert!(matches!(
            AgentConfig::load(&path),
            Err(uvnet_common::Error::InvalidConfig(_))
        ));
    }
}
