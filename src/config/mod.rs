//! Agent configuration: STUN/TURN servers and TURN credentials.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::stun::DEFAULT_STUN_SERVER;

/// ICE agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN servers as `host:port` or `stun:host:port`, tried in order
    pub stun_servers: Vec<String>,
    /// TURN servers as `host:port` or `turn:host:port?transport=udp`
    pub turn_servers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_username: Option<String>,
    /// TURN password (long-term credential)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_credential: Option<String>,
    /// Local port for the host candidate; 0 picks an ephemeral port
    pub host_port: u16,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: Vec::new(),
            turn_username: None,
            turn_credential: None,
            host_port: 0,
        }
    }
}

impl IceConfig {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "icelink", "icelink")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the platform config directory, falling back to
    /// defaults when no file exists yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }

    /// Parse an inline TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Write the configuration to `path`, creating its directory if needed.
    /// Pass [`IceConfig::config_path`] for the platform location.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // The file may hold a TURN credential
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// TURN is only attempted when both username and credential are set.
    pub fn turn_credentials(&self) -> Option<(&str, &str)> {
        match (&self.turn_username, &self.turn_credential) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn has_turn_credentials(&self) -> bool {
        self.turn_credentials().is_some()
    }
}
