use crate::{Result, ZmigrateError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZmigrateConfig {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub zfs: ZfsConfig,
    #[serde(default)]
    pub virsh: VirshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// ssh client binary, used for control channels and the transfer data plane
    #[serde(default = "default_ssh_program")]
    pub program: String,
    /// Extra options passed before the host on every invocation
    #[serde(default = "default_ssh_options")]
    pub options: Vec<String>,
    /// Directory for control master sockets. Defaults to the system temp dir.
    #[serde(default)]
    pub control_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsConfig {
    #[serde(default = "default_zfs_program")]
    pub program: String,
    /// Label prefix for snapshots taken before each transfer
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirshConfig {
    #[serde(default = "default_virsh_program")]
    pub program: String,
    /// Connection URI used on both ends for local control commands
    #[serde(default = "default_virsh_uri")]
    pub uri: String,
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_ssh_options() -> Vec<String> {
    vec!["-o".to_string(), "BatchMode=yes".to_string()]
}

fn default_zfs_program() -> String {
    "zfs".to_string()
}

fn default_snapshot_prefix() -> String {
    "zmigrate".to_string()
}

fn default_virsh_program() -> String {
    "virsh".to_string()
}

fn default_virsh_uri() -> String {
    "qemu:///system".to_string()
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            options: default_ssh_options(),
            control_dir: None,
        }
    }
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            program: default_zfs_program(),
            snapshot_prefix: default_snapshot_prefix(),
        }
    }
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            program: default_virsh_program(),
            uri: default_virsh_uri(),
        }
    }
}

impl SshConfig {
    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl ZmigrateConfig {
    /// `$XDG_CONFIG_HOME/zmigrate/config.toml` or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("zmigrate").join("config.toml"))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ZmigrateConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ZmigrateError::ConfigError(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let prefix = &self.zfs.snapshot_prefix;
        if prefix.is_empty() {
            return Err(ZmigrateError::ConfigError(
                "zfs.snapshot_prefix must not be empty".to_string(),
            ));
        }
        if prefix.contains(['@', '/', ' ', '\t']) {
            return Err(ZmigrateError::ConfigError(format!(
                "zfs.snapshot_prefix '{}' contains characters not allowed in a snapshot label",
                prefix
            )));
        }
        Ok(())
    }
}
