use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::config_path;

/// Game client TCP port.
pub const GAME_TCP_PORT: u16 = 9600;
/// Game client UDP port.
pub const GAME_UDP_PORT: u16 = 9600;
/// Server HTTP (lobby/info) port.
pub const HTTP_PORT: u16 = 8081;
/// Administrative (SSH) port.
pub const ADMIN_PORT: u16 = 22;
/// Default content wrapper port, used when the pack does not embed one.
pub const DEFAULT_WRAPPER_PORT: u16 = 8082;

/// Load the configuration file, falling back to defaults when it does not exist.
///
/// `path` overrides the default location under the data directory.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    if !path.exists() {
        log::debug!("No config file at {:?}, using defaults", path);
        return Ok(ServerConfig::default());
    }
    let content = fs::read_to_string(&path)
        .map_err(|e| AppError::config(format!("failed to read {}: {}", path.display(), e)))?;
    let config: ServerConfig = toml::from_str(&content)?;
    config.check()?;
    Ok(config)
}

/// How the server is installed on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallStrategy {
    /// Run the pack's own server binary under a service, validated by the agent.
    Native,
    /// Run the AssettoServer container image against the pack's content.
    Container {
        #[serde(default = "default_container_version")]
        version: String,
    },
}

impl Default for InstallStrategy {
    fn default() -> Self {
        Self::Native
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_security_group_name")]
    pub security_group_name: String,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub key_name: Option<String>,
    /// Existing instance profile (name or ARN); takes precedence over `create_iam`.
    #[serde(default)]
    pub iam_instance_profile: Option<String>,
    #[serde(default)]
    pub create_iam: bool,
    #[serde(default = "default_iam_role_name")]
    pub iam_role_name: String,
    #[serde(default = "default_iam_instance_profile_name")]
    pub iam_instance_profile_name: String,
    #[serde(default = "default_true")]
    pub enable_wrapper: bool,
    #[serde(default = "default_wrapper_port")]
    pub wrapper_port: u16,
    #[serde(default)]
    pub install_strategy: InstallStrategy,
    /// Agent binary uploaded for the native strategy.
    #[serde(default)]
    pub agent_binary: Option<PathBuf>,
    #[serde(default = "default_image_name_pattern")]
    pub image_name_pattern: String,
    #[serde(default = "default_image_owner")]
    pub image_owner: String,
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_instance_type() -> String {
    "t3.small".to_string()
}

fn default_bucket() -> String {
    "ac-server-packs".to_string()
}

fn default_security_group_name() -> String {
    "ac-server-sg".to_string()
}

fn default_instance_name() -> String {
    "ac-server-instance".to_string()
}

fn default_iam_role_name() -> String {
    "ac-server-role".to_string()
}

fn default_iam_instance_profile_name() -> String {
    "ac-server-instance-profile".to_string()
}

fn default_wrapper_port() -> u16 {
    DEFAULT_WRAPPER_PORT
}

pub fn default_container_version() -> String {
    "v0.0.54".to_string()
}

fn default_image_name_pattern() -> String {
    "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*".to_string()
}

fn default_image_owner() -> String {
    // Canonical
    "099720109477".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            instance_type: default_instance_type(),
            bucket: default_bucket(),
            security_group_name: default_security_group_name(),
            instance_name: default_instance_name(),
            key_name: None,
            iam_instance_profile: None,
            create_iam: false,
            iam_role_name: default_iam_role_name(),
            iam_instance_profile_name: default_iam_instance_profile_name(),
            enable_wrapper: true,
            wrapper_port: DEFAULT_WRAPPER_PORT,
            install_strategy: InstallStrategy::Native,
            agent_binary: None,
            image_name_pattern: default_image_name_pattern(),
            image_owner: default_image_owner(),
        }
    }
}

impl ServerConfig {
    /// Reject settings that can never produce a working deployment.
    pub fn check(&self) -> Result<()> {
        if self.enable_wrapper {
            crate::validation::validate_wrapper_port(self.wrapper_port)?;
        } else if self.wrapper_port == 0 {
            return Err(AppError::config("wrapper port must be non-zero"));
        }
        crate::validation::validate_bucket_name(&self.bucket)?;
        if let InstallStrategy::Container { version } = &self.install_strategy {
            crate::validation::validate_image_tag(version)?;
        }
        Ok(())
    }

    /// Instance profile to attach when no explicit profile is set and `create_iam` is on.
    pub fn wants_managed_identity(&self) -> bool {
        self.iam_instance_profile.is_none() && self.create_iam
    }
}
