//! Centralized path utilities, for both the operator machine and the provisioned host.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Install directory on the provisioned host.
pub const HOST_INSTALL_DIR: &str = "/opt/acserver";
/// DeploymentStatus document written by the agent.
pub const HOST_STATUS_PATH: &str = "/opt/acserver/deploy-status.json";
/// Settings handed from the boot script to the agent.
pub const HOST_AGENT_ENV_PATH: &str = "/opt/acserver/agent.env";
/// Agent binary location on the host.
pub const HOST_AGENT_PATH: &str = "/opt/acserver/acserver-agent";
/// Installer log, shared by the boot script and the agent.
pub const HOST_DEPLOY_LOG: &str = "/var/log/acserver-deploy.log";
pub const HOST_STDOUT_LOG: &str = "/var/log/acserver-stdout.log";
pub const HOST_STDERR_LOG: &str = "/var/log/acserver-stderr.log";
pub const HOST_SERVICE_NAME: &str = "acserver";
pub const HOST_WRAPPER_SERVICE_NAME: &str = "acserver-wrapper";
pub const HOST_SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Name of the agent binary, next to the operator binary by default.
pub const AGENT_BINARY_NAME: &str = "acserver-agent";

/// Object storage key prefixes.
pub const PACKS_PREFIX: &str = "packs/";
pub const BOOTSTRAP_PREFIX: &str = "bootstrap/";
pub const TOOLS_PREFIX: &str = "tools/";

/// Get the root data directory for the operator (~/.acserver_manager).
///
/// Falls back to the working directory when no home directory is known.
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".acserver_manager")
}

/// Get the path to the config file.
pub fn config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Default agent binary: a sibling of the running executable.
pub fn default_agent_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(|e| AppError::io(e.to_string()))?;
    let dir = exe
        .parent()
        .ok_or_else(|| AppError::io("executable has no parent directory"))?;
    Ok(dir.join(AGENT_BINARY_NAME))
}

/// Storage key of an uploaded pack.
pub fn pack_key(pack: &Path) -> Result<String> {
    let name = pack
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::config(format!("invalid pack path {}", pack.display())))?;
    Ok(format!("{}{}", PACKS_PREFIX, name))
}

/// Storage key of the uploaded agent.
pub fn agent_key() -> String {
    format!("{}{}", TOOLS_PREFIX, AGENT_BINARY_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_key_uses_file_name_only() {
        let key = pack_key(Path::new("/home/op/exports/monza-pack.tar.gz")).unwrap();
        assert_eq!(key, "packs/monza-pack.tar.gz");
    }
}
