//! DeploymentStatus: the single outcome record the agent writes on the host.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPorts {
    pub tcp: u16,
    pub udp: u16,
    pub http: u16,
    pub wrapper: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub public_ip: String,
    pub ports: StatusPorts,
    pub wrapper_enabled: bool,
    pub error_messages: Vec<String>,
}

impl DeploymentStatus {
    /// Build a status whose verdict follows from the accumulated errors.
    pub fn from_errors(
        public_ip: impl Into<String>,
        ports: StatusPorts,
        wrapper_enabled: bool,
        error_messages: Vec<String>,
    ) -> Self {
        Self {
            success: error_messages.is_empty(),
            timestamp: Utc::now(),
            public_ip: public_ip.into(),
            ports,
            wrapper_enabled,
            error_messages,
        }
    }

    /// Process exit code matching the verdict.
    pub fn exit_code(&self) -> u8 {
        if self.success {
            0
        } else {
            1
        }
    }

    /// Overwrite the status document at `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| AppError::io(e.to_string()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| AppError::io(e.to_string()))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Convert a failed status into the user-visible error.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(AppError::validation_failed(&self.error_messages))
        }
    }
}
