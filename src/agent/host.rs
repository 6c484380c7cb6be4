//! The agent's view of the machine it runs on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{AppError, Result};

const METADATA_BASE: &str = "http://169.254.169.254/latest";
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest silence tolerated between body chunks.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr if it says anything, otherwise stdout.
    pub fn detail(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Side effects the agent needs from the host.
#[async_trait]
pub trait Host: Send + Sync {
    /// Run a program to completion. `Err` only when it could not be started.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Stream `url` into `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;

    /// Status code of a GET to `url`.
    async fn http_status(&self, url: &str) -> Result<u16>;

    /// Public address from instance metadata.
    async fn public_ip(&self) -> Option<String>;

    fn pid_alive(&self, pid: u32) -> bool;

    async fn sleep(&self, duration: Duration);
}

/// The real machine.
pub struct SystemHost {
    client: Client,
}

impl SystemHost {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(READ_TIMEOUT)
            .user_agent(concat!("acserver-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn metadata_token(&self) -> Option<String> {
        let resp = self
            .client
            .put(format!("{}/api/token", METADATA_BASE))
            .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok()
    }

    async fn metadata_get(&self, path: &str, token: Option<&str>) -> Option<String> {
        let mut req = self
            .client
            .get(format!("{}/meta-data/{}", METADATA_BASE, path))
            .timeout(METADATA_TIMEOUT);
        if let Some(token) = token {
            req = req.header("X-aws-ec2-metadata-token", token);
        }
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body = resp.text().await.ok()?;
        let body = body.trim();
        (!body.is_empty()).then(|| body.to_string())
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| AppError::process(format!("Failed to run {}: {}", program, e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        super::download::download_file(&self.client, url, dest).await
    }

    async fn http_status(&self, url: &str) -> Result<u16> {
        let resp = self
            .client
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AppError::network_with_url(url, e.to_string()))?;
        Ok(resp.status().as_u16())
    }

    async fn public_ip(&self) -> Option<String> {
        if let Some(token) = self.metadata_token().await {
            if let Some(ip) = self.metadata_get("public-ipv4", Some(token.trim())).await {
                return Some(ip);
            }
        }
        self.metadata_get("public-ipv4", None).await
    }

    #[cfg(unix)]
    fn pid_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    fn pid_alive(&self, _pid: u32) -> bool {
        false
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_prefers_stderr() {
        let out = CommandOutput {
            success: false,
            stdout: "some output\n".to_string(),
            stderr: "  \n".to_string(),
        };
        assert_eq!(out.detail(), "some output");

        let out = CommandOutput {
            stderr: "unit not found".to_string(),
            ..out
        };
        assert_eq!(out.detail(), "unit not found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_host_runs_commands_and_sees_itself() {
        let host = SystemHost::new().unwrap();
        let out = host.run("sh", &["-c", "echo hi; exit 3"]).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout.trim(), "hi");
        assert!(host.pid_alive(std::process::id()));
        assert!(host.run("definitely-not-a-program-xyz", &[]).await.is_err());
    }
}
