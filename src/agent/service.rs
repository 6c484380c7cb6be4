//! systemd units for the server and the wrapper.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::host::Host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub name: String,
    pub description: String,
    pub working_dir: PathBuf,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// Units this one is bound to, e.g. the wrapper requires the server.
    pub requires: Option<String>,
}

/// Quote one `ExecStart` word so spaces, quotes, specifiers and variables stay literal.
fn quote_exec_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '%' => quoted.push_str("%%"),
            '$' => quoted.push_str("$$"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

impl ServiceUnit {
    pub fn exec_start(&self) -> String {
        self.command
            .iter()
            .map(|arg| quote_exec_arg(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn render(&self) -> String {
        let mut after = "network.target".to_string();
        let mut requires = String::new();
        if let Some(dep) = &self.requires {
            after.push_str(&format!(" {}.service", dep));
            requires = format!("Requires={}.service\n", dep);
        }

        format!(
            "[Unit]
Description={description}
After={after}
{requires}
[Service]
Type=simple
User=root
WorkingDirectory={working_dir}
ExecStart={exec_start}
Restart=on-failure
RestartSec=10
StandardOutput=append:{stdout}
StandardError=append:{stderr}

[Install]
WantedBy=multi-user.target
",
            description = self.description,
            after = after,
            requires = requires,
            working_dir = self.working_dir.display(),
            exec_start = self.exec_start(),
            stdout = self.stdout_log.display(),
            stderr = self.stderr_log.display(),
        )
    }

    /// Write the unit file into `unit_dir`.
    pub fn install(&self, unit_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(unit_dir).map_err(|e| AppError::io(e.to_string()))?;
        let path = unit_dir.join(format!("{}.service", self.name));
        fs::write(&path, self.render()).map_err(|e| AppError::io(e.to_string()))?;
        log::info!("Wrote unit {}", path.display());
        Ok(path)
    }
}

async fn systemctl(host: &dyn Host, args: &[&str]) -> Result<()> {
    let output = host.run("systemctl", args).await?;
    if !output.success {
        return Err(AppError::process(format!(
            "systemctl {} failed: {}",
            args.join(" "),
            output.detail()
        )));
    }
    Ok(())
}

/// Reload units, enable `name` and start it.
///
/// With `no_block` the start request is queued and this returns immediately.
pub async fn enable_and_start(host: &dyn Host, name: &str, no_block: bool) -> Result<()> {
    systemctl(host, &["daemon-reload"]).await?;
    systemctl(host, &["enable", name]).await?;
    if no_block {
        systemctl(host, &["start", "--no-block", name]).await
    } else {
        systemctl(host, &["start", name]).await
    }
}

/// Main PID systemd reports for `name`; `None` while the unit is not running.
pub async fn main_pid(host: &dyn Host, name: &str) -> Option<u32> {
    let output = host
        .run("systemctl", &["show", "-p", "MainPID", "--value", name])
        .await
        .ok()?;
    if !output.success {
        return None;
    }
    output
        .stdout
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0)
}
