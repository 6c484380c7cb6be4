//! Post-start validation checks.
//!
//! Required checks return failure messages for the status document. Advisory
//! checks only log.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::cloud::Protocol;

use super::host::Host;
use super::service;

pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const PROCESS_POLL: Duration = Duration::from_secs(2);
pub const PORT_TIMEOUT: Duration = Duration::from_secs(30);
pub const PORT_POLL: Duration = Duration::from_secs(3);
const MAX_SCANNED_LOGS: usize = 5;

/// Poll `check` every `interval` until it yields a value or `timeout` has elapsed.
async fn poll<T, F, Fut>(
    host: &dyn Host,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let mut elapsed = Duration::ZERO;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if elapsed >= timeout {
            return None;
        }
        host.sleep(interval).await;
        elapsed += interval;
    }
}

fn first_pid(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|line| line.trim().parse().ok())
}

async fn find_server_pid(host: &dyn Host, binary: &Path, service_name: &str) -> Option<u32> {
    let full = binary.to_string_lossy();
    if let Ok(out) = host.run("pgrep", &["-f", &full]).await {
        if out.success {
            if let Some(pid) = first_pid(&out.stdout) {
                return Some(pid);
            }
        }
    }

    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Ok(out) = host.run("pgrep", &["-x", &name]).await {
        if out.success {
            if let Some(pid) = first_pid(&out.stdout) {
                return Some(pid);
            }
        }
    }

    // pgrep may be missing on minimal images
    let pid = service::main_pid(host, service_name).await?;
    host.pid_alive(pid).then_some(pid)
}

/// Wait for the server process; `None` means it never appeared within `timeout`.
pub async fn wait_for_process(
    host: &dyn Host,
    binary: &Path,
    service_name: &str,
    timeout: Duration,
    interval: Duration,
) -> Option<u32> {
    poll(host, timeout, interval, || find_server_pid(host, binary, service_name)).await
}

/// Whether a socket listing shows a local address on `port`.
pub fn listening_in(listing: &str, port: u16) -> bool {
    let suffix = format!(":{}", port);
    listing
        .lines()
        .any(|line| line.split_whitespace().any(|col| col.ends_with(&suffix)))
}

/// One look at the listening sockets, `ss` first, `netstat` when `ss` is unavailable.
pub async fn port_listening(host: &dyn Host, protocol: Protocol, port: u16) -> bool {
    let flags = match protocol {
        Protocol::Tcp => "-tlnp",
        Protocol::Udp => "-ulnp",
    };
    for tool in ["ss", "netstat"] {
        match host.run(tool, &[flags]).await {
            Ok(out) if out.success => return listening_in(&out.stdout, port),
            Ok(out) => log::debug!("{} {} failed: {}", tool, flags, out.detail()),
            Err(e) => log::debug!("{} unavailable: {}", tool, e),
        }
    }
    log::warn!("Neither ss nor netstat could list {} sockets", protocol);
    false
}

pub async fn wait_for_port(
    host: &dyn Host,
    protocol: Protocol,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> bool {
    poll(host, timeout, interval, || async move {
        port_listening(host, protocol, port).await.then_some(())
    })
    .await
    .is_some()
}

/// Fatal signatures in server output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogIssue {
    MissingContent,
    PortConflict,
    Crash,
}

impl LogIssue {
    pub const ALL: [Self; 3] = [Self::MissingContent, Self::PortConflict, Self::Crash];

    fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::MissingContent => &[
                "track not found",
                "content not found",
                "missing track",
                "missing car",
                "failed to load",
                "error loading",
            ],
            Self::PortConflict => &["failed to bind", "address already in use"],
            Self::Crash => &["permission denied", "segmentation fault", "core dumped"],
        }
    }

    /// Case-insensitive match of one log line.
    pub fn matches(self, line: &str) -> bool {
        let line = line.to_lowercase();
        if self.patterns().iter().any(|p| line.contains(p)) {
            return true;
        }
        // "port ... in use"
        self == Self::PortConflict
            && line
                .find("port")
                .is_some_and(|at| line[at + 4..].contains("in use"))
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::MissingContent => "Missing content detected in server logs",
            Self::PortConflict => "Port binding errors detected in server logs",
            Self::Crash => "Critical errors detected in server logs",
        }
    }
}

/// Issue categories present in `content`, each with up to three sample lines.
pub fn scan_log(content: &str) -> Vec<(LogIssue, Vec<String>)> {
    LogIssue::ALL
        .into_iter()
        .filter_map(|issue| {
            let hits: Vec<&str> = content.lines().filter(|l| issue.matches(l)).collect();
            if hits.is_empty() {
                return None;
            }
            let samples = hits[hits.len().saturating_sub(3)..]
                .iter()
                .map(|l| l.trim().to_string())
                .collect();
            Some((issue, samples))
        })
        .collect()
}

/// Server logs to scan: the service's own logs plus a few `.log`/`.txt` files
/// the server wrote under `root`.
pub fn log_files(root: &Path, service_logs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = service_logs
        .iter()
        .filter(|p| p.is_file())
        .cloned()
        .collect();
    files.extend(
        WalkDir::new(root)
            .max_depth(4)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == "log" || ext == "txt")
            })
            .map(|e| e.into_path())
            .take(MAX_SCANNED_LOGS),
    );
    files
}

/// Scan every file and return one failure per category per file.
pub fn scan_logs(files: &[PathBuf]) -> Vec<String> {
    let mut errors = Vec::new();
    if files.is_empty() {
        log::warn!("No server log files found yet");
        return errors;
    }
    for file in files {
        let content = match fs::read(file) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                log::warn!("Cannot read {}: {}", file.display(), e);
                continue;
            }
        };
        log::info!("Checking log {}", file.display());
        for (issue, samples) in scan_log(&content) {
            for line in &samples {
                log::error!("  {}", line);
            }
            errors.push(format!("{} ({})", issue.description(), file.display()));
        }
    }
    errors
}

/// Log the binary's shared library resolution; unresolved libraries are warnings.
pub async fn list_libraries(host: &dyn Host, binary: &Path) {
    let path = binary.to_string_lossy();
    match host.run("ldd", &[&path]).await {
        Ok(out) => {
            for line in out.stdout.lines() {
                if line.contains("not found") {
                    log::warn!("Unresolved library: {}", line.trim());
                } else {
                    log::debug!("{}", line.trim());
                }
            }
            if !out.success {
                log::warn!("ldd check had issues: {}", out.detail());
            }
        }
        Err(e) => log::warn!("ldd unavailable: {}", e),
    }
}

/// Probe `url` and log the outcome; never fails the run.
pub async fn probe_advisory(host: &dyn Host, label: &str, url: &str) -> bool {
    match host.http_status(url).await {
        Ok(code) if (200..400).contains(&code) => {
            log::info!("{} is responding ({})", label, code);
            true
        }
        Ok(code) => {
            log::warn!("{} answered HTTP {}", label, code);
            false
        }
        Err(e) => {
            log::warn!("{} not reachable: {}", label, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_OUTPUT: &str = "\
State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process
LISTEN 0      128          0.0.0.0:9600      0.0.0.0:*     users:((\"acServer\",pid=812,fd=7))
LISTEN 0      128             [::]:8081         [::]:*     users:((\"acServer\",pid=812,fd=9))
";

    #[test]
    fn finds_ports_in_socket_listing() {
        assert!(listening_in(SS_OUTPUT, 9600));
        assert!(listening_in(SS_OUTPUT, 8081));
        assert!(!listening_in(SS_OUTPUT, 960));
        assert!(!listening_in(SS_OUTPUT, 8082));
    }

    #[test]
    fn netstat_layout_is_understood() {
        let netstat = "udp        0      0 0.0.0.0:9600            0.0.0.0:*                           812/acServer\n";
        assert!(listening_in(netstat, 9600));
    }

    #[test]
    fn log_categories() {
        let log = "\
[INFO] starting
[ERR] Track not found: ks_monza
[ERR] bind: Address already in use
[WARN] UDP port 9600 is already in use
";
        let found: Vec<LogIssue> = scan_log(log).into_iter().map(|(i, _)| i).collect();
        assert_eq!(found, vec![LogIssue::MissingContent, LogIssue::PortConflict]);

        let (_, samples) = &scan_log(log)[1];
        assert_eq!(samples.len(), 2);
        assert!(scan_log("all good\nlap completed").is_empty());
        assert!(LogIssue::Crash.matches("Segmentation fault (core dumped)"));
    }

    #[test]
    fn log_files_include_service_logs_and_pack_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("server/logs")).unwrap();
        fs::write(dir.path().join("server/logs/output.log"), "ok").unwrap();
        fs::write(dir.path().join("server/acServer"), "bin").unwrap();
        let stdout = dir.path().join("stdout.log");
        fs::write(&stdout, "Failed to load car ks_mazda").unwrap();

        let files = log_files(
            &dir.path().join("server"),
            &[stdout.clone(), dir.path().join("missing.log")],
        );
        assert_eq!(files[0], stdout);
        assert_eq!(files.len(), 2);

        let errors = scan_logs(&files);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Missing content detected"));
    }
}
