//! On-host deployment agent.
//!
//! Runs once on first boot: installs dependencies, fetches and unpacks the pack,
//! installs the server as a service, validates it and writes the DeploymentStatus
//! document. Every stage before validation is fail-fast. Validation runs every
//! check and reports all failures together.

mod binary;
mod checks;
mod download;
mod host;
mod service;
mod wrapper;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive;
use crate::cloud::Protocol;
use crate::error::{AppError, Result};
use crate::keyvalue::KeyValues;
use crate::paths::{
    HOST_INSTALL_DIR, HOST_SERVICE_NAME, HOST_STATUS_PATH, HOST_STDERR_LOG, HOST_STDOUT_LOG,
    HOST_SYSTEMD_DIR, HOST_WRAPPER_SERVICE_NAME,
};
use crate::retry::RetryPolicy;
use crate::status::{DeploymentStatus, StatusPorts};

pub use binary::{locate_server, verify_host_executable, verify_native, BinaryFormat};
pub use checks::{LogIssue, PORT_POLL, PORT_TIMEOUT, PROCESS_POLL, PROCESS_TIMEOUT};
pub use host::{CommandOutput, Host, SystemHost};
pub use wrapper::{normalize_content, normalize_path};

/// Packages the server and the checks rely on.
pub const DEPENDENCIES: [&str; 8] = [
    "tar",
    "unzip",
    "file",
    "iproute2",
    "net-tools",
    "procps",
    "lib32gcc-s1",
    "lib32stdc++6",
];

const PACK_FILE: &str = "server-pack.archive";
const SERVER_DIR: &str = "server";
const PRESET_DIR: &str = "preset";
/// Grace period between starting the service and the first check.
pub const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// Agent settings, read from the env file the boot script writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub pack_url: String,
    pub pack_name: String,
    pub install_dir: PathBuf,
    pub status_path: PathBuf,
    pub systemd_dir: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub ports: StatusPorts,
    pub wrapper_enabled: bool,
    pub download: RetryPolicy,
    pub process_timeout: Duration,
    pub port_timeout: Duration,
}

impl AgentSettings {
    pub fn from_env_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| AppError::io(e.to_string()))?;
        let kv = KeyValues::parse(&content);
        for line in kv.malformed() {
            log::warn!("Ignoring malformed setting {}", line);
        }
        Self::from_keyvalues(&kv)
    }

    pub fn from_keyvalues(kv: &KeyValues) -> Result<Self> {
        let path_or = |key: &str, default: &str| {
            PathBuf::from(kv.get(key).unwrap_or(default))
        };

        Ok(Self {
            pack_url: kv.require("PACK_URL")?.to_string(),
            pack_name: kv.get("PACK_NAME").unwrap_or(PACK_FILE).to_string(),
            install_dir: path_or("INSTALL_DIR", HOST_INSTALL_DIR),
            status_path: path_or("STATUS_PATH", HOST_STATUS_PATH),
            systemd_dir: path_or("SYSTEMD_DIR", HOST_SYSTEMD_DIR),
            stdout_log: path_or("STDOUT_LOG", HOST_STDOUT_LOG),
            stderr_log: path_or("STDERR_LOG", HOST_STDERR_LOG),
            ports: StatusPorts {
                tcp: kv.parse_or("TCP_PORT", crate::config::GAME_TCP_PORT)?,
                udp: kv.parse_or("UDP_PORT", crate::config::GAME_UDP_PORT)?,
                http: kv.parse_or("HTTP_PORT", crate::config::HTTP_PORT)?,
                wrapper: kv.parse_or("WRAPPER_PORT", crate::config::DEFAULT_WRAPPER_PORT)?,
            },
            wrapper_enabled: kv.flag("WRAPPER_ENABLED", false)?,
            download: RetryPolicy {
                attempts: kv.parse_or("DOWNLOAD_ATTEMPTS", RetryPolicy::DOWNLOAD.attempts)?,
                initial_delay: Duration::from_secs(kv.parse_or(
                    "DOWNLOAD_DELAY_SECS",
                    RetryPolicy::DOWNLOAD.initial_delay.as_secs(),
                )?),
            },
            process_timeout: Duration::from_secs(
                kv.parse_or("PROCESS_TIMEOUT_SECS", PROCESS_TIMEOUT.as_secs())?,
            ),
            port_timeout: Duration::from_secs(
                kv.parse_or("PORT_TIMEOUT_SECS", PORT_TIMEOUT.as_secs())?,
            ),
        })
    }

    fn server_root(&self) -> PathBuf {
        self.install_dir.join(SERVER_DIR)
    }
}

/// Agent state machine stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    InstallDeps,
    DownloadPack,
    Extract,
    LocateBinary,
    VerifyBinary,
    InstallService,
    StartService,
    Validate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::InstallDeps => "INSTALL_DEPS",
            Self::DownloadPack => "DOWNLOAD_PACK",
            Self::Extract => "EXTRACT",
            Self::LocateBinary => "LOCATE_BINARY",
            Self::VerifyBinary => "VERIFY_BINARY",
            Self::InstallService => "INSTALL_SERVICE",
            Self::StartService => "START_SERVICE",
            Self::Validate => "VALIDATE",
        };
        f.write_str(name)
    }
}

/// A fatal stage failure.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: AppError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

fn enter(stage: Stage) -> impl Fn(AppError) -> StageFailure {
    log::info!("==> {}", stage);
    move |error| StageFailure { stage, error }
}

/// What the installation left for validation.
struct Installed {
    binary: PathBuf,
    wrapper_running: bool,
}

/// Run the whole state machine and write the status document.
pub async fn run(host: &dyn Host, settings: &AgentSettings) -> DeploymentStatus {
    log::info!("==> {}", Stage::Start);

    let outcome = install(host, settings).await;
    let public_ip = host
        .public_ip()
        .await
        .unwrap_or_else(|| "unknown".to_string());
    log::info!("Public IP: {}", public_ip);

    let (errors, wrapper_running) = match outcome {
        Ok(installed) => {
            log::info!("==> {}", Stage::Validate);
            host.sleep(STARTUP_GRACE).await;
            let errors = validate(host, settings, &installed, &public_ip).await;
            (errors, installed.wrapper_running)
        }
        Err(failure) => {
            log::error!("{}", failure);
            (vec![failure.to_string()], false)
        }
    };

    let status =
        DeploymentStatus::from_errors(public_ip, settings.ports, wrapper_running, errors);

    if status.success {
        log::info!("===== VALIDATION PASSED =====");
        log::info!(
            "Server is reachable at {}:{}",
            status.public_ip,
            settings.ports.tcp
        );
    } else {
        log::error!("===== DEPLOYMENT FAILED =====");
        for message in &status.error_messages {
            log::error!("  {}", message);
        }
    }

    if let Err(e) = status.write_to(&settings.status_path) {
        log::error!(
            "Failed to write status {}: {}",
            settings.status_path.display(),
            e
        );
    }
    status
}

async fn install(
    host: &dyn Host,
    settings: &AgentSettings,
) -> std::result::Result<Installed, StageFailure> {
    let fail = enter(Stage::InstallDeps);
    install_dependencies(host).await.map_err(&fail)?;

    let fail = enter(Stage::DownloadPack);
    fs::create_dir_all(&settings.install_dir)
        .map_err(|e| fail(AppError::io(e.to_string())))?;
    let pack_file = settings.install_dir.join(PACK_FILE);
    log::info!("Fetching {}", settings.pack_name);
    download::fetch_with_retry(host, &settings.pack_url, &pack_file, settings.download)
        .await
        .map_err(&fail)?;

    let fail = enter(Stage::Extract);
    let root = settings.server_root();
    archive::extract_archive(&pack_file, &root).map_err(|e| {
        fail(AppError::io(format!(
            "failed to extract server pack, file may be corrupted: {}",
            e
        )))
    })?;

    let fail = enter(Stage::LocateBinary);
    let binary = binary::locate_server(&root)
        .ok_or_else(|| fail(AppError::resource_not_found("binary", binary::SERVER_BINARY_NAME)))?;
    log::info!("Found server binary at {}", binary.display());

    // No retry past this point: a foreign binary will never start.
    let fail = enter(Stage::VerifyBinary);
    binary::verify_native(&binary).map_err(&fail)?;
    binary::make_executable(&binary).map_err(&fail)?;
    checks::list_libraries(host, &binary).await;

    let fail = enter(Stage::InstallService);
    let working_dir = binary
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.clone());
    let unit = service::ServiceUnit {
        name: HOST_SERVICE_NAME.to_string(),
        description: "Assetto Corsa Server".to_string(),
        working_dir: working_dir.clone(),
        command: vec![binary.display().to_string()],
        stdout_log: settings.stdout_log.clone(),
        stderr_log: settings.stderr_log.clone(),
        requires: None,
    };
    unit.install(&settings.systemd_dir).map_err(&fail)?;

    let fail = enter(Stage::StartService);
    service::enable_and_start(host, HOST_SERVICE_NAME, false)
        .await
        .map_err(&fail)?;

    let wrapper_running = if settings.wrapper_enabled {
        start_wrapper(host, settings, &working_dir, &root).await
    } else {
        log::info!("Wrapper disabled");
        false
    };

    Ok(Installed {
        binary,
        wrapper_running,
    })
}

async fn install_dependencies(host: &dyn Host) -> Result<()> {
    let update = host.run("apt-get", &["update", "-qq"]).await?;
    if !update.success {
        log::warn!("apt-get update failed: {}", update.detail());
    }

    let mut args = vec!["install", "-y", "-qq"];
    args.extend(DEPENDENCIES);
    let output = host.run("apt-get", &args).await?;
    if !output.success {
        return Err(AppError::process(format!(
            "dependency install failed: {}",
            output.detail()
        )));
    }
    Ok(())
}

/// Install and start the wrapper. Failures are warnings; returns whether it was started.
async fn start_wrapper(
    host: &dyn Host,
    settings: &AgentSettings,
    working_dir: &Path,
    root: &Path,
) -> bool {
    let Some(wrapper_bin) = binary::locate_wrapper(working_dir) else {
        log::info!("acServerWrapper not found, skipping wrapper setup");
        return false;
    };
    log::info!("Found wrapper at {}", wrapper_bin.display());

    let preset = settings.install_dir.join(PRESET_DIR);
    let result = async {
        wrapper::prepare_preset(&preset, working_dir, root, settings.ports.wrapper)?;
        binary::make_executable(&wrapper_bin)?;
        let log_dir = settings
            .stdout_log
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| settings.install_dir.clone());
        service::ServiceUnit {
            name: HOST_WRAPPER_SERVICE_NAME.to_string(),
            description: "AC Server Wrapper (Content Manager file server)".to_string(),
            working_dir: preset.clone(),
            command: vec![
                wrapper_bin.display().to_string(),
                preset.display().to_string(),
            ],
            stdout_log: log_dir.join("acserver-wrapper-stdout.log"),
            stderr_log: log_dir.join("acserver-wrapper-stderr.log"),
            requires: Some(HOST_SERVICE_NAME.to_string()),
        }
        .install(&settings.systemd_dir)?;
        service::enable_and_start(host, HOST_WRAPPER_SERVICE_NAME, true).await
    }
    .await;

    match result {
        Ok(()) => {
            log::info!("Wrapper service started, preset {}", preset.display());
            true
        }
        Err(e) => {
            log::warn!("Wrapper setup failed: {}", e);
            false
        }
    }
}

/// Run every check; the returned list holds all failures.
async fn validate(
    host: &dyn Host,
    settings: &AgentSettings,
    installed: &Installed,
    public_ip: &str,
) -> Vec<String> {
    let mut errors = Vec::new();

    match checks::wait_for_process(
        host,
        &installed.binary,
        HOST_SERVICE_NAME,
        settings.process_timeout,
        PROCESS_POLL,
    )
    .await
    {
        Some(pid) => log::info!("Server process is running (PID {})", pid),
        None => {
            let message = format!(
                "acServer process is not running after {}s",
                settings.process_timeout.as_secs()
            );
            log::error!("{}", message);
            errors.push(message);
        }
    }

    let ports = settings.ports;
    for (protocol, port, role) in [
        (Protocol::Tcp, ports.tcp, "game"),
        (Protocol::Udp, ports.udp, "game"),
        (Protocol::Tcp, ports.http, "HTTP"),
    ] {
        let label = format!("{} port {} ({})", protocol.as_str().to_uppercase(), port, role);
        if checks::wait_for_port(host, protocol, port, settings.port_timeout, PORT_POLL).await {
            log::info!("{} is listening", label);
        } else {
            log::error!("{} is not listening", label);
            errors.push(format!("{} is not listening", label));
        }
    }

    let logs = checks::log_files(
        &settings.server_root(),
        &[settings.stdout_log.clone(), settings.stderr_log.clone()],
    );
    errors.extend(checks::scan_logs(&logs));

    advisory(host, settings, installed, public_ip).await;
    errors
}

async fn advisory(
    host: &dyn Host,
    settings: &AgentSettings,
    installed: &Installed,
    public_ip: &str,
) {
    let http = settings.ports.http;
    checks::probe_advisory(host, "HTTP endpoint", &format!("http://127.0.0.1:{}/", http)).await;

    let join = format!(
        "https://acstuff.ru/s/q:race/online/join?ip={}&httpPort={}",
        public_ip, http
    );
    log::info!("acstuff join link: {}", join);
    checks::probe_advisory(host, "acstuff join link", &join).await;

    if installed.wrapper_running {
        if checks::port_listening(host, Protocol::Tcp, settings.ports.wrapper).await {
            log::info!("Wrapper is listening on {}", settings.ports.wrapper);
        } else {
            log::warn!(
                "Wrapper port {} not listening yet (it may still be starting)",
                settings.ports.wrapper
            );
        }
    }
}
