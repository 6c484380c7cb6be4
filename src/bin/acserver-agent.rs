//! First-boot agent: installs the server from the pack, validates it, and
//! writes the deployment status document.
//!
//! Started by the boot script with the env file it wrote. Exit code 0 means the
//! deployment validated, 1 means it did not.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use acserver_manager_lib::agent::{self, AgentSettings, SystemHost};
use acserver_manager_lib::config::{
    DEFAULT_WRAPPER_PORT, GAME_TCP_PORT, GAME_UDP_PORT, HTTP_PORT,
};
use acserver_manager_lib::init_logging;
use acserver_manager_lib::paths::{HOST_AGENT_ENV_PATH, HOST_STATUS_PATH};
use acserver_manager_lib::status::{DeploymentStatus, StatusPorts};

#[derive(Parser, Debug)]
#[command(name = "acserver-agent", version)]
#[command(about = "Install and validate the server on this host")]
struct Args {
    /// Settings written by the boot script
    #[arg(long, default_value = HOST_AGENT_ENV_PATH)]
    env: PathBuf,
}

/// Record a failure that happened before settings were available.
fn write_early_failure(message: String) {
    let ports = StatusPorts {
        tcp: GAME_TCP_PORT,
        udp: GAME_UDP_PORT,
        http: HTTP_PORT,
        wrapper: DEFAULT_WRAPPER_PORT,
    };
    let status = DeploymentStatus::from_errors("unknown", ports, false, vec![message]);
    if let Err(e) = status.write_to(Path::new(HOST_STATUS_PATH)) {
        log::error!("Failed to write status: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    let settings = match AgentSettings::from_env_file(&args.env) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Cannot read settings from {}: {}", args.env.display(), e);
            write_early_failure(format!("invalid agent settings: {}", e));
            return ExitCode::FAILURE;
        }
    };

    let host = match SystemHost::new() {
        Ok(host) => host,
        Err(e) => {
            log::error!("Cannot initialise HTTP client: {}", e);
            write_early_failure(format!("agent start-up failed: {}", e));
            return ExitCode::FAILURE;
        }
    };

    let status = agent::run(&host, &settings).await;
    let code = ExitCode::from(status.exit_code());
    if let Err(e) = status.into_result() {
        log::error!("Deployment failed: {}", e);
    }
    code
}
