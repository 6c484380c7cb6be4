//! Operator command line.

use std::ffi::OsString;
use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::cloud::CloudContext;
use crate::config::{
    default_container_version, load_config, InstallStrategy, ServerConfig, GAME_TCP_PORT,
    GAME_UDP_PORT, HTTP_PORT,
};
use crate::connectivity::{probe_client, probe_tcp, probe_udp, probe_url, PROBE_TIMEOUT};
use crate::deploy::{Deployment, DeploymentFacade, StatusReport, TeardownOptions};
use crate::error::{AppError, Result};
use crate::validation::{is_pack_filename, validate_instance_id};

const CONFIRM_WORD: &str = "TERMINATE";

#[derive(Parser, Debug)]
#[command(name = "acserver-manager")]
#[command(about = "Deploy and manage an Assetto Corsa dedicated server on a cloud instance")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.acserver_manager/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cloud region
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Name tag used to find the instance
    #[arg(long, global = true)]
    pub instance_name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings shared by deploy and redeploy.
#[derive(Args, Debug, Default, Clone)]
pub struct DeployOptions {
    #[arg(long)]
    pub instance_type: Option<String>,

    /// Storage bucket for packs and boot scripts
    #[arg(long)]
    pub bucket: Option<String>,

    /// Key pair for SSH access
    #[arg(long)]
    pub key_name: Option<String>,

    /// Existing instance profile name or ARN
    #[arg(long, conflicts_with = "create_iam")]
    pub iam_instance_profile: Option<String>,

    /// Create the role and instance profile for bucket access
    #[arg(long)]
    pub create_iam: bool,

    #[arg(long)]
    pub iam_role_name: Option<String>,

    #[arg(long)]
    pub iam_instance_profile_name: Option<String>,

    /// Serve pack content through the wrapper (default: on)
    #[arg(long, conflicts_with = "no_wrapper")]
    pub enable_wrapper: bool,

    #[arg(long)]
    pub no_wrapper: bool,

    /// Wrapper port when the pack does not set one (not 22, 8081 or 9600)
    #[arg(long)]
    pub wrapper_port: Option<u16>,

    /// Run the AssettoServer container instead of the pack's binary
    #[arg(long)]
    pub container: bool,

    /// AssettoServer image version (implies --container)
    #[arg(long)]
    pub container_version: Option<String>,

    /// Agent binary to upload (default: next to this executable)
    #[arg(long)]
    pub agent_binary: Option<PathBuf>,
}

impl DeployOptions {
    pub fn apply(self, config: &mut ServerConfig) {
        if let Some(v) = self.instance_type {
            config.instance_type = v;
        }
        if let Some(v) = self.bucket {
            config.bucket = v;
        }
        if self.key_name.is_some() {
            config.key_name = self.key_name;
        }
        if self.iam_instance_profile.is_some() {
            config.iam_instance_profile = self.iam_instance_profile;
        }
        if self.create_iam {
            config.create_iam = true;
        }
        if let Some(v) = self.iam_role_name {
            config.iam_role_name = v;
        }
        if let Some(v) = self.iam_instance_profile_name {
            config.iam_instance_profile_name = v;
        }
        if self.enable_wrapper {
            config.enable_wrapper = true;
        }
        if self.no_wrapper {
            config.enable_wrapper = false;
        }
        if let Some(v) = self.wrapper_port {
            config.wrapper_port = v;
        }
        if self.agent_binary.is_some() {
            config.agent_binary = self.agent_binary;
        }

        match (self.container, self.container_version) {
            (_, Some(version)) => config.install_strategy = InstallStrategy::Container { version },
            (true, None) => {
                if !matches!(config.install_strategy, InstallStrategy::Container { .. }) {
                    config.install_strategy = InstallStrategy::Container {
                        version: default_container_version(),
                    };
                }
            }
            (false, None) => {}
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct Target {
    /// Instance id; looked up by name when absent
    #[arg(long)]
    pub instance_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deploy a server pack to a new instance
    Deploy {
        pack: PathBuf,
        #[command(flatten)]
        options: DeployOptions,
    },
    /// Stop the instance
    Stop {
        #[command(flatten)]
        target: Target,
    },
    /// Start a stopped instance
    Start {
        #[command(flatten)]
        target: Target,
    },
    /// Terminate the instance
    Terminate {
        #[command(flatten)]
        target: Target,
    },
    /// Terminate the instance and deploy the pack to a new one
    Redeploy {
        pack: PathBuf,
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        options: DeployOptions,
    },
    /// Show instance state and connection details
    Status {
        #[command(flatten)]
        target: Target,
    },
    /// Terminate the instance and delete the bucket with everything in it
    TerminateAll {
        #[command(flatten)]
        target: Target,
        /// Bucket to delete instead of the configured one
        #[arg(long)]
        bucket: Option<String>,
        /// Only terminate the instance
        #[arg(long)]
        skip_bucket: bool,
        /// Log what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Run using the current process arguments.
pub async fn run() -> Result<bool> {
    run_with_args(std::env::args_os()).await
}

/// Parse `args` and execute. `Ok(false)` means the command ran and failed.
pub async fn run_with_args<I, T>(args: I) -> Result<bool>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let config = resolve_config(&cli)?;
    let ctx = CloudContext::aws_cli(&config.region);
    execute(cli.command, DeploymentFacade::new(ctx, config)).await
}

/// Config file, then global flags, then per-command flags.
pub fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(region) = &cli.region {
        config.region = region.clone();
    }
    if let Some(name) = &cli.instance_name {
        config.instance_name = name.clone();
    }
    match &cli.command {
        Command::Deploy { options, .. } | Command::Redeploy { options, .. } => {
            options.clone().apply(&mut config);
        }
        Command::TerminateAll {
            bucket: Some(bucket),
            ..
        } => config.bucket = bucket.clone(),
        _ => {}
    }
    config.check()?;
    Ok(config)
}

fn check_target(target: &Target) -> Result<Option<&str>> {
    if let Some(id) = &target.instance_id {
        validate_instance_id(id)?;
    }
    Ok(target.instance_id.as_deref())
}

fn check_pack(pack: &Path) -> Result<()> {
    if !pack.is_file() {
        return Err(AppError::resource_not_found("pack", &pack.display().to_string()));
    }
    let name = pack
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !is_pack_filename(&name) {
        log::warn!("{} does not look like a .tar.gz or .zip pack", name);
    }
    Ok(())
}

pub async fn execute(command: Command, facade: DeploymentFacade) -> Result<bool> {
    match command {
        Command::Deploy { pack, .. } => {
            check_pack(&pack)?;
            println!("Deploying server from {}...", pack.display());
            let deployment = facade.deploy(&pack).await?;
            Ok(report_deployment(deployment.as_ref()))
        }
        Command::Redeploy { pack, target, .. } => {
            check_pack(&pack)?;
            let id = check_target(&target)?;
            println!("Redeploying server from {}...", pack.display());
            let deployment = facade.redeploy(&pack, id).await?;
            Ok(report_deployment(deployment.as_ref()))
        }
        Command::Stop { target } => {
            let ok = facade.stop(check_target(&target)?).await;
            report_outcome(ok, "Stop requested", "Failed to stop instance");
            Ok(ok)
        }
        Command::Start { target } => {
            let ok = facade.start(check_target(&target)?).await;
            report_outcome(ok, "Start requested", "Failed to start instance");
            Ok(ok)
        }
        Command::Terminate { target } => {
            let ok = facade.terminate(check_target(&target)?).await;
            report_outcome(ok, "Termination requested", "Failed to terminate instance");
            Ok(ok)
        }
        Command::Status { target } => {
            let Some(report) = facade.status(check_target(&target)?).await else {
                println!("No instance found");
                return Ok(false);
            };
            print_status(&report);
            if let (Some(ip), Some(_)) = (report.details.public_ip.as_deref(), &report.connection) {
                run_probes(ip, &report).await;
            }
            Ok(true)
        }
        Command::TerminateAll {
            target,
            skip_bucket,
            dry_run,
            force,
            ..
        } => {
            let id = check_target(&target)?;
            if !force && !dry_run {
                print_teardown_warning(&facade.config().bucket, skip_bucket);
                if !confirm(&mut io::stdin().lock()) {
                    println!("Confirmation failed. Aborting.");
                    return Ok(false);
                }
            }
            let report = facade
                .terminate_all(id, TeardownOptions { dry_run, skip_bucket })
                .await;
            let ok = report.success();
            report_outcome(
                ok,
                if dry_run { "Dry run complete" } else { "Teardown complete" },
                "Teardown finished with errors",
            );
            Ok(ok)
        }
    }
}

fn report_outcome(ok: bool, success: &str, failure: &str) {
    if ok {
        println!("✓ {}", success);
    } else {
        println!("✗ {}", failure);
    }
}

fn report_deployment(deployment: Option<&Deployment>) -> bool {
    let Some(d) = deployment else {
        println!("✗ Deployment failed");
        return false;
    };
    println!("✓ Deployment successful");
    println!("Instance ID: {}", d.instance_id);
    if let Some(ip) = &d.public_ip {
        println!("Public IP: {}", ip);
    }
    if let Some(port) = d.wrapper_port {
        println!("Wrapper port: {}", port);
    }
    if d.boot_script_offloaded {
        println!("Boot script was offloaded to storage (too large to inline)");
    }
    println!("The server is initializing and will be available in a few minutes.");
    true
}

fn print_status(report: &StatusReport) {
    let d = &report.details;
    println!("Instance ID: {}", d.instance_id);
    println!("Name: {}", d.name.as_deref().unwrap_or("N/A"));
    println!("State: {}", d.state.as_str());
    println!("Instance Type: {}", d.instance_type);
    if let Some(launched) = &d.launch_time {
        println!("Launch Time: {}", launched);
    }
    if let Some(ip) = &d.private_ip {
        println!("Private IP: {}", ip);
    }

    match &report.connection {
        Some(conn) => {
            println!();
            println!("Public IP: {}", d.public_ip.as_deref().unwrap_or("N/A"));
            println!("Game Port: {} (TCP) / {} (UDP)", GAME_TCP_PORT, GAME_UDP_PORT);
            println!("HTTP Port: {}", HTTP_PORT);
            println!("Direct Connect: {}", conn.direct);
            println!("Join link: {}", conn.join_link);
        }
        None => println!("Connection details are available once the instance is running."),
    }
}

async fn run_probes(ip: &str, report: &StatusReport) {
    println!();
    println!("Connectivity checks:");
    for (label, port) in [("game", GAME_TCP_PORT), ("HTTP", HTTP_PORT)] {
        let open = probe_tcp(ip, port, PROBE_TIMEOUT).await;
        println!(
            "  {} TCP port {} ({}) {}",
            if open { "✓" } else { "✗" },
            port,
            label,
            if open { "is open" } else { "is not accessible" }
        );
    }

    let udp_open = probe_udp(ip, GAME_UDP_PORT, PROBE_TIMEOUT).await;
    println!(
        "  {} UDP port {} {}",
        if udp_open { "✓" } else { "✗" },
        GAME_UDP_PORT,
        if udp_open { "appears to be open" } else { "is not accessible" }
    );

    if let Some(conn) = &report.connection {
        match probe_url(&probe_client(), &conn.join_link).await {
            Ok(()) => println!("  ✓ Join link is accessible"),
            Err(e) => println!(
                "  ✗ Join link check failed: {} (may not indicate a server problem)",
                e
            ),
        }
    }
}

fn print_teardown_warning(bucket: &str, skip_bucket: bool) {
    println!("WARNING: this permanently deletes the server infrastructure.");
    println!("  - Terminate the instance");
    if !skip_bucket {
        println!("  - Delete bucket {} and ALL its contents, including all versions", bucket);
    }
    println!("This cannot be undone.");
    print!("Type \"{}\" (case-sensitive) to confirm: ", CONFIRM_WORD);
    if let Err(e) = io::stdout().flush() {
        log::debug!("flush failed: {}", e);
    }
}

/// Read one line and accept only the exact confirmation word.
pub fn confirm(input: &mut impl BufRead) -> bool {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => line.trim_end_matches(['\r', '\n']) == CONFIRM_WORD,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("acserver-manager").chain(args.iter().copied()))
    }

    #[test]
    fn deploy_flags_override_config() {
        let cli = parse(&[
            "deploy",
            "pack.tar.gz",
            "--region",
            "eu-central-1",
            "--bucket",
            "my-packs",
            "--no-wrapper",
            "--container-version",
            "v0.0.55",
            "--config",
            "/nonexistent/config.toml",
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.bucket, "my-packs");
        assert!(!config.enable_wrapper);
        assert_eq!(
            config.install_strategy,
            InstallStrategy::Container {
                version: "v0.0.55".to_string()
            }
        );
    }

    #[test]
    fn bad_container_version_is_rejected() {
        let cli = parse(&[
            "deploy",
            "pack.zip",
            "--container-version",
            "v1;reboot",
            "--config",
            "/nonexistent/config.toml",
        ]);
        assert!(resolve_config(&cli).is_err());
    }

    #[test]
    fn profile_and_create_iam_conflict() {
        let result = Cli::try_parse_from([
            "acserver-manager",
            "deploy",
            "p.zip",
            "--iam-instance-profile",
            "existing",
            "--create-iam",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn terminate_all_flags() {
        let cli = parse(&[
            "terminate-all",
            "--dry-run",
            "--skip-bucket",
            "--instance-id",
            "i-0abc",
        ]);
        assert!(matches!(
            cli.command,
            Command::TerminateAll {
                ref target,
                dry_run: true,
                skip_bucket: true,
                force: false,
                ..
            } if target.instance_id.as_deref() == Some("i-0abc")
        ));
    }

    #[test]
    fn confirmation_is_exact() {
        assert!(confirm(&mut "TERMINATE\n".as_bytes()));
        assert!(!confirm(&mut "terminate\n".as_bytes()));
        assert!(!confirm(&mut " TERMINATE\n".as_bytes()));
        assert!(!confirm(&mut "".as_bytes()));
    }
}
