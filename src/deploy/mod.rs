//! Operator-facing deployment operations.
//!
//! `deploy` runs pack inspection, provisioning, boot payload composition and launch in
//! order, stopping at the first step that reports failure. Resources already created
//! stay in place; they are keyed by name and reused by the next attempt.

mod teardown;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::agent::verify_host_executable;
use crate::bootstrap::{self, BootstrapSpec, InstallPlan, ARTIFACT_URL_TTL};
use crate::cloud::{CloudContext, InstanceDetails, InstanceState, LaunchRequest, ProfileRef};
use crate::config::{InstallStrategy, ServerConfig, GAME_TCP_PORT, GAME_UDP_PORT, HTTP_PORT};
use crate::error::Result;
use crate::launch::LaunchCoordinator;
use crate::pack;
use crate::paths::{agent_key, default_agent_binary, pack_key};
use crate::provision::Provisioner;
use crate::retry::RetryPolicy;
use crate::status::StatusPorts;
use crate::validation::validate_wrapper_port;

pub use teardown::{TeardownOptions, TeardownReport};

/// Result of a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub instance_id: String,
    pub public_ip: Option<String>,
    pub wrapper_port: Option<u16>,
    pub boot_script_offloaded: bool,
}

/// How players reach a running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub direct: String,
    pub join_link: String,
    pub http_url: String,
}

impl Connection {
    pub fn for_ip(ip: &str) -> Self {
        Self {
            direct: format!("{}:{}", ip, GAME_TCP_PORT),
            join_link: format!(
                "https://acstuff.ru/s/q:race/online/join?ip={}&httpPort={}",
                ip, HTTP_PORT
            ),
            http_url: format!("http://{}:{}", ip, HTTP_PORT),
        }
    }
}

/// Control-plane snapshot of an instance, plus connection info while it is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub details: InstanceDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Start,
    Stop,
    Terminate,
}

pub struct DeploymentFacade {
    ctx: CloudContext,
    config: ServerConfig,
}

impl DeploymentFacade {
    pub fn new(ctx: CloudContext, config: ServerConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn launcher(&self) -> LaunchCoordinator<'_> {
        LaunchCoordinator::new(&self.ctx)
    }

    fn agent_binary(&self) -> Result<PathBuf> {
        match &self.config.agent_binary {
            Some(path) => Ok(path.clone()),
            None => default_agent_binary(),
        }
    }

    /// Deploy `pack` to a new instance.
    ///
    /// `Ok(None)` means a step failed and was logged. The only error is a fatal identity
    /// setup failure.
    pub async fn deploy(&self, pack_path: &Path) -> Result<Option<Deployment>> {
        let config = &self.config;
        let store = self.ctx.store.as_ref();
        let provisioner = Provisioner::new(&self.ctx);
        let native = matches!(config.install_strategy, InstallStrategy::Native);
        let wrapper_enabled = config.enable_wrapper && native;

        log::info!("Deploying {} to {}", pack_path.display(), config.region);
        let pack_key = match pack_key(pack_path) {
            Ok(key) => key,
            Err(e) => {
                log::error!("{}", e);
                return Ok(None);
            }
        };

        let wrapper_port = match pack::wrapper_port(pack_path) {
            Some(port) => match validate_wrapper_port(port) {
                Ok(()) => {
                    log::info!("Pack sets wrapper port {}", port);
                    port
                }
                Err(e) => {
                    log::warn!("Ignoring pack wrapper port: {}", e);
                    config.wrapper_port
                }
            },
            None => config.wrapper_port,
        };

        if !provisioner.ensure_bucket(&config.bucket).await {
            log::error!("Bucket {} is unavailable, aborting", config.bucket);
            return Ok(None);
        }

        if let Err(e) = store
            .upload_file(&config.bucket, &pack_key, pack_path)
            .await
        {
            log::error!("Failed to upload pack: {}", e);
            return Ok(None);
        }
        log::info!("Uploaded pack to s3://{}/{}", config.bucket, pack_key);

        let agent_url = if native {
            let Some(url) = self.upload_agent().await else {
                return Ok(None);
            };
            Some(url)
        } else {
            None
        };

        let pack_url = match store
            .presign_get(&config.bucket, &pack_key, ARTIFACT_URL_TTL)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                log::error!("Failed to sign pack URL: {}", e);
                return Ok(None);
            }
        };

        let extra_ports: Vec<u16> = if wrapper_enabled {
            vec![wrapper_port]
        } else {
            Vec::new()
        };
        let Some(security_group_id) = provisioner
            .ensure_security_group(&config.security_group_name, &extra_ports)
            .await
        else {
            return Ok(None);
        };

        let Some(image_id) = provisioner
            .resolve_latest_image(&config.image_name_pattern, &config.image_owner)
            .await
        else {
            return Ok(None);
        };

        let profile = if let Some(explicit) = &config.iam_instance_profile {
            log::info!("Using instance profile {}", explicit);
            Some(ProfileRef::parse(explicit))
        } else if config.wants_managed_identity() {
            let name = provisioner
                .ensure_identity(
                    &config.iam_role_name,
                    &config.iam_instance_profile_name,
                    &config.bucket,
                )
                .await?;
            Some(ProfileRef::Name(name))
        } else {
            None
        };

        let Some(plan) = InstallPlan::from_strategy(&config.install_strategy, agent_url) else {
            return Ok(None);
        };
        let spec = BootstrapSpec {
            pack_url,
            pack_name: pack_key.trim_start_matches(crate::paths::PACKS_PREFIX).to_string(),
            ports: StatusPorts {
                tcp: GAME_TCP_PORT,
                udp: GAME_UDP_PORT,
                http: HTTP_PORT,
                wrapper: wrapper_port,
            },
            wrapper_enabled,
            download_retry: RetryPolicy::DOWNLOAD,
            plan,
        };
        let script = bootstrap::render(&spec);
        let Some(payload) = bootstrap::compose(store, &config.bucket, script).await else {
            return Ok(None);
        };

        let request = LaunchRequest {
            image_id,
            instance_type: config.instance_type.clone(),
            security_group_id,
            user_data: payload.user_data().to_string(),
            name: config.instance_name.clone(),
            key_name: config.key_name.clone(),
            profile,
        };
        let launcher = self.launcher();
        let Some(instance_id) = launcher.launch(&request).await else {
            return Ok(None);
        };
        let public_ip = launcher.public_ip(&instance_id).await;

        log::info!(
            "Deployed {} ({})",
            instance_id,
            public_ip.as_deref().unwrap_or("no public address yet")
        );
        Ok(Some(Deployment {
            instance_id,
            public_ip,
            wrapper_port: wrapper_enabled.then_some(wrapper_port),
            boot_script_offloaded: payload.is_offloaded(),
        }))
    }

    async fn upload_agent(&self) -> Option<String> {
        let path = match self.agent_binary() {
            Ok(path) => path,
            Err(e) => {
                log::error!("Cannot locate agent binary: {}", e);
                return None;
            }
        };
        if !path.is_file() {
            log::error!(
                "Agent binary {} not found; build it or set agent_binary",
                path.display()
            );
            return None;
        }
        if let Err(e) = verify_host_executable(&path) {
            log::error!("Agent binary cannot run on the server host: {}", e);
            return None;
        }

        let key = agent_key();
        let store = self.ctx.store.as_ref();
        if let Err(e) = store.upload_file(&self.config.bucket, &key, &path).await {
            log::error!("Failed to upload agent: {}", e);
            return None;
        }
        match store
            .presign_get(&self.config.bucket, &key, ARTIFACT_URL_TTL)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                log::error!("Failed to sign agent URL: {}", e);
                None
            }
        }
    }

    /// Terminate the old instance, then deploy; a failed termination does not stop the deploy.
    pub async fn redeploy(
        &self,
        pack_path: &Path,
        instance_id: Option<&str>,
    ) -> Result<Option<Deployment>> {
        match self
            .launcher()
            .resolve(instance_id, &self.config.instance_name)
            .await
        {
            Ok(old) => {
                if let Err(e) = self.ctx.compute.terminate_instance(&old).await {
                    log::warn!("Failed to terminate {}, deploying anyway: {}", old, e);
                } else {
                    log::info!("Terminated {}", old);
                }
            }
            Err(e) => log::warn!("No instance to replace: {}", e),
        }
        self.deploy(pack_path).await
    }

    pub async fn stop(&self, instance_id: Option<&str>) -> bool {
        self.lifecycle(instance_id, Lifecycle::Stop).await
    }

    pub async fn start(&self, instance_id: Option<&str>) -> bool {
        self.lifecycle(instance_id, Lifecycle::Start).await
    }

    pub async fn terminate(&self, instance_id: Option<&str>) -> bool {
        self.lifecycle(instance_id, Lifecycle::Terminate).await
    }

    async fn lifecycle(&self, instance_id: Option<&str>, op: Lifecycle) -> bool {
        let id = match self
            .launcher()
            .resolve(instance_id, &self.config.instance_name)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                log::error!("{}", e);
                return false;
            }
        };

        let compute = &self.ctx.compute;
        let result = match op {
            Lifecycle::Start => compute.start_instance(&id).await,
            Lifecycle::Stop => compute.stop_instance(&id).await,
            Lifecycle::Terminate => compute.terminate_instance(&id).await,
        };
        match result {
            Ok(()) => {
                log::info!("{:?} requested for {}", op, id);
                true
            }
            Err(e) => {
                log::error!("{:?} failed for {}: {}", op, id, e);
                false
            }
        }
    }

    /// Current control-plane view; connection info only for a running instance with an address.
    pub async fn status(&self, instance_id: Option<&str>) -> Option<StatusReport> {
        let launcher = self.launcher();
        let id = match launcher
            .resolve(instance_id, &self.config.instance_name)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                log::error!("{}", e);
                return None;
            }
        };

        let details = launcher.details(&id).await?;
        let connection = match (&details.state, details.public_ip.as_deref()) {
            (InstanceState::Running, Some(ip)) => Some(Connection::for_ip(ip)),
            _ => None,
        };
        Some(StatusReport {
            details,
            connection,
        })
    }

    /// Terminate the instance and delete the bucket with everything in it.
    pub async fn terminate_all(
        &self,
        instance_id: Option<&str>,
        options: TeardownOptions,
    ) -> TeardownReport {
        teardown::run(&self.ctx, &self.config, instance_id, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_for_ip() {
        let conn = Connection::for_ip("203.0.113.7");
        assert_eq!(conn.direct, "203.0.113.7:9600");
        assert_eq!(
            conn.join_link,
            "https://acstuff.ru/s/q:race/online/join?ip=203.0.113.7&httpPort=8081"
        );
    }
}
