//! Instance launch and name-based discovery.

use crate::cloud::{CloudContext, InstanceDetails, InstanceState, LaunchRequest};
use crate::error::{AppError, Result};

pub struct LaunchCoordinator<'a> {
    ctx: &'a CloudContext,
}

impl<'a> LaunchCoordinator<'a> {
    pub fn new(ctx: &'a CloudContext) -> Self {
        Self { ctx }
    }

    /// Start one tagged instance and wait until the provider reports it running.
    pub async fn launch(&self, request: &LaunchRequest) -> Option<String> {
        let instance_id = match self.ctx.compute.run_instance(request).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Error launching instance: {}", e);
                return None;
            }
        };
        log::info!("Launched instance {}, waiting for it to run", instance_id);

        if let Err(e) = self.ctx.compute.wait_until_running(&instance_id).await {
            log::error!("Instance {} did not reach running: {}", instance_id, e);
            return None;
        }
        log::info!("Instance {} is running", instance_id);
        Some(instance_id)
    }

    /// Ids of live instances carrying the Name tag `name`.
    pub async fn find_by_name(&self, name: &str) -> Vec<String> {
        match self
            .ctx
            .compute
            .find_instances(name, &InstanceState::DISCOVERABLE)
            .await
        {
            Ok(instances) => instances.into_iter().map(|i| i.instance_id).collect(),
            Err(e) => {
                log::error!("Error finding instances named {}: {}", name, e);
                Vec::new()
            }
        }
    }

    /// Use `instance_id` if given, otherwise the first instance named `name`.
    pub async fn resolve(&self, instance_id: Option<&str>, name: &str) -> Result<String> {
        if let Some(id) = instance_id {
            return Ok(id.to_string());
        }

        let ids = self.find_by_name(name).await;
        let Some(first) = ids.first() else {
            return Err(AppError::resource_not_found("instance", name));
        };
        if ids.len() > 1 {
            log::warn!(
                "{} instances are named {} ({}); using {}",
                ids.len(),
                name,
                ids.join(", "),
                first
            );
        }
        Ok(first.clone())
    }

    /// Best-effort public address; absent while the provider has not assigned one.
    pub async fn public_ip(&self, instance_id: &str) -> Option<String> {
        match self.ctx.compute.describe_instance(instance_id).await {
            Ok(details) => details.and_then(|d| d.public_ip),
            Err(e) => {
                log::warn!("Could not read address of {}: {}", instance_id, e);
                None
            }
        }
    }

    pub async fn details(&self, instance_id: &str) -> Option<InstanceDetails> {
        match self.ctx.compute.describe_instance(instance_id).await {
            Ok(details) => details,
            Err(e) => {
                log::error!("Error describing instance {}: {}", instance_id, e);
                None
            }
        }
    }
}
