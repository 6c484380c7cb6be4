//! Cloud collaborator interfaces.
//!
//! Provisioning, launch and teardown only talk to the provider through these
//! traits. [`aws_cli::AwsCli`] is the real backend; tests use in-memory fakes.

pub mod aws_cli;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tag value marking instances created by this tool.
pub const APPLICATION_TAG: &str = "ac-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub port: u16,
    pub cidr: String,
}

impl IngressRule {
    /// Rule open to every address.
    pub fn public(protocol: Protocol, port: u16) -> Self {
        Self {
            protocol,
            port,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    /// ISO 8601 creation timestamp, as reported by the provider.
    pub creation_date: String,
}

/// Instance profile reference passed at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileRef {
    Name(String),
    Arn(String),
}

impl ProfileRef {
    /// Classify a user-supplied reference: ARNs are passed as ARN, anything else as name.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("arn:aws:iam::") {
            Self::Arn(value.to_string())
        } else {
            Self::Name(value.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub image_id: String,
    pub instance_type: String,
    pub security_group_id: String,
    pub user_data: String,
    pub name: String,
    pub key_name: Option<String>,
    pub profile: Option<ProfileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    #[serde(untagged)]
    Other(String),
}

impl InstanceState {
    /// States considered when discovering instances by name.
    pub const DISCOVERABLE: [Self; 4] = [Self::Pending, Self::Running, Self::Stopping, Self::Stopped];

    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-plane view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDetails {
    pub instance_id: String,
    pub state: InstanceState,
    pub instance_type: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub launch_time: Option<String>,
    pub name: Option<String>,
}

/// Object key with an optional version, for bulk deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub key: String,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfile {
    pub name: String,
    pub arn: String,
    pub roles: Vec<String>,
}

/// Object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Probe a bucket; a missing bucket is a `Cloud` error with code `404` or `NotFound`.
    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    /// Create a bucket; `location` is the explicit location constraint, if any.
    async fn create_bucket(&self, bucket: &str, location: Option<&str>) -> Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;

    /// Time-limited signed GET URL.
    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn bucket_versioning_enabled(&self, bucket: &str) -> Result<bool>;

    /// Every object version and delete marker in the bucket.
    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectRef>>;

    /// Bulk delete; callers keep batches at or under [`DELETE_BATCH_LIMIT`].
    async fn delete_objects(&self, bucket: &str, objects: &[ObjectRef]) -> Result<()>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

/// Largest batch accepted by a single bulk delete.
pub const DELETE_BATCH_LIMIT: usize = 1000;

/// Compute and network rules.
#[async_trait]
pub trait Compute: Send + Sync {
    async fn find_security_group(&self, name: &str) -> Result<Option<String>>;

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String>;

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()>;

    /// Available x86_64 images matching a name pattern and owner.
    async fn describe_images(&self, name_pattern: &str, owner: &str) -> Result<Vec<ImageInfo>>;

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String>;

    async fn wait_until_running(&self, instance_id: &str) -> Result<()>;

    async fn wait_until_terminated(&self, instance_id: &str) -> Result<()>;

    /// `None` when the provider does not know the id.
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDetails>>;

    /// Instances whose Name tag equals `name`, restricted to `states`.
    async fn find_instances(
        &self,
        name: &str,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceDetails>>;

    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// Identity: roles, instance profiles, inline policies.
#[async_trait]
pub trait Identity: Send + Sync {
    /// Role ARN, or `None` when the role does not exist.
    async fn get_role(&self, role: &str) -> Result<Option<String>>;

    async fn create_role(&self, role: &str, trust_policy: &str) -> Result<String>;

    async fn get_instance_profile(&self, profile: &str) -> Result<Option<InstanceProfile>>;

    async fn create_instance_profile(&self, profile: &str) -> Result<InstanceProfile>;

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()>;

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str)
        -> Result<()>;
}

/// Explicit provider context handed to every component.
#[derive(Clone)]
pub struct CloudContext {
    pub region: String,
    pub store: Arc<dyn ObjectStore>,
    pub compute: Arc<dyn Compute>,
    pub identity: Arc<dyn Identity>,
}

impl CloudContext {
    pub fn new(
        region: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        compute: Arc<dyn Compute>,
        identity: Arc<dyn Identity>,
    ) -> Self {
        Self {
            region: region.into(),
            store,
            compute,
            identity,
        }
    }

    /// Context backed by the `aws` command-line tool.
    pub fn aws_cli(region: &str) -> Self {
        let backend = Arc::new(aws_cli::AwsCli::new(region));
        Self::new(
            region,
            Arc::clone(&backend) as Arc<dyn ObjectStore>,
            Arc::clone(&backend) as Arc<dyn Compute>,
            backend,
        )
    }
}

impl fmt::Debug for CloudContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudContext")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_reference_classification() {
        assert_eq!(
            ProfileRef::parse("arn:aws:iam::123456789012:instance-profile/ac"),
            ProfileRef::Arn("arn:aws:iam::123456789012:instance-profile/ac".to_string())
        );
        assert_eq!(
            ProfileRef::parse("ac-server-instance-profile"),
            ProfileRef::Name("ac-server-instance-profile".to_string())
        );
    }

    #[test]
    fn instance_state_parsing() {
        assert_eq!(InstanceState::parse("shutting-down"), InstanceState::ShuttingDown);
        assert_eq!(
            InstanceState::parse("rebooting"),
            InstanceState::Other("rebooting".to_string())
        );
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
    }
}
