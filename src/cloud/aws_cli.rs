//! Cloud backend driving the `aws` command-line tool.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use super::{
    Compute, Identity, ImageInfo, IngressRule, InstanceDetails, InstanceProfile, InstanceState,
    LaunchRequest, ObjectRef, ObjectStore, ProfileRef, APPLICATION_TAG,
};
use crate::error::{AppError, Result};

/// Runs `aws <service> <operation> ... --region <r> --output json`.
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    program: String,
}

impl AwsCli {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            program: "aws".to_string(),
        }
    }

    /// Use a different executable, e.g. a wrapper script.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_input(args, None).await
    }

    async fn run_with_input(&self, args: &[&str], input: Option<Vec<u8>>) -> Result<String> {
        log::debug!("aws {}", args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .args(["--region", &self.region, "--output", "json"])
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::process(format!("Failed to run {}: {}", self.program, e)))?;

        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&input)
                    .await
                    .map_err(|e| AppError::io(e.to_string()))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AppError::process(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_cli_error(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: for<'de> Deserialize<'de> + Default>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run(args).await?;
        parse_output(&stdout)
    }
}

/// Empty output (some list calls print nothing) decodes to the default value.
fn parse_output<T: for<'de> Deserialize<'de> + Default>(stdout: &str) -> Result<T> {
    if stdout.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(stdout)
        .map_err(|e| AppError::cloud("InvalidResponse", format!("{}: {}", e, stdout.trim())))
}

/// Map CLI stderr to a `Cloud` error, extracting `(<Code>)` when present.
pub fn parse_cli_error(stderr: &str) -> AppError {
    let stderr = stderr.trim();
    if let Some(start) = stderr.find("An error occurred (") {
        let rest = &stderr[start + "An error occurred (".len()..];
        if let Some(end) = rest.find(')') {
            let code = &rest[..end];
            let message = rest[end + 1..]
                .split_once(": ")
                .map(|(_, m)| m)
                .unwrap_or(stderr);
            return AppError::cloud(code, message.trim());
        }
    }
    AppError::cloud("Unknown", stderr)
}

fn is_code(err: &AppError, codes: &[&str]) -> bool {
    err.cloud_code().is_some_and(|c| codes.contains(&c))
}

fn secs(d: Duration) -> String {
    d.as_secs().max(1).to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupsOutput {
    #[serde(default)]
    security_groups: Vec<SecurityGroupEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupEntry {
    group_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateGroupOutput {
    #[serde(default)]
    group_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImagesOutput {
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageEntry {
    image_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    creation_date: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<InstanceIdEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceIdEntry {
    instance_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceEntry {
    instance_id: String,
    state: StateEntry,
    #[serde(default)]
    instance_type: String,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    launch_time: Option<String>,
    #[serde(default)]
    tags: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StateEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagEntry {
    key: String,
    value: String,
}

impl From<InstanceEntry> for InstanceDetails {
    fn from(entry: InstanceEntry) -> Self {
        let name = entry
            .tags
            .into_iter()
            .find(|t| t.key == "Name")
            .map(|t| t.value);
        Self {
            instance_id: entry.instance_id,
            state: InstanceState::parse(&entry.state.name),
            instance_type: entry.instance_type,
            public_ip: entry.public_ip_address,
            private_ip: entry.private_ip_address,
            launch_time: entry.launch_time,
            name,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyEntry {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersioningOutput {
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectVersionsOutput {
    #[serde(default)]
    versions: Vec<VersionEntry>,
    #[serde(default)]
    delete_markers: Vec<VersionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionEntry {
    key: String,
    version_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleOutput {
    role: Option<RoleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleEntry {
    arn: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileOutput {
    instance_profile: Option<ProfileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileEntry {
    instance_profile_name: String,
    arn: String,
    #[serde(default)]
    roles: Vec<ProfileRoleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRoleEntry {
    role_name: String,
}

impl From<ProfileEntry> for InstanceProfile {
    fn from(entry: ProfileEntry) -> Self {
        Self {
            name: entry.instance_profile_name,
            arn: entry.arn,
            roles: entry.roles.into_iter().map(|r| r.role_name).collect(),
        }
    }
}

#[async_trait]
impl ObjectStore for AwsCli {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        self.run(&["s3api", "head-bucket", "--bucket", bucket])
            .await
            .map(|_| ())
    }

    async fn create_bucket(&self, bucket: &str, location: Option<&str>) -> Result<()> {
        let constraint = location.map(|l| format!("LocationConstraint={}", l));
        let mut args = vec!["s3api", "create-bucket", "--bucket", bucket];
        if let Some(constraint) = constraint.as_deref() {
            args.extend(["--create-bucket-configuration", constraint]);
        }
        self.run(&args).await.map(|_| ())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let target = format!("s3://{}/{}", bucket, key);
        self.run_with_input(&["s3", "cp", "-", &target], Some(body))
            .await
            .map(|_| ())
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let source = path
            .to_str()
            .ok_or_else(|| AppError::io("upload path is not valid UTF-8"))?;
        let target = format!("s3://{}/{}", bucket, key);
        self.run(&["s3", "cp", source, &target]).await.map(|_| ())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        let target = format!("s3://{}/{}", bucket, key);
        let expires = secs(expires);
        let url = self
            .run(&["s3", "presign", &target, "--expires-in", &expires])
            .await?;
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::cloud("InvalidResponse", "empty presigned URL"));
        }
        Ok(url.to_string())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let out: ListObjectsOutput = self
            .run_json(&["s3api", "list-objects-v2", "--bucket", bucket, "--prefix", prefix])
            .await?;
        Ok(out.contents.into_iter().map(|c| c.key).collect())
    }

    async fn bucket_versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let out: VersioningOutput = self
            .run_json(&["s3api", "get-bucket-versioning", "--bucket", bucket])
            .await?;
        Ok(matches!(out.status.as_deref(), Some("Enabled" | "Suspended")))
    }

    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectRef>> {
        let out: ObjectVersionsOutput = self
            .run_json(&["s3api", "list-object-versions", "--bucket", bucket])
            .await?;
        Ok(out
            .versions
            .into_iter()
            .chain(out.delete_markers)
            .map(|v| ObjectRef {
                key: v.key,
                version_id: v.version_id,
            })
            .collect())
    }

    async fn delete_objects(&self, bucket: &str, objects: &[ObjectRef]) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let entries: Vec<serde_json::Value> = objects
            .iter()
            .map(|o| match &o.version_id {
                Some(v) => json!({ "Key": o.key, "VersionId": v }),
                None => json!({ "Key": o.key }),
            })
            .collect();
        let payload = json!({ "Objects": entries, "Quiet": true }).to_string();
        self.run(&["s3api", "delete-objects", "--bucket", bucket, "--delete", &payload])
            .await
            .map(|_| ())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.run(&["s3api", "delete-bucket", "--bucket", bucket])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Compute for AwsCli {
    async fn find_security_group(&self, name: &str) -> Result<Option<String>> {
        let filter = format!("Name=group-name,Values={}", name);
        let out: SecurityGroupsOutput = self
            .run_json(&["ec2", "describe-security-groups", "--filters", &filter])
            .await?;
        Ok(out.security_groups.into_iter().next().map(|g| g.group_id))
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<String> {
        let out: CreateGroupOutput = self
            .run_json(&[
                "ec2",
                "create-security-group",
                "--group-name",
                name,
                "--description",
                description,
            ])
            .await?;
        if out.group_id.is_empty() {
            return Err(AppError::resource_create(
                "security group",
                format!("no GroupId returned for {}", name),
            ));
        }
        Ok(out.group_id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        let permissions: Vec<serde_json::Value> = rules
            .iter()
            .map(|r| {
                json!({
                    "IpProtocol": r.protocol.as_str(),
                    "FromPort": r.port,
                    "ToPort": r.port,
                    "IpRanges": [{ "CidrIp": r.cidr }],
                })
            })
            .collect();
        let payload = serde_json::Value::Array(permissions).to_string();
        self.run(&[
            "ec2",
            "authorize-security-group-ingress",
            "--group-id",
            group_id,
            "--ip-permissions",
            &payload,
        ])
        .await
        .map(|_| ())
    }

    async fn describe_images(&self, name_pattern: &str, owner: &str) -> Result<Vec<ImageInfo>> {
        let name_filter = format!("Name=name,Values={}", name_pattern);
        let out: ImagesOutput = self
            .run_json(&[
                "ec2",
                "describe-images",
                "--owners",
                owner,
                "--filters",
                &name_filter,
                "Name=state,Values=available",
                "Name=architecture,Values=x86_64",
            ])
            .await?;
        Ok(out
            .images
            .into_iter()
            .map(|i| ImageInfo {
                id: i.image_id,
                name: i.name,
                creation_date: i.creation_date,
            })
            .collect())
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String> {
        let tags = json!([{
            "ResourceType": "instance",
            "Tags": [
                { "Key": "Name", "Value": request.name },
                { "Key": "Application", "Value": APPLICATION_TAG },
            ],
        }])
        .to_string();
        let profile = request.profile.as_ref().map(|p| match p {
            ProfileRef::Arn(arn) => format!("Arn={}", arn),
            ProfileRef::Name(name) => format!("Name={}", name),
        });

        let mut args = vec![
            "ec2",
            "run-instances",
            "--image-id",
            request.image_id.as_str(),
            "--instance-type",
            request.instance_type.as_str(),
            "--security-group-ids",
            request.security_group_id.as_str(),
            "--user-data",
            request.user_data.as_str(),
            "--count",
            "1",
            "--tag-specifications",
            tags.as_str(),
        ];
        if let Some(key) = request.key_name.as_deref() {
            args.extend(["--key-name", key]);
        }
        if let Some(profile) = profile.as_deref() {
            args.extend(["--iam-instance-profile", profile]);
        }

        let out: RunInstancesOutput = self.run_json(&args).await?;
        out.instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .ok_or_else(|| AppError::resource_create("instance", "no instance returned"))
    }

    async fn wait_until_running(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "wait", "instance-running", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn wait_until_terminated(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "wait", "instance-terminated", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDetails>> {
        let out: DescribeInstancesOutput = match self
            .run_json(&["ec2", "describe-instances", "--instance-ids", instance_id])
            .await
        {
            Ok(out) => out,
            Err(e) if is_code(&e, &["InvalidInstanceID.NotFound", "InvalidInstanceID.Malformed"]) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        Ok(out
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next()
            .map(InstanceDetails::from))
    }

    async fn find_instances(
        &self,
        name: &str,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceDetails>> {
        let name_filter = format!("Name=tag:Name,Values={}", name);
        let state_values: Vec<&str> = states.iter().map(InstanceState::as_str).collect();
        let state_filter = format!("Name=instance-state-name,Values={}", state_values.join(","));
        let out: DescribeInstancesOutput = self
            .run_json(&["ec2", "describe-instances", "--filters", &name_filter, &state_filter])
            .await?;
        Ok(out
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(InstanceDetails::from)
            .collect())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "start-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "stop-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.run(&["ec2", "terminate-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Identity for AwsCli {
    async fn get_role(&self, role: &str) -> Result<Option<String>> {
        match self
            .run_json::<RoleOutput>(&["iam", "get-role", "--role-name", role])
            .await
        {
            Ok(out) => Ok(out.role.map(|r| r.arn)),
            Err(e) if is_code(&e, &["NoSuchEntity"]) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_role(&self, role: &str, trust_policy: &str) -> Result<String> {
        let out: RoleOutput = self
            .run_json(&[
                "iam",
                "create-role",
                "--role-name",
                role,
                "--assume-role-policy-document",
                trust_policy,
            ])
            .await?;
        out.role
            .map(|r| r.arn)
            .ok_or_else(|| {
                AppError::resource_create("role", format!("no role returned for {}", role))
            })
    }

    async fn get_instance_profile(&self, profile: &str) -> Result<Option<InstanceProfile>> {
        match self
            .run_json::<ProfileOutput>(&[
                "iam",
                "get-instance-profile",
                "--instance-profile-name",
                profile,
            ])
            .await
        {
            Ok(out) => Ok(out.instance_profile.map(InstanceProfile::from)),
            Err(e) if is_code(&e, &["NoSuchEntity"]) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_instance_profile(&self, profile: &str) -> Result<InstanceProfile> {
        let out: ProfileOutput = self
            .run_json(&[
                "iam",
                "create-instance-profile",
                "--instance-profile-name",
                profile,
            ])
            .await?;
        out.instance_profile
            .map(InstanceProfile::from)
            .ok_or_else(|| {
                AppError::resource_create(
                    "instance profile",
                    format!("no instance profile returned for {}", profile),
                )
            })
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()> {
        self.run(&[
            "iam",
            "add-role-to-instance-profile",
            "--instance-profile-name",
            profile,
            "--role-name",
            role,
        ])
        .await
        .map(|_| ())
    }

    async fn put_role_policy(
        &self,
        role: &str,
        policy_name: &str,
        document: &str,
    ) -> Result<()> {
        self.run(&[
            "iam",
            "put-role-policy",
            "--role-name",
            role,
            "--policy-name",
            policy_name,
            "--policy-document",
            document,
        ])
        .await
        .map(|_| ())
    }
}
