//! In-memory cloud backends and pack builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

use acserver_manager_lib::cloud::{
    CloudContext, Compute, Identity, ImageInfo, IngressRule, InstanceDetails, InstanceProfile,
    InstanceState, LaunchRequest, ObjectRef, ObjectStore,
};
use acserver_manager_lib::config::{InstallStrategy, ServerConfig};
use acserver_manager_lib::{AppError, Result};

pub const REGION: &str = "us-east-1";
pub const ASSIGNED_IP: &str = "203.0.113.10";

fn denied(action: &str) -> AppError {
    AppError::cloud(
        "AccessDenied",
        format!("User is not authorized to perform: {}", action),
    )
}

fn already_exists(entity: &str, name: &str) -> AppError {
    AppError::cloud(
        "EntityAlreadyExists",
        format!("{} with name {} already exists.", entity, name),
    )
}

// =============================================================================
// Object storage
// =============================================================================

#[derive(Default)]
pub struct FakeStore {
    pub buckets: Mutex<BTreeMap<String, BTreeMap<String, Vec<u8>>>>,
    /// Returned by `list_object_versions` when `versioned` is set.
    pub versions: Mutex<Vec<ObjectRef>>,
    pub versioned: AtomicBool,
    /// `head_bucket` fails with something other than "not found".
    pub deny_head: AtomicBool,
    pub deny_create: AtomicBool,
    /// `create_bucket` reports that a concurrent create already won.
    pub create_race: AtomicBool,
    pub delete_batches: Mutex<Vec<usize>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeStore {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default();
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().unwrap().contains_key(bucket)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        self.record(format!("head_bucket {}", bucket));
        if self.deny_head.load(Ordering::SeqCst) {
            return Err(AppError::cloud("403", "Forbidden"));
        }
        if self.has_bucket(bucket) {
            Ok(())
        } else {
            Err(AppError::cloud("404", "Not Found"))
        }
    }

    async fn create_bucket(&self, bucket: &str, location: Option<&str>) -> Result<()> {
        self.record(format!("create_bucket {} {:?}", bucket, location));
        if self.deny_create.load(Ordering::SeqCst) {
            return Err(denied("s3:CreateBucket"));
        }
        self.add_bucket(bucket);
        if self.create_race.load(Ordering::SeqCst) {
            return Err(AppError::cloud(
                "BucketAlreadyOwnedByYou",
                "Your previous request to create the named bucket succeeded",
            ));
        }
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.record(format!("put_object {}/{}", bucket, key));
        let mut buckets = self.buckets.lock().unwrap();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| AppError::cloud("NoSuchBucket", bucket))?;
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = std::fs::read(path)?;
        self.put_object(bucket, key, body).await
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        self.record(format!("presign_get {}/{}", bucket, key));
        Ok(format!(
            "https://{}.s3.amazonaws.com/{}?X-Amz-Expires={}&X-Amz-Signature=0123abcd",
            bucket,
            key,
            expires.as_secs()
        ))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.record(format!("list_objects {}", bucket));
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn bucket_versioning_enabled(&self, _bucket: &str) -> Result<bool> {
        Ok(self.versioned.load(Ordering::SeqCst))
    }

    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectRef>> {
        self.record(format!("list_object_versions {}", bucket));
        Ok(self.versions.lock().unwrap().clone())
    }

    async fn delete_objects(&self, bucket: &str, objects: &[ObjectRef]) -> Result<()> {
        self.record(format!("delete_objects {} {}", bucket, objects.len()));
        self.delete_batches.lock().unwrap().push(objects.len());
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(stored) = buckets.get_mut(bucket) {
            for object in objects {
                stored.remove(&object.key);
            }
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.record(format!("delete_bucket {}", bucket));
        self.buckets.lock().unwrap().remove(bucket);
        Ok(())
    }
}

// =============================================================================
// Compute
// =============================================================================

#[derive(Default)]
pub struct FakeCompute {
    pub groups: Mutex<BTreeMap<String, String>>,
    pub authorized: Mutex<Vec<(String, Vec<IngressRule>)>>,
    pub images: Mutex<Vec<ImageInfo>>,
    pub instances: Mutex<Vec<InstanceDetails>>,
    pub launches: Mutex<Vec<LaunchRequest>>,
    pub deny_terminate: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeCompute {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn add_image(&self, id: &str, creation_date: &str) {
        self.images.lock().unwrap().push(ImageInfo {
            id: id.to_string(),
            name: format!("ubuntu-jammy-22.04-amd64-server-{}", id),
            creation_date: creation_date.to_string(),
        });
    }

    pub fn add_instance(&self, id: &str, name: &str, state: InstanceState) {
        let public_ip = (state == InstanceState::Running).then(|| ASSIGNED_IP.to_string());
        self.instances.lock().unwrap().push(InstanceDetails {
            instance_id: id.to_string(),
            state,
            instance_type: "t3.small".to_string(),
            public_ip,
            private_ip: Some("10.0.0.5".to_string()),
            launch_time: Some("2024-05-01T10:00:00+00:00".to_string()),
            name: Some(name.to_string()),
        });
    }

    pub fn state_of(&self, id: &str) -> Option<InstanceState> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.instance_id == id)
            .map(|i| i.state.clone())
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    pub fn authorized_rules(&self) -> Vec<IngressRule> {
        self.authorized
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, rules)| rules.clone())
            .collect()
    }

    fn update<F: FnOnce(&mut InstanceDetails)>(&self, id: &str, change: F) -> Result<()> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .iter_mut()
            .find(|i| i.instance_id == id)
            .ok_or_else(|| AppError::cloud("InvalidInstanceID.NotFound", id))?;
        change(instance);
        Ok(())
    }
}

#[async_trait]
impl Compute for FakeCompute {
    async fn find_security_group(&self, name: &str) -> Result<Option<String>> {
        self.record(format!("find_security_group {}", name));
        Ok(self.groups.lock().unwrap().get(name).cloned())
    }

    async fn create_security_group(&self, name: &str, _description: &str) -> Result<String> {
        self.record(format!("create_security_group {}", name));
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(name) {
            return Err(AppError::cloud("InvalidGroup.Duplicate", name));
        }
        let id = format!("sg-{:017x}", groups.len() + 1);
        groups.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> Result<()> {
        self.record(format!("authorize_ingress {}", group_id));
        self.authorized
            .lock()
            .unwrap()
            .push((group_id.to_string(), rules.to_vec()));
        Ok(())
    }

    async fn describe_images(&self, _name_pattern: &str, _owner: &str) -> Result<Vec<ImageInfo>> {
        self.record("describe_images".to_string());
        Ok(self.images.lock().unwrap().clone())
    }

    async fn run_instance(&self, request: &LaunchRequest) -> Result<String> {
        self.record(format!("run_instance {}", request.name));
        let mut launches = self.launches.lock().unwrap();
        launches.push(request.clone());
        let id = format!("i-{:017x}", 0xa11c0 + launches.len());
        self.instances.lock().unwrap().push(InstanceDetails {
            instance_id: id.clone(),
            state: InstanceState::Pending,
            instance_type: request.instance_type.clone(),
            public_ip: None,
            private_ip: None,
            launch_time: Some("2024-05-01T10:00:00+00:00".to_string()),
            name: Some(request.name.clone()),
        });
        Ok(id)
    }

    async fn wait_until_running(&self, instance_id: &str) -> Result<()> {
        self.update(instance_id, |i| {
            i.state = InstanceState::Running;
            i.public_ip = Some(ASSIGNED_IP.to_string());
            i.private_ip = Some("10.0.0.5".to_string());
        })
    }

    async fn wait_until_terminated(&self, instance_id: &str) -> Result<()> {
        self.update(instance_id, |i| {
            i.state = InstanceState::Terminated;
            i.public_ip = None;
        })
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceDetails>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned())
    }

    async fn find_instances(
        &self,
        name: &str,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceDetails>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.name.as_deref() == Some(name) && states.contains(&i.state))
            .cloned()
            .collect())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.record(format!("start_instance {}", instance_id));
        self.update(instance_id, |i| i.state = InstanceState::Pending)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.record(format!("stop_instance {}", instance_id));
        self.update(instance_id, |i| {
            i.state = InstanceState::Stopping;
            i.public_ip = None;
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.record(format!("terminate_instance {}", instance_id));
        if self.deny_terminate.load(Ordering::SeqCst) {
            return Err(denied("ec2:TerminateInstances"));
        }
        self.update(instance_id, |i| i.state = InstanceState::ShuttingDown)
    }
}

// =============================================================================
// Identity
// =============================================================================

#[derive(Default)]
pub struct FakeIdentity {
    pub roles: Mutex<BTreeMap<String, String>>,
    pub profiles: Mutex<BTreeMap<String, InstanceProfile>>,
    pub policies: Mutex<Vec<(String, String, String)>>,
    pub deny: AtomicBool,
    /// Creates store the entity but report it as created by someone else.
    pub create_race: AtomicBool,
    /// Number of attach calls that fail as if the role were not visible yet.
    pub propagation_misses: AtomicU32,
    pub calls: Mutex<Vec<String>>,
}

impl FakeIdentity {
    fn check(&self, call: String, action: &str) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.deny.load(Ordering::SeqCst) {
            return Err(denied(action));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn profile(&self, name: &str) -> Option<InstanceProfile> {
        self.profiles.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl Identity for FakeIdentity {
    async fn get_role(&self, role: &str) -> Result<Option<String>> {
        self.check(format!("get_role {}", role), "iam:GetRole")?;
        Ok(self.roles.lock().unwrap().get(role).cloned())
    }

    async fn create_role(&self, role: &str, _trust_policy: &str) -> Result<String> {
        self.check(format!("create_role {}", role), "iam:CreateRole")?;
        let arn = format!("arn:aws:iam::123456789012:role/{}", role);
        self.roles
            .lock()
            .unwrap()
            .insert(role.to_string(), arn.clone());
        if self.create_race.load(Ordering::SeqCst) {
            return Err(already_exists("Role", role));
        }
        Ok(arn)
    }

    async fn get_instance_profile(&self, profile: &str) -> Result<Option<InstanceProfile>> {
        self.check(
            format!("get_instance_profile {}", profile),
            "iam:GetInstanceProfile",
        )?;
        Ok(self.profile(profile))
    }

    async fn create_instance_profile(&self, profile: &str) -> Result<InstanceProfile> {
        self.check(
            format!("create_instance_profile {}", profile),
            "iam:CreateInstanceProfile",
        )?;
        let created = InstanceProfile {
            name: profile.to_string(),
            arn: format!("arn:aws:iam::123456789012:instance-profile/{}", profile),
            roles: Vec::new(),
        };
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.to_string(), created.clone());
        if self.create_race.load(Ordering::SeqCst) {
            return Err(already_exists("Instance Profile", profile));
        }
        Ok(created)
    }

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()> {
        self.check(
            format!("add_role_to_instance_profile {} {}", profile, role),
            "iam:AddRoleToInstanceProfile",
        )?;
        let misses = self.propagation_misses.load(Ordering::SeqCst);
        if misses > 0 {
            self.propagation_misses.store(misses - 1, Ordering::SeqCst);
            return Err(AppError::cloud(
                "NoSuchEntity",
                format!("The role with name {} cannot be found", role),
            ));
        }
        let mut profiles = self.profiles.lock().unwrap();
        let stored = profiles
            .get_mut(profile)
            .ok_or_else(|| AppError::cloud("NoSuchEntity", profile))?;
        if !stored.roles.is_empty() {
            return Err(AppError::cloud(
                "LimitExceeded",
                "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1",
            ));
        }
        stored.roles.push(role.to_string());
        Ok(())
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()> {
        self.check(format!("put_role_policy {}", role), "iam:PutRolePolicy")?;
        self.policies.lock().unwrap().push((
            role.to_string(),
            policy_name.to_string(),
            document.to_string(),
        ));
        Ok(())
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub struct Fakes {
    pub store: Arc<FakeStore>,
    pub compute: Arc<FakeCompute>,
    pub identity: Arc<FakeIdentity>,
}

impl Fakes {
    /// Empty account with one Ubuntu image available.
    pub fn new() -> Self {
        let fakes = Self {
            store: Arc::new(FakeStore::default()),
            compute: Arc::new(FakeCompute::default()),
            identity: Arc::new(FakeIdentity::default()),
        };
        fakes.compute.add_image("ami-0jammy2024", "2024-04-01T00:00:00.000Z");
        fakes
    }

    pub fn ctx(&self) -> CloudContext {
        CloudContext::new(
            REGION,
            Arc::clone(&self.store) as Arc<dyn ObjectStore>,
            Arc::clone(&self.compute) as Arc<dyn Compute>,
            Arc::clone(&self.identity) as Arc<dyn Identity>,
        )
    }
}

/// Header of a little-endian x86-64 ELF executable, padded like a real file.
pub fn elf_x86_64() -> Vec<u8> {
    let mut header = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
    header.resize(16, 0);
    header.extend_from_slice(&[2, 0, 0x3e, 0]);
    header.extend_from_slice(b"agent body");
    header
}

/// Config for a native deploy, with a stand-in agent binary under `dir`.
pub fn native_config(dir: &Path) -> ServerConfig {
    let agent = dir.join("acserver-agent");
    std::fs::write(&agent, elf_x86_64()).unwrap();
    ServerConfig {
        agent_binary: Some(agent),
        enable_wrapper: false,
        ..ServerConfig::default()
    }
}

pub fn container_config() -> ServerConfig {
    ServerConfig {
        install_strategy: InstallStrategy::Container {
            version: "v0.0.54".to_string(),
        },
        ..ServerConfig::default()
    }
}

/// Write a gzip-compressed tarball holding `entries`.
pub fn write_tar_gz(dest: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
    let file = File::create(dest).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    dest.to_path_buf()
}

/// A minimal pack: server binary, config, and optionally wrapper parameters.
pub fn write_pack(dest: &Path, wrapper_params: Option<&str>) -> PathBuf {
    let mut entries: Vec<(&str, &[u8])> = vec![
        ("acServer", &b"\x7fELF\x02\x01\x01\x00"[..]),
        ("cfg/server_cfg.ini", &b"[SERVER]\nNAME=Test\n"[..]),
    ];
    if let Some(params) = wrapper_params {
        entries.push(("cfg/cm_wrapper_params.json", params.as_bytes()));
    }
    write_tar_gz(dest, &entries)
}
