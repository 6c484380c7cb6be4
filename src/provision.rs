//! Idempotent create-or-get of the shared cloud resources a deployment needs.
//!
//! Every step except [`Provisioner::ensure_identity`] reports failure as an empty
//! result and logs the cause; the caller decides whether to abort.

use serde_json::json;

use crate::cloud::{CloudContext, IngressRule, Protocol};
use crate::config::{ADMIN_PORT, GAME_TCP_PORT, GAME_UDP_PORT, HTTP_PORT};
use crate::error::{AppError, Result};
use crate::retry::{retry_when, RetryPolicy};

/// Region whose bucket creation takes no location constraint.
const DEFAULT_REGION: &str = "us-east-1";

const SECURITY_GROUP_DESCRIPTION: &str = "Assetto Corsa dedicated server";

/// Provider code for a named identity resource that already exists.
const ALREADY_EXISTS: &str = "EntityAlreadyExists";

/// Provider codes meaning the caller lacks a grant.
const ACCESS_DENIED: [&str; 3] = ["AccessDenied", "AccessDeniedException", "UnauthorizedOperation"];

fn is_access_denied(e: &AppError) -> bool {
    e.cloud_code().is_some_and(|code| ACCESS_DENIED.contains(&code))
}

/// Capabilities needed by [`Provisioner::ensure_identity`].
pub const IDENTITY_PERMISSIONS: [&str; 6] = [
    "iam:CreateRole",
    "iam:CreateInstanceProfile",
    "iam:AddRoleToInstanceProfile",
    "iam:PutRolePolicy",
    "iam:GetRole",
    "iam:GetInstanceProfile",
];

/// Ports every server needs opened.
pub fn base_rules() -> Vec<IngressRule> {
    vec![
        IngressRule::public(Protocol::Tcp, ADMIN_PORT),
        IngressRule::public(Protocol::Tcp, HTTP_PORT),
        IngressRule::public(Protocol::Tcp, GAME_TCP_PORT),
        IngressRule::public(Protocol::Udp, GAME_UDP_PORT),
    ]
}

/// Trust policy letting compute instances assume the role.
pub fn trust_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ec2.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

/// Least-privilege read access to the pack bucket.
pub fn bucket_read_policy(bucket: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{}/*", bucket)],
            },
            {
                "Effect": "Allow",
                "Action": ["s3:ListBucket"],
                "Resource": [format!("arn:aws:s3:::{}", bucket)],
            },
        ],
    })
    .to_string()
}

pub struct Provisioner<'a> {
    ctx: &'a CloudContext,
}

impl<'a> Provisioner<'a> {
    pub fn new(ctx: &'a CloudContext) -> Self {
        Self { ctx }
    }

    /// Make sure `name` exists in the context's region.
    pub async fn ensure_bucket(&self, name: &str) -> bool {
        match self.ctx.store.head_bucket(name).await {
            Ok(()) => {
                log::info!("Bucket {} already exists", name);
                return true;
            }
            Err(e) if matches!(e.cloud_code(), Some("404" | "NotFound" | "NoSuchBucket")) => {}
            Err(e) => {
                log::error!("Error checking bucket {}: {}", name, e);
                return false;
            }
        }

        let location = (self.ctx.region != DEFAULT_REGION).then_some(self.ctx.region.as_str());
        match self.ctx.store.create_bucket(name, location).await {
            Ok(()) => {
                log::info!("Created bucket {} in {}", name, self.ctx.region);
                true
            }
            // Lost a race with another creator of the same bucket.
            Err(e) if e.cloud_code() == Some("BucketAlreadyOwnedByYou") => true,
            Err(e) => {
                log::error!("Error creating bucket {}: {}", name, e);
                false
            }
        }
    }

    /// Find the group by name, or create it and open the base ports plus `extra_ports` (TCP).
    pub async fn ensure_security_group(&self, name: &str, extra_ports: &[u16]) -> Option<String> {
        match self.ctx.compute.find_security_group(name).await {
            Ok(Some(id)) => {
                log::info!("Security group {} already exists: {}", name, id);
                return Some(id);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Error looking up security group {}: {}", name, e);
                return None;
            }
        }

        let group_id = match self
            .ctx
            .compute
            .create_security_group(name, SECURITY_GROUP_DESCRIPTION)
            .await
        {
            Ok(id) => id,
            Err(e) if e.cloud_code() == Some("InvalidGroup.Duplicate") => {
                return self.ctx.compute.find_security_group(name).await.ok().flatten();
            }
            Err(e) => {
                log::error!("Error creating security group {}: {}", name, e);
                return None;
            }
        };
        log::info!("Created security group {}: {}", name, group_id);

        let mut rules = base_rules();
        for &port in extra_ports {
            let rule = IngressRule::public(Protocol::Tcp, port);
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }

        if let Err(e) = self.ctx.compute.authorize_ingress(&group_id, &rules).await {
            log::error!("Error adding ingress rules to {}: {}", group_id, e);
            return None;
        }
        log::info!("Added {} ingress rules to {}", rules.len(), group_id);
        Some(group_id)
    }

    /// Newest available image matching `name_pattern` from `owner`.
    pub async fn resolve_latest_image(&self, name_pattern: &str, owner: &str) -> Option<String> {
        let mut images = match self.ctx.compute.describe_images(name_pattern, owner).await {
            Ok(images) => images,
            Err(e) => {
                log::error!("Error listing images: {}", e);
                return None;
            }
        };

        // ISO 8601 timestamps in one format sort lexically.
        images.sort_by(|a, b| b.creation_date.cmp(&a.creation_date));
        let Some(latest) = images.into_iter().next() else {
            log::error!("No image matches {}", name_pattern);
            return None;
        };
        log::info!("Using image {} ({})", latest.id, latest.name);
        Some(latest.id)
    }

    /// Create or reuse the role and instance profile granting read access to `bucket`.
    ///
    /// Returns the profile name. Any failure is fatal: the deployment cannot route around a
    /// permissions gap. Access-denied codes become a [`crate::ErrorKind::Permission`] error naming
    /// the grants to add; other provider errors are returned as they are.
    pub async fn ensure_identity(&self, role: &str, profile: &str, bucket: &str) -> Result<String> {
        self.try_ensure_identity(role, profile, bucket)
            .await
            .map_err(|e| {
                log::error!("Identity setup failed: {}", e);
                if !is_access_denied(&e) {
                    return e;
                }
                AppError::permission(
                    &IDENTITY_PERMISSIONS,
                    format!(
                        "could not set up role {} and instance profile {}: {}. Grant the listed \
                         permissions or pass an existing instance profile",
                        role, profile, e
                    ),
                )
            })
    }

    async fn try_ensure_identity(&self, role: &str, profile: &str, bucket: &str) -> Result<String> {
        let identity = &self.ctx.identity;

        match identity.get_role(role).await? {
            Some(arn) => log::info!("Role {} already exists: {}", role, arn),
            None => match identity.create_role(role, &trust_policy()).await {
                Ok(arn) => log::info!("Created role {}: {}", role, arn),
                Err(e) if e.cloud_code() == Some(ALREADY_EXISTS) => {
                    log::info!("Role {} was created concurrently", role);
                }
                Err(e) => return Err(e),
            },
        }

        let existing = match identity.get_instance_profile(profile).await? {
            Some(existing) => {
                log::info!("Instance profile {} already exists", profile);
                existing
            }
            None => match identity.create_instance_profile(profile).await {
                Ok(created) => {
                    log::info!("Created instance profile {}: {}", profile, created.arn);
                    created
                }
                Err(e) if e.cloud_code() == Some(ALREADY_EXISTS) => {
                    log::info!("Instance profile {} was created concurrently", profile);
                    identity.get_instance_profile(profile).await?.ok_or_else(|| {
                        AppError::resource_not_found("instance profile", profile)
                    })?
                }
                Err(e) => return Err(e),
            },
        };

        if existing.roles.iter().any(|r| r == role) {
            log::debug!("Role {} already attached to {}", role, profile);
        } else {
            // A freshly created role may not be visible to the profile yet.
            let attached = retry_when(
                RetryPolicy::IDENTITY_PROPAGATION,
                "attach role",
                |e| e.cloud_code() == Some("NoSuchEntity"),
                move || identity.add_role_to_instance_profile(profile, role),
            )
            .await;
            match attached {
                Ok(()) => log::info!("Attached role {} to {}", role, profile),
                // A profile holds at most one role.
                Err(e) if e.cloud_code() == Some("LimitExceeded") => {
                    log::warn!("Instance profile {} already has a role attached", profile);
                }
                Err(e) => return Err(e),
            }
        }

        let policy_name = format!("{}-s3-access", role);
        identity
            .put_role_policy(role, &policy_name, &bucket_read_policy(bucket))
            .await?;
        log::info!("Attached inline policy {} for bucket {}", policy_name, bucket);

        Ok(existing.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_policy_is_scoped_to_bucket() {
        let doc: serde_json::Value =
            serde_json::from_str(&bucket_read_policy("ac-server-packs")).unwrap();
        assert_eq!(
            doc["Statement"][0]["Resource"][0],
            "arn:aws:s3:::ac-server-packs/*"
        );
        assert_eq!(doc["Statement"][1]["Action"][0], "s3:ListBucket");
    }

    #[test]
    fn base_rules_cover_admin_http_and_game_ports() {
        let rules = base_rules();
        assert_eq!(rules.len(), 4);
        assert!(rules.contains(&IngressRule::public(Protocol::Udp, GAME_UDP_PORT)));
        assert!(rules.iter().all(|r| r.cidr == "0.0.0.0/0"));
    }
}
