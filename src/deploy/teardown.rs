use crate::cloud::{CloudContext, InstanceState, ObjectRef, DELETE_BATCH_LIMIT};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::launch::LaunchCoordinator;

#[derive(Debug, Clone, Copy, Default)]
pub struct TeardownOptions {
    /// Only log what would be deleted.
    pub dry_run: bool,
    pub skip_bucket: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub instance_id: Option<String>,
    pub instance_ok: bool,
    pub objects_deleted: usize,
    pub bucket_ok: bool,
}

impl TeardownReport {
    pub fn success(&self) -> bool {
        self.instance_ok && self.bucket_ok
    }
}

pub(super) async fn run(
    ctx: &CloudContext,
    config: &ServerConfig,
    instance_id: Option<&str>,
    options: TeardownOptions,
) -> TeardownReport {
    let prefix = if options.dry_run { "[DRY RUN] " } else { "" };
    let mut report = TeardownReport::default();

    report.instance_id = LaunchCoordinator::new(ctx)
        .resolve(instance_id, &config.instance_name)
        .await
        .ok();
    report.instance_ok = match report.instance_id.as_deref() {
        Some(id) => terminate_and_wait(ctx, id, options.dry_run).await,
        None => {
            log::info!("No instance named {}, nothing to terminate", config.instance_name);
            true
        }
    };

    if options.skip_bucket {
        log::info!("Skipping bucket {}", config.bucket);
        report.bucket_ok = true;
    } else {
        log::info!("{}Deleting bucket {} and all contents", prefix, config.bucket);
        match delete_bucket_recursive(ctx, &config.bucket, options.dry_run).await {
            Ok(count) => {
                report.objects_deleted = count;
                report.bucket_ok = true;
            }
            Err(e) => log::error!("Error deleting bucket {}: {}", config.bucket, e),
        }
    }

    report
}

async fn terminate_and_wait(ctx: &CloudContext, instance_id: &str, dry_run: bool) -> bool {
    match ctx.compute.describe_instance(instance_id).await {
        Ok(None) => {
            log::info!("Instance {} not found, already gone", instance_id);
            return true;
        }
        Ok(Some(details)) if details.state == InstanceState::Terminated => {
            log::info!("Instance {} is already terminated", instance_id);
            return true;
        }
        Ok(Some(_)) => {}
        Err(e) => {
            log::error!("Error describing {}: {}", instance_id, e);
            return false;
        }
    }

    if dry_run {
        log::info!("[DRY RUN] Would terminate instance {}", instance_id);
        return true;
    }

    log::info!("Terminating instance {}", instance_id);
    if let Err(e) = ctx.compute.terminate_instance(instance_id).await {
        log::error!("Error terminating {}: {}", instance_id, e);
        return false;
    }
    if let Err(e) = ctx.compute.wait_until_terminated(instance_id).await {
        log::error!("Instance {} did not finish terminating: {}", instance_id, e);
        return false;
    }
    log::info!("Instance {} has been terminated", instance_id);
    true
}

/// Delete every object (or every version and delete marker) and then the bucket.
/// Returns the number of objects removed, or that would be removed in a dry run.
async fn delete_bucket_recursive(ctx: &CloudContext, bucket: &str, dry_run: bool) -> Result<usize> {
    let store = &ctx.store;

    match store.head_bucket(bucket).await {
        Ok(()) => {}
        Err(e) if matches!(e.cloud_code(), Some("404" | "NotFound" | "NoSuchBucket")) => {
            log::info!("Bucket {} does not exist, nothing to delete", bucket);
            return Ok(0);
        }
        Err(e) => return Err(e),
    }

    let versioned = store.bucket_versioning_enabled(bucket).await.unwrap_or_else(|e| {
        log::warn!("Could not read versioning of {}: {}", bucket, e);
        false
    });

    let objects: Vec<ObjectRef> = if versioned {
        log::info!("Bucket {} is versioned, deleting all versions", bucket);
        store.list_object_versions(bucket).await?
    } else {
        store
            .list_objects(bucket, "")
            .await?
            .into_iter()
            .map(|key| ObjectRef {
                key,
                version_id: None,
            })
            .collect()
    };

    if dry_run {
        for object in &objects {
            log::info!("[DRY RUN] Would delete {}", object.key);
        }
        log::info!("[DRY RUN] Would delete bucket {}", bucket);
        return Ok(objects.len());
    }

    for batch in objects.chunks(DELETE_BATCH_LIMIT) {
        store.delete_objects(bucket, batch).await?;
        log::info!("Deleted {} objects from {}", batch.len(), bucket);
    }
    store.delete_bucket(bucket).await?;
    log::info!("Deleted bucket {}", bucket);

    Ok(objects.len())
}
