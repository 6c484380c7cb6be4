use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::Client;

use crate::error::{AppError, Result};
use crate::retry::RetryPolicy;

use super::host::Host;

/// Upper bound on one download attempt; a stalled transfer counts as a failed attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub async fn download_file(client: &Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::network(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(AppError::network(resp.status().to_string()));
    }

    let mut file = fs::File::create(dest).map_err(|e| AppError::io(e.to_string()))?;

    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::network(e.to_string()))?;
        file.write_all(&chunk)
            .map_err(|e| AppError::io(e.to_string()))?;
    }

    Ok(())
}

/// Download with bounded retries. An empty file counts as a failed attempt.
///
/// Exhaustion yields a `Network` error naming the attempt count, distinct from
/// any later extraction failure.
pub async fn fetch_with_retry(
    host: &dyn Host,
    url: &str,
    dest: &Path,
    policy: RetryPolicy,
) -> Result<()> {
    let mut last_error = String::new();

    for attempt in 1..=policy.attempts {
        let attempt_result = tokio::time::timeout(ATTEMPT_TIMEOUT, host.download(url, dest)).await;
        let outcome = match attempt_result {
            Ok(result) => result.and_then(|()| non_empty(dest)),
            Err(_) => Err(AppError::network_with_url(
                url,
                format!("attempt timed out after {}s", ATTEMPT_TIMEOUT.as_secs()),
            )),
        };
        match outcome {
            Ok(()) => {
                log::info!("Download successful on attempt {}", attempt);
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < policy.attempts {
                    let delay = policy.delay_after(attempt);
                    log::warn!(
                        "Download attempt {} failed: {}; retrying in {}s",
                        attempt,
                        e,
                        delay.as_secs()
                    );
                    host.sleep(delay).await;
                }
            }
        }
    }

    Err(AppError::network(format!(
        "pack download failed after {} attempts: {}",
        policy.attempts, last_error
    )))
}

fn non_empty(path: &Path) -> Result<()> {
    let len = fs::metadata(path)
        .map_err(|e| AppError::io(format!("downloaded file missing: {}", e)))?
        .len();
    if len == 0 {
        return Err(AppError::io("downloaded file is empty"));
    }
    Ok(())
}
