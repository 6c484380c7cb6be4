//! Boot payload composition.
//!
//! A [`BootstrapSpec`] is rendered into a bash script by a pure function; [`compose`]
//! then applies the inline size policy, offloading oversized scripts to object storage
//! behind a small fetch-and-exec stub.

mod container;
mod native;

use std::time::Duration;

use chrono::Utc;

use crate::cloud::ObjectStore;
use crate::config::InstallStrategy;
use crate::paths::BOOTSTRAP_PREFIX;
use crate::retry::RetryPolicy;
use crate::status::StatusPorts;

/// Hard ceiling for inline boot data accepted by the provider.
pub const INLINE_CEILING: usize = 16 * 1024;
/// Upper bound for the offload stub.
pub const STUB_LIMIT: usize = 2 * 1024;
/// Lifetime of the signed URL for an offloaded script.
pub const OFFLOAD_URL_TTL: Duration = Duration::from_secs(3600);
/// Lifetime of signed URLs for the pack and the agent.
pub const ARTIFACT_URL_TTL: Duration = Duration::from_secs(2 * 3600);

/// Flavor-specific inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    /// Fetch the agent and hand it the rest of the install.
    Native { agent_url: String },
    /// Run the AssettoServer image.
    Container { version: String },
}

impl InstallPlan {
    pub fn from_strategy(strategy: &InstallStrategy, agent_url: Option<String>) -> Option<Self> {
        match strategy {
            InstallStrategy::Native => agent_url.map(|agent_url| Self::Native { agent_url }),
            InstallStrategy::Container { version } => Some(Self::Container {
                version: version.clone(),
            }),
        }
    }
}

/// Everything a boot script needs, independent of its literal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSpec {
    pub pack_url: String,
    pub pack_name: String,
    pub ports: StatusPorts,
    pub wrapper_enabled: bool,
    pub download_retry: RetryPolicy,
    pub plan: InstallPlan,
}

/// Render the full installer script.
pub fn render(spec: &BootstrapSpec) -> String {
    match &spec.plan {
        InstallPlan::Native { agent_url } => native::render(spec, agent_url),
        InstallPlan::Container { version } => container::render(spec, version),
    }
}

/// Minimal stub that downloads and runs an offloaded script.
pub fn render_stub(url: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -euo pipefail\n\
         curl -fsSL --retry 5 --retry-delay 3 -o /tmp/acserver-bootstrap.sh {url}\n\
         exec bash /tmp/acserver-bootstrap.sh\n",
        url = shell_quote(url)
    )
}

/// Boot data handed to the launch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPayload {
    Inline(String),
    Offloaded {
        script_key: String,
        url: String,
        stub: String,
    },
}

impl BootPayload {
    pub fn user_data(&self) -> &str {
        match self {
            Self::Inline(script) => script,
            Self::Offloaded { stub, .. } => stub,
        }
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self, Self::Offloaded { .. })
    }
}

/// Key for an offloaded script: `bootstrap/bootstrap-<YYYYmmddHHMMSS>-<8 hex>.sh`.
pub fn offload_key() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}bootstrap-{}-{}.sh",
        BOOTSTRAP_PREFIX,
        Utc::now().format("%Y%m%d%H%M%S"),
        &id[..8]
    )
}

/// Apply the size policy to a rendered script.
///
/// Scripts under [`INLINE_CEILING`] are used directly. Larger ones are uploaded and
/// replaced by a stub; `None` if the upload, signing, or stub size check fails.
pub async fn compose(store: &dyn ObjectStore, bucket: &str, script: String) -> Option<BootPayload> {
    if script.len() < INLINE_CEILING {
        log::info!("Boot script is {} bytes, embedding inline", script.len());
        return Some(BootPayload::Inline(script));
    }

    log::info!(
        "Boot script is {} bytes (limit {}), offloading to storage",
        script.len(),
        INLINE_CEILING
    );
    let script_key = offload_key();
    if let Err(e) = store
        .put_object(bucket, &script_key, script.into_bytes())
        .await
    {
        log::error!("Failed to upload boot script: {}", e);
        return None;
    }

    let url = match store.presign_get(bucket, &script_key, OFFLOAD_URL_TTL).await {
        Ok(url) => url,
        Err(e) => {
            log::error!("Failed to sign boot script URL: {}", e);
            return None;
        }
    };

    let stub = render_stub(&url);
    if stub.len() >= STUB_LIMIT {
        log::error!("Boot stub is {} bytes, over the {} limit", stub.len(), STUB_LIMIT);
        return None;
    }
    log::info!("Uploaded boot script to s3://{}/{}", bucket, script_key);

    Some(BootPayload::Offloaded {
        script_key,
        url,
        stub,
    })
}

/// Quote a value for bash using single quotes.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shared helper functions for rendered scripts: logging and retrying downloads.
fn script_prelude(spec: &BootstrapSpec) -> String {
    format!(
        r#"#!/bin/bash
set -uo pipefail

LOG_FILE={log}
STATUS_FILE={status}
INSTALL_DIR={install}
mkdir -p "$INSTALL_DIR" "$(dirname "$LOG_FILE")"
exec > >(tee -a "$LOG_FILE") 2>&1

log() {{ echo "[$(date -u +%Y-%m-%dT%H:%M:%SZ)] $*"; }}

write_failure() {{
    cat > "$STATUS_FILE" <<STATUS_EOF
{{
  "success": false,
  "timestamp": "$(date -u +%Y-%m-%dT%H:%M:%SZ)",
  "public_ip": "unknown",
  "ports": {{"tcp": {tcp}, "udp": {udp}, "http": {http}, "wrapper": {wrapper}}},
  "wrapper_enabled": {wrapper_enabled},
  "error_messages": ["$1"]
}}
STATUS_EOF
}}

fetch() {{
    local url="$1" dest="$2" attempt=1 delay={delay}
    while true; do
        if curl -fsSL --connect-timeout 20 -o "$dest" "$url"; then
            return 0
        fi
        if [ "$attempt" -ge {attempts} ]; then
            log "Download of $dest failed after {attempts} attempts"
            return 1
        fi
        log "Download of $dest failed (attempt $attempt/{attempts}), retrying in ${{delay}}s"
        sleep "$delay"
        attempt=$((attempt + 1))
        delay=$((delay * 2))
    done
}}

log "Boot script starting"
export DEBIAN_FRONTEND=noninteractive
"#,
        log = shell_quote(crate::paths::HOST_DEPLOY_LOG),
        status = shell_quote(crate::paths::HOST_STATUS_PATH),
        install = shell_quote(crate::paths::HOST_INSTALL_DIR),
        tcp = spec.ports.tcp,
        udp = spec.ports.udp,
        http = spec.ports.http,
        wrapper = spec.ports.wrapper,
        wrapper_enabled = spec.wrapper_enabled,
        delay = spec.download_retry.initial_delay.as_secs(),
        attempts = spec.download_retry.attempts,
    )
}
