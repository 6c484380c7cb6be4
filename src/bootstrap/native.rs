use crate::keyvalue;
use crate::paths::{HOST_AGENT_ENV_PATH, HOST_AGENT_PATH, HOST_INSTALL_DIR, HOST_STATUS_PATH};

use super::{script_prelude, shell_quote, BootstrapSpec};

/// Settings handed to the agent through its env file.
pub(super) fn agent_env(spec: &BootstrapSpec) -> String {
    keyvalue::render([
        ("PACK_URL", spec.pack_url.clone()),
        ("PACK_NAME", spec.pack_name.clone()),
        ("INSTALL_DIR", HOST_INSTALL_DIR.to_string()),
        ("STATUS_PATH", HOST_STATUS_PATH.to_string()),
        ("TCP_PORT", spec.ports.tcp.to_string()),
        ("UDP_PORT", spec.ports.udp.to_string()),
        ("HTTP_PORT", spec.ports.http.to_string()),
        ("WRAPPER_PORT", spec.ports.wrapper.to_string()),
        ("WRAPPER_ENABLED", spec.wrapper_enabled.to_string()),
        ("DOWNLOAD_ATTEMPTS", spec.download_retry.attempts.to_string()),
        (
            "DOWNLOAD_DELAY_SECS",
            spec.download_retry.initial_delay.as_secs().to_string(),
        ),
    ])
}

/// Install prerequisites, fetch the agent, write its env file, then hand over.
pub(super) fn render(spec: &BootstrapSpec, agent_url: &str) -> String {
    let mut script = script_prelude(spec);
    script.push_str(&format!(
        r#"
log "Installing prerequisites"
apt-get update -y || log "apt-get update failed, continuing"
apt-get install -y curl ca-certificates || log "prerequisite install failed, continuing"

log "Fetching deployment agent"
if ! fetch {agent_url} {agent_path}; then
    write_failure "agent download failed after {attempts} attempts"
    exit 1
fi
chmod 0755 {agent_path}

cat > {env_path} <<'AGENT_ENV_EOF'
{env}AGENT_ENV_EOF

log "Handing over to the deployment agent"
export RUST_LOG="${{RUST_LOG:-info}}"
{agent_path} --env {env_path} || {{
    status=$?
    [ -f "$STATUS_FILE" ] || write_failure "deployment agent failed to start (exit $status)"
    exit 1
}}
"#,
        agent_url = shell_quote(agent_url),
        agent_path = shell_quote(HOST_AGENT_PATH),
        env_path = shell_quote(HOST_AGENT_ENV_PATH),
        attempts = spec.download_retry.attempts,
        env = agent_env(spec),
    ));
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::InstallPlan;
    use crate::keyvalue::KeyValues;
    use crate::retry::RetryPolicy;
    use crate::status::StatusPorts;

    fn spec() -> BootstrapSpec {
        BootstrapSpec {
            pack_url: "https://b.s3.amazonaws.com/packs/p.tar.gz?X-Amz-Signature=abc&X-Amz-Expires=7200"
                .to_string(),
            pack_name: "p.tar.gz".to_string(),
            ports: StatusPorts {
                tcp: 9600,
                udp: 9600,
                http: 8081,
                wrapper: 8090,
            },
            wrapper_enabled: true,
            download_retry: RetryPolicy::DOWNLOAD,
            plan: InstallPlan::Native {
                agent_url: "https://b.s3.amazonaws.com/tools/acserver-agent?sig=1".to_string(),
            },
        }
    }

    #[test]
    fn script_fetches_agent_and_runs_it() {
        let spec = spec();
        let script = render(&spec, "https://b.s3.amazonaws.com/tools/acserver-agent?sig=1");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("fetch 'https://b.s3.amazonaws.com/tools/acserver-agent?sig=1'"));
        assert!(script.contains("'/opt/acserver/acserver-agent' --env '/opt/acserver/agent.env' || {"));
        assert!(!script.contains("exec '/opt/acserver/acserver-agent'"));
        assert!(script.contains("agent download failed after 3 attempts"));
        assert!(script.contains("delay=5"));
    }

    #[test]
    fn agent_start_failure_still_leaves_a_status_document() {
        let script = render(&spec(), "https://b.s3.amazonaws.com/tools/acserver-agent?sig=1");
        let handover = script
            .split("Handing over to the deployment agent")
            .nth(1)
            .unwrap();
        assert!(handover.contains(r#"[ -f "$STATUS_FILE" ] || write_failure "deployment agent failed to start"#));
        assert!(handover.trim_end().ends_with("exit 1\n}"));
    }

    #[test]
    fn env_file_round_trips_through_parser() {
        let env = agent_env(&spec());
        let kv = KeyValues::parse(&env).strict().unwrap();
        assert_eq!(kv.get("PACK_URL"), Some(spec().pack_url.as_str()));
        assert_eq!(kv.parse_or::<u16>("WRAPPER_PORT", 0).unwrap(), 8090);
        assert!(kv.flag("WRAPPER_ENABLED", false).unwrap());
    }
}
