use super::{script_prelude, shell_quote, BootstrapSpec};

/// Container image serving the pack's content.
pub(super) const IMAGE: &str = "compujuckel/assettoserver";

fn compose_file(spec: &BootstrapSpec, version: &str) -> String {
    format!(
        r#"services:
  assettoserver:
    image: {image}:{version}
    container_name: assettoserver
    restart: unless-stopped
    ports:
      - "{tcp}:{tcp}/tcp"
      - "{udp}:{udp}/udp"
      - "{http}:{http}/tcp"
    volumes:
      - /opt/acserver/data:/data
"#,
        image = IMAGE,
        version = version,
        tcp = spec.ports.tcp,
        udp = spec.ports.udp,
        http = spec.ports.http,
    )
}

/// Install the container engine, unpack the pack into the data volume, start the image.
pub(super) fn render(spec: &BootstrapSpec, version: &str) -> String {
    let mut script = script_prelude(spec);
    script.push_str(&format!(
        r#"
log "Installing container engine"
apt-get update -y
apt-get install -y ca-certificates curl gnupg unzip
install -m 0755 -d /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg -o /etc/apt/keyrings/docker.asc
chmod a+r /etc/apt/keyrings/docker.asc
echo "deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] https://download.docker.com/linux/ubuntu $(. /etc/os-release && echo "$VERSION_CODENAME") stable" > /etc/apt/sources.list.d/docker.list
apt-get update -y
if ! apt-get install -y docker-ce docker-ce-cli containerd.io docker-compose-plugin; then
    write_failure "container engine install failed"
    exit 1
fi
systemctl enable --now docker

log "Fetching pack"
PACK_FILE="$INSTALL_DIR/pack.archive"
if ! fetch {pack_url} "$PACK_FILE"; then
    write_failure "pack download failed after {attempts} attempts"
    exit 1
fi

DATA_DIR="$INSTALL_DIR/data"
mkdir -p "$DATA_DIR"
case "$(head -c 2 "$PACK_FILE" | od -An -tx1 | tr -d ' \n')" in
    1f8b) tar -xzf "$PACK_FILE" -C "$DATA_DIR" ;;
    504b) unzip -oq "$PACK_FILE" -d "$DATA_DIR" ;;
    *) false ;;
esac
if [ $? -ne 0 ]; then
    write_failure "pack extraction failed: corrupt or unsupported archive"
    exit 1
fi

cat > "$INSTALL_DIR/docker-compose.yml" <<'COMPOSE_EOF'
{compose}COMPOSE_EOF

log "Starting {image}:{version}"
cd "$INSTALL_DIR"
if ! docker compose up -d; then
    write_failure "docker compose up failed"
    exit 1
fi

sleep 15
ERRORS=()
if ! docker ps --filter name=assettoserver --filter status=running --format '{{{{.Names}}}}' | grep -q assettoserver; then
    ERRORS+=("container assettoserver is not running")
fi

PUBLIC_IP=$(curl -fsS --max-time 5 http://169.254.169.254/latest/meta-data/public-ipv4 || echo unknown)
SUCCESS=true
MESSAGES=""
for msg in "${{ERRORS[@]}}"; do
    SUCCESS=false
    MESSAGES="$MESSAGES${{MESSAGES:+, }}\"$msg\""
done

cat > "$STATUS_FILE" <<STATUS_EOF
{{
  "success": $SUCCESS,
  "timestamp": "$(date -u +%Y-%m-%dT%H:%M:%SZ)",
  "public_ip": "$PUBLIC_IP",
  "ports": {{"tcp": {tcp}, "udp": {udp}, "http": {http}, "wrapper": {wrapper}}},
  "wrapper_enabled": false,
  "assettoserver_version": "{version}",
  "error_messages": [$MESSAGES]
}}
STATUS_EOF

log "Container install finished: success=$SUCCESS"
[ "$SUCCESS" = true ]
"#,
        pack_url = shell_quote(&spec.pack_url),
        attempts = spec.download_retry.attempts,
        compose = compose_file(spec, version),
        image = IMAGE,
        version = version,
        tcp = spec.ports.tcp,
        udp = spec.ports.udp,
        http = spec.ports.http,
        wrapper = spec.ports.wrapper,
    ));
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::InstallPlan;
    use crate::retry::RetryPolicy;
    use crate::status::StatusPorts;

    #[test]
    fn renders_pinned_image_and_compose_start() {
        let spec = BootstrapSpec {
            pack_url: "https://b.s3.amazonaws.com/packs/p.zip?sig=1".to_string(),
            pack_name: "p.zip".to_string(),
            ports: StatusPorts {
                tcp: 9600,
                udp: 9600,
                http: 8081,
                wrapper: 8082,
            },
            wrapper_enabled: false,
            download_retry: RetryPolicy::DOWNLOAD,
            plan: InstallPlan::Container {
                version: "v1.0.0".to_string(),
            },
        };
        let script = render(&spec, "v1.0.0");
        assert!(script.contains("image: compujuckel/assettoserver:v1.0.0"));
        assert!(script.contains("docker-compose-plugin"));
        assert!(script.contains("docker compose up -d"));
        assert!(script.contains(r#""9600:9600/udp""#));
        assert!(script.contains("--format '{{.Names}}'"));
        assert!(script.contains("pack download failed after 3 attempts"));
    }
}
