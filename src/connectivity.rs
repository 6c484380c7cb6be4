//! Reachability probes run against a deployed server.

use std::time::Duration;

use reqwest::Client;
use tokio::net::{TcpStream, UdpSocket};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP connect succeeds within the timeout.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            log::debug!("TCP {}:{} refused: {}", host, port, e);
            false
        }
        Err(_) => {
            log::debug!("TCP {}:{} timed out", host, port);
            false
        }
    }
}

/// Best-effort UDP probe.
///
/// UDP is connectionless: a reply or silence both count as open, an ICMP
/// port-unreachable (surfacing as a receive error) counts as closed.
pub async fn probe_udp(host: &str, port: u16, timeout: Duration) -> bool {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("UDP bind failed: {}", e);
            return false;
        }
    };
    if let Err(e) = socket.connect((host, port)).await {
        log::debug!("UDP connect to {}:{} failed: {}", host, port, e);
        return false;
    }
    if let Err(e) = socket.send(&[0u8]).await {
        log::debug!("UDP send to {}:{} failed: {}", host, port, e);
        return false;
    }

    let mut buf = [0u8; 512];
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) | Err(_) => true,
        Ok(Err(e)) => {
            log::debug!("UDP {}:{} unreachable: {}", host, port, e);
            false
        }
    }
}

/// HTTP GET returning 2xx or 3xx; the error string describes anything else.
pub async fn probe_url(client: &Client, url: &str) -> std::result::Result<(), String> {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => Ok(()),
        Ok(resp) => Err(format!("HTTP {}", resp.status().as_u16())),
        Err(e) if e.is_timeout() => Err("connection timeout".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Client used by probes: short timeout, identifies the tool.
pub fn probe_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent(concat!("acserver-manager/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_tcp("127.0.0.1", port, PROBE_TIMEOUT).await);

        drop(listener);
        assert!(!probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn udp_probe_treats_reply_as_open() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });
        assert!(probe_udp("127.0.0.1", port, PROBE_TIMEOUT).await);
        echo.await.unwrap();
    }
}
