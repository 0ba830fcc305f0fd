//! Reachability probes for upstream proxies
//!
//! A probe establishes a proxied connection to a known-good target. This
//! validates both connectivity to the proxy itself and the proxy's ability to
//! reach the target.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::models::{ProxyEndpoint, ProxyProtocol};

use super::Prober;

/// Probe outcome: measured round-trip on success, error description on failure
pub type ProbeResult = std::result::Result<Duration, String>;

/// Real prober that tunnels a connection through the proxy to a fixed target
pub struct ConnectProber {
    target_host: String,
    target_port: u16,
}

impl ConnectProber {
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let (target_host, target_port) = config.check_target()?;
        Ok(Self {
            target_host,
            target_port,
        })
    }

    pub fn with_target(host: impl Into<String>, port: u16) -> Self {
        Self {
            target_host: host.into(),
            target_port: port,
        }
    }

    /// Establish an HTTP CONNECT tunnel through the proxy
    async fn probe_http(&self, endpoint: &ProxyEndpoint) -> std::result::Result<(), String> {
        let mut stream = TcpStream::connect(endpoint.address())
            .await
            .map_err(|e| format!("TCP connect failed: {}", e))?;

        let request = self.build_connect_request(endpoint);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| format!("failed to send CONNECT: {}", e))?;

        // The status line may arrive split across TCP segments; keep reading
        // until the first CRLF (the probe timeout bounds the whole exchange).
        let mut response = Vec::with_capacity(256);
        let mut buf = [0u8; 256];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| format!("failed to read CONNECT response: {}", e))?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.windows(2).any(|w| w == b"\r\n") || response.len() >= 4096 {
                break;
            }
        }

        let response = String::from_utf8_lossy(&response);
        if response.starts_with("HTTP/1.1 200") || response.starts_with("HTTP/1.0 200") {
            Ok(())
        } else {
            Err(format!(
                "CONNECT refused: {}",
                response.lines().next().unwrap_or("empty response")
            ))
        }
    }

    fn build_connect_request(&self, endpoint: &ProxyEndpoint) -> String {
        let mut request = format!(
            "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
            self.target_host, self.target_port, self.target_host, self.target_port
        );

        if let (Some(username), Some(password)) = (&endpoint.username, &endpoint.password) {
            let credentials = format!("{}:{}", username, password);
            let encoded = BASE64.encode(credentials.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Establish a SOCKS5 connection through the proxy
    async fn probe_socks5(&self, endpoint: &ProxyEndpoint) -> std::result::Result<(), String> {
        let proxy_addr = (endpoint.host.as_str(), endpoint.port);
        let target = (self.target_host.as_str(), self.target_port);

        let result = if let (Some(username), Some(password)) =
            (&endpoint.username, &endpoint.password)
        {
            Socks5Stream::connect_with_password(proxy_addr, target, username, password).await
        } else {
            Socks5Stream::connect(proxy_addr, target).await
        };

        result
            .map(|_| ())
            .map_err(|e| format!("SOCKS5 connect failed: {}", e))
    }
}

#[async_trait]
impl Prober for ConnectProber {
    #[instrument(skip(self, endpoint), fields(proxy_id = endpoint.id, address = %endpoint.address()))]
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult {
        let started = Instant::now();

        let outcome = match endpoint.protocol {
            ProxyProtocol::Http | ProxyProtocol::Https => self.probe_http(endpoint).await,
            ProxyProtocol::Socks5 => self.probe_socks5(endpoint).await,
        };

        match outcome {
            Ok(()) => {
                let latency = started.elapsed();
                debug!(latency_ms = latency.as_millis() as u64, "Probe succeeded");
                Ok(latency)
            }
            Err(reason) => {
                debug!(%reason, "Probe failed");
                Err(reason)
            }
        }
    }
}
