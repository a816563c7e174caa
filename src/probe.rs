// Readiness probe - waits for a Source dedicated server to answer queries

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

/// A2S_INFO request packet
const A2S_INFO: &[u8] = b"\xFF\xFF\xFF\xFFTSource Engine Query\0";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to open query socket: {0}")]
    Socket(#[from] std::io::Error),
}

/// Proof that the game server answered a status query.
///
/// Only [`wait_until_reachable`] hands these out, so anything that takes one
/// cannot run before the server is up.
#[derive(Debug)]
pub struct ServerReachable {
    addr: SocketAddr,
}

impl ServerReachable {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Block until the server at `addr` answers. Retries forever.
    async fn wait(&self, addr: SocketAddr) -> Result<(), ProbeError>;
}

/// Wait for the server and return the proof of reachability
pub async fn wait_until_reachable(
    probe: &dyn ReadinessProbe,
    addr: SocketAddr,
) -> Result<ServerReachable, ProbeError> {
    tracing::info!("Waiting for the server at {} to come online...", addr);
    probe.wait(addr).await?;
    tracing::info!("Server is online!");
    Ok(ServerReachable { addr })
}

/// Polls with A2S_INFO over UDP. Any reply, including a challenge, counts.
pub struct A2sProbe {
    pub interval: Duration,
    pub reply_timeout: Duration,
}

impl Default for A2sProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl ReadinessProbe for A2sProbe {
    async fn wait(&self, addr: SocketAddr) -> Result<(), ProbeError> {
        let local: SocketAddr = match addr.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        let mut buf = [0u8; 1400];
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            if let Err(e) = socket.send_to(A2S_INFO, addr).await {
                tracing::debug!("A2S query to {} failed to send: {}", addr, e);
            } else {
                match tokio::time::timeout(self.reply_timeout, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, from))) if from.ip() == addr.ip() && buf[..len].starts_with(&[0xFF; 4]) => {
                        tracing::debug!("A2S reply from {} after {} attempt(s)", from, attempts);
                        return Ok(());
                    }
                    Ok(Ok((_, from))) => {
                        tracing::debug!("Ignoring unexpected datagram from {}", from);
                    }
                    Ok(Err(e)) => tracing::debug!("A2S query to {} failed: {}", addr, e),
                    Err(_) => {}
                }
            }

            if attempts % 30 == 0 {
                tracing::info!("Still waiting for {} ({} queries sent)", addr, attempts);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
