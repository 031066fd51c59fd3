//! UDP datagram transport.

use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::errors::HarnessError;

/// Text datagrams over one bound UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `addr`, e.g. `"0.0.0.0:9001"`.
    pub async fn bind(addr: &str) -> Result<Self, HarnessError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(addr = %socket.local_addr()?, "UDP socket bound");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HarnessError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<(), HarnessError> {
        self.socket.send_to(payload, addr).await?;
        Ok(())
    }

    /// Receive one datagram, keeping at most `max_read` bytes of it.
    pub async fn recv(&self, max_read: usize) -> Result<(Vec<u8>, SocketAddr), HarnessError> {
        let mut buf = vec![0u8; max_read];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }
}

/// Resolve `host:port` to the first address DNS returns.
pub async fn resolve(addr: &str) -> Result<SocketAddr, HarnessError> {
    let mut addrs = lookup_host(addr).await.map_err(|e| HarnessError::Resolve {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;
    addrs.next().ok_or_else(|| HarnessError::Resolve {
        addr: addr.to_string(),
        reason: "no addresses returned".to_string(),
    })
}
