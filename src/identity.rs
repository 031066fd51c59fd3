//! Stable hash of the local network identity, used as the first half of every
//! correlation key.

use std::env;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;
use tracing::debug;

use crate::errors::HarnessError;

/// CRC-32 (IEEE) over the 16-byte form of `ip`; IPv4 is hashed IPv4-mapped.
pub fn identity_hash(ip: IpAddr) -> u32 {
    let octets = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    };
    crc32fast::hash(&octets)
}

/// Resolve this host's first IP address.
///
/// Uses `HOSTNAME` when set, otherwise the socket's bound address. An unspecified
/// bind address (`0.0.0.0`) without a hostname is an error.
pub async fn local_ip(bound: SocketAddr) -> Result<IpAddr, HarnessError> {
    match env::var("HOSTNAME") {
        Ok(hostname) if !hostname.trim().is_empty() => {
            let target = format!("{}:0", hostname.trim());
            let mut addrs = lookup_host(&target)
                .await
                .map_err(|e| HarnessError::Resolve {
                    addr: hostname.clone(),
                    reason: e.to_string(),
                })?;
            let ip = addrs
                .next()
                .map(|addr| addr.ip())
                .ok_or_else(|| HarnessError::Resolve {
                    addr: hostname.clone(),
                    reason: "no addresses returned".to_string(),
                })?;
            debug!(hostname = %hostname, ip = %ip, "Resolved local identity");
            Ok(ip)
        }
        _ if !bound.ip().is_unspecified() => Ok(bound.ip()),
        _ => Err(HarnessError::Resolve {
            addr: bound.to_string(),
            reason: "HOSTNAME is not set and the socket is bound to an unspecified address"
                .to_string(),
        }),
    }
}
