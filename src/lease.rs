//! Frontend leases granted by the load balancer.
//!
//! A lease assigns the client to one frontend until an expiry instant. The
//! client checks validity before every request and, once the lease has run out,
//! renews it by sending `new_lease` to the load balancer until a grant arrives.
//! Every grant replaces the current lease the moment it is received, solicited
//! or not.
//!
//! Grant datagram: `<host:port> <timestamp>`, where the timestamp is Unix-date
//! style (`Mon Jan  2 15:04:05 UTC 2006`). The zone abbreviation is read as UTC.
//! RFC 3339 timestamps are accepted as well.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::control::ControlStateMachine;
use crate::errors::{HarnessError, ProtocolError};
use crate::metrics::LEASE_RENEWALS;
use crate::transport::{resolve, UdpTransport};

/// Literal sent to the load balancer to request a lease.
pub const NEW_LEASE: &str = "new_lease";

/// Unix-date layout used on the wire.
pub const LEASE_TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Z %Y";

/// A time-bounded assignment to one frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub frontend: SocketAddr,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// True iff `now` is strictly before the expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// A grant as parsed from the wire, before its address is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub frontend: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaseGrant {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut tokens = payload.split(' ');
        let frontend = tokens
            .next()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::EmptyLease)?;

        match frontend.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(ProtocolError::InvalidAddress(frontend.to_string())),
        }

        let timestamp = tokens.collect::<Vec<_>>().join(" ");
        Ok(Self {
            frontend: frontend.to_string(),
            expires_at: parse_lease_timestamp(&timestamp)?,
        })
    }

    /// The lease, when the frontend is an IP literal and needs no DNS.
    pub fn literal(&self) -> Option<Lease> {
        self.frontend.parse::<SocketAddr>().ok().map(|frontend| Lease {
            frontend,
            expires_at: self.expires_at,
        })
    }

    /// Resolve the frontend address. IP literals skip DNS.
    pub async fn resolve(self) -> Result<Lease, ProtocolError> {
        if let Some(lease) = self.literal() {
            return Ok(lease);
        }
        let frontend = resolve(&self.frontend)
            .await
            .map_err(|_| ProtocolError::InvalidAddress(self.frontend.clone()))?;
        Ok(Lease {
            frontend,
            expires_at: self.expires_at,
        })
    }
}

pub fn parse_lease_timestamp(s: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let trimmed = s.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, LEASE_TIMESTAMP_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ProtocolError::InvalidTimestamp(s.to_string()))
}

pub fn format_lease_timestamp(at: DateTime<Utc>) -> String {
    at.format("%a %b %e %H:%M:%S UTC %Y").to_string()
}

/// Owns the client's current lease and the renewal handshake.
#[derive(Debug)]
pub struct LeaseManager {
    current: RwLock<Option<Lease>>,
    granted_tx: mpsc::Sender<()>,
    granted_rx: Mutex<mpsc::Receiver<()>>,
    transport: Arc<UdpTransport>,
    load_balancer: SocketAddr,
    control: Arc<ControlStateMachine>,
}

impl LeaseManager {
    pub fn new(
        transport: Arc<UdpTransport>,
        load_balancer: SocketAddr,
        control: Arc<ControlStateMachine>,
    ) -> Self {
        let (granted_tx, granted_rx) = mpsc::channel(1);
        Self {
            current: RwLock::new(None),
            granted_tx,
            granted_rx: Mutex::new(granted_rx),
            transport,
            load_balancer,
            control,
        }
    }

    pub fn load_balancer(&self) -> SocketAddr {
        self.load_balancer
    }

    pub fn current(&self) -> Option<Lease> {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frontend(&self) -> Option<SocketAddr> {
        self.current().map(|lease| lease.frontend)
    }

    /// False while no lease has ever been granted.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.current().map_or(false, |lease| lease.is_valid_at(now))
    }

    /// Replace the lease wholesale.
    pub fn install(&self, lease: Lease) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(lease);
    }

    /// Install a grant from the receive loop and wake a pending renewal.
    /// Never blocks.
    pub fn deliver(&self, lease: Lease) {
        self.install(lease);
        LEASE_RENEWALS.with_label_values(&["granted"]).inc();
        info!(
            frontend = %lease.frontend,
            expires_at = %lease.expires_at,
            "New frontend lease received"
        );
        // A full slot already holds a wakeup.
        let _ = self.granted_tx.try_send(());
    }

    /// Request a new lease until one is granted.
    ///
    /// Each attempt sends `new_lease` and waits `per_attempt` for a grant. There is
    /// no attempt cap: the loop only ends on a grant, when `retry` is false, or when
    /// the control state leaves `Running`. Returns whether a grant arrived.
    pub async fn renew(&self, retry: bool, per_attempt: Duration) -> Result<bool, HarnessError> {
        let mut granted = self.granted_rx.lock().await;
        // Wakeups from grants installed before this renewal started.
        while granted.try_recv().is_ok() {}

        while retry && self.control.is_running() {
            self.transport
                .send_to(NEW_LEASE.as_bytes(), self.load_balancer)
                .await?;
            info!(load_balancer = %self.load_balancer, "New lease request");

            tokio::select! {
                woken = granted.recv() => return Ok(woken.is_some()),
                _ = tokio::time::sleep(per_attempt) => {
                    LEASE_RENEWALS.with_label_values(&["timeout"]).inc();
                    warn!(timeout_ms = per_attempt.as_millis() as u64, "Lease request timed out");
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_unix_date_grant() {
        let grant = LeaseGrant::parse("10.0.0.5:9000 Mon Jan  2 15:04:05 UTC 2006").unwrap();
        assert_eq!(grant.frontend, "10.0.0.5:9000");
        assert_eq!(
            grant.expires_at,
            Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap()
        );
    }

    #[test]
    fn parses_rfc3339_grant() {
        let grant = LeaseGrant::parse("frontend-1:9000 2030-05-01T12:00:00Z").unwrap();
        assert_eq!(grant.frontend, "frontend-1:9000");
        assert_eq!(
            grant.expires_at,
            Utc.with_ymd_and_hms(2030, 5, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn format_and_parse_agree() {
        let at = Utc.with_ymd_and_hms(2031, 11, 7, 8, 9, 10).unwrap();
        assert_eq!(parse_lease_timestamp(&format_lease_timestamp(at)).unwrap(), at);
    }

    #[test]
    fn rejects_malformed_grants() {
        assert_eq!(LeaseGrant::parse(""), Err(ProtocolError::EmptyLease));
        assert!(matches!(
            LeaseGrant::parse("nowhere Mon Jan  2 15:04:05 UTC 2006"),
            Err(ProtocolError::InvalidAddress(_))
        ));
        assert!(matches!(
            LeaseGrant::parse("10.0.0.5:9000 yesterday-ish"),
            Err(ProtocolError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            LeaseGrant::parse("10.0.0.5:9000"),
            Err(ProtocolError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn validity_is_strictly_before_expiry() {
        let expires_at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let lease = Lease {
            frontend: "10.0.0.5:9000".parse().unwrap(),
            expires_at,
        };
        assert!(lease.is_valid_at(expires_at - chrono::Duration::milliseconds(1)));
        assert!(!lease.is_valid_at(expires_at));
        assert!(!lease.is_valid_at(expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn hostname_grant_is_not_literal() {
        let grant = LeaseGrant::parse("frontend-1:9000 2030-05-01T12:00:00Z").unwrap();
        assert!(grant.literal().is_none());
        let grant = LeaseGrant::parse("10.0.0.5:9000 2030-05-01T12:00:00Z").unwrap();
        assert_eq!(
            grant.literal().map(|lease| lease.frontend),
            Some("10.0.0.5:9000".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn resolve_ip_literal_grant() {
        let grant = LeaseGrant::parse("127.0.0.1:9000 2030-05-01T12:00:00Z").unwrap();
        let lease = grant.resolve().await.unwrap();
        assert_eq!(lease.frontend, "127.0.0.1:9000".parse().unwrap());
    }
}
