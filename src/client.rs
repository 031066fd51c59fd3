//! The load-generating client.
//!
//! One receive task classifies every inbound datagram; the request loop paces
//! requests to the leased frontend:
//!
//! ```text
//! Stopped -> wait for start
//! lease valid   -> issue one request, race the pacer timeout against the echo
//! lease invalid -> renew with the load balancer
//! ```
//!
//! Pacer adjustments for echoes happen in the receive task (success or late);
//! the request loop only applies the hard-timeout growth when its timer wins.

use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ClientSettings, Config};
use crate::control::{ControlSignal, ControlState, ControlStateMachine};
use crate::correlation::{CorrelationIndex, CorrelationKey};
use crate::errors::HarnessError;
use crate::identity::{identity_hash, local_ip};
use crate::lease::{LeaseGrant, LeaseManager};
use crate::metrics::{
    LEASE_RENEWALS, OUTSTANDING_REQUESTS, REQUESTS_SENT, REQUEST_OUTCOMES, UNKNOWN_DATAGRAMS,
};
use crate::pacer::{AdaptivePacer, PacerBounds, PacerRole};
use crate::progress::{Progress, ProgressMarker};
use crate::transport::{resolve, UdpTransport};
use crate::utils::duration_ms;

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// What the request loop observed for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// An on-time echo resolved the request.
    Resolved,
    /// The local timer fired first.
    HardTimeout,
    /// There was no frontend to send to.
    NoLease,
}

/// How the receive task classified an echo from the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    OnTime,
    Late,
    Unmatched,
}

pub struct Client {
    settings: ClientSettings,
    identity: u32,
    transport: Arc<UdpTransport>,
    pacer: AdaptivePacer,
    index: CorrelationIndex,
    lease: LeaseManager,
    control: Arc<ControlStateMachine>,
    resolved_tx: mpsc::UnboundedSender<String>,
    resolved_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    progress: Progress,
}

impl Client {
    /// Bind the client port, resolve the load balancer and the local identity.
    pub async fn connect(config: &Config) -> Result<Arc<Self>, HarnessError> {
        let transport =
            Arc::new(UdpTransport::bind(&format!("0.0.0.0:{}", config.client.port)).await?);
        let load_balancer = resolve(&config.load_balancer).await?;
        let ip = local_ip(transport.local_addr()?).await?;

        info!(
            load_balancer = %load_balancer,
            local_ip = %ip,
            port = config.client.port,
            "Client initialized"
        );
        Ok(Self::new(
            config.client.clone(),
            config.pacer,
            transport,
            load_balancer,
            identity_hash(ip),
        ))
    }

    pub fn new(
        settings: ClientSettings,
        bounds: PacerBounds,
        transport: Arc<UdpTransport>,
        load_balancer: SocketAddr,
        identity: u32,
    ) -> Arc<Self> {
        let initial_state = if settings.start_stopped {
            ControlState::Stopped
        } else {
            ControlState::Running
        };
        let control = Arc::new(ControlStateMachine::new(initial_state));
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            pacer: AdaptivePacer::new(PacerRole::Client, settings.initial_timeout, bounds),
            index: CorrelationIndex::new(),
            lease: LeaseManager::new(transport.clone(), load_balancer, control.clone()),
            progress: Progress::new(settings.progress),
            settings,
            identity,
            transport,
            control,
            resolved_tx,
            resolved_rx: Mutex::new(resolved_rx),
        })
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HarnessError> {
        self.transport.local_addr()
    }

    pub fn pacer(&self) -> &AdaptivePacer {
        &self.pacer
    }

    pub fn index(&self) -> &CorrelationIndex {
        &self.index
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn control(&self) -> &ControlStateMachine {
        &self.control
    }

    /// Start the receive task.
    pub fn spawn_receiver(self: &Arc<Self>) -> JoinHandle<Result<(), HarnessError>> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.receive_loop().await })
    }

    async fn receive_loop(self: Arc<Self>) -> Result<(), HarnessError> {
        loop {
            let (payload, from) = self.transport.recv(self.settings.max_read).await?;
            self.handle_datagram(&payload, from);
        }
    }

    fn handle_datagram(self: &Arc<Self>, payload: &[u8], from: SocketAddr) {
        if let Some(signal) = ControlSignal::parse(payload) {
            self.control.apply(signal);
            return;
        }

        let text = String::from_utf8_lossy(payload);

        if from == self.lease.load_balancer() {
            self.accept_grant(&text);
            return;
        }

        if Some(from) == self.lease.frontend() {
            if self.resolve_echo(&text, Instant::now()) == EchoOutcome::Unmatched {
                debug!(key = %text, "Echo matched no outstanding request");
            }
            return;
        }

        UNKNOWN_DATAGRAMS.inc();
        info!(from = %from, payload = %text, "Unknown message received");
    }

    /// Install a grant as soon as it arrives. Hostname grants are resolved off
    /// the receive task so echoes are not held up behind DNS.
    fn accept_grant(self: &Arc<Self>, text: &str) {
        let grant = match LeaseGrant::parse(text) {
            Ok(grant) => grant,
            Err(e) => {
                LEASE_RENEWALS.with_label_values(&["rejected"]).inc();
                warn!(error = %e, payload = %text, "Discarding malformed lease grant");
                return;
            }
        };

        if let Some(lease) = grant.literal() {
            self.lease.deliver(lease);
            return;
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            match grant.resolve().await {
                Ok(lease) => client.lease.deliver(lease),
                Err(e) => {
                    LEASE_RENEWALS.with_label_values(&["rejected"]).inc();
                    warn!(error = %e, "Discarding lease grant with unresolvable frontend");
                }
            }
        });
    }

    /// Take `key` out of the index and apply the matching pacer adjustment.
    pub fn resolve_echo(&self, key: &str, now: Instant) -> EchoOutcome {
        let Some(expiry) = self.index.take(key) else {
            return EchoOutcome::Unmatched;
        };
        OUTSTANDING_REQUESTS.set(self.index.len() as i64);

        if expiry > now {
            let timeout = self.pacer.on_success();
            REQUEST_OUTCOMES.with_label_values(&["success"]).inc();
            self.progress.mark(ProgressMarker::Success);
            debug!(key = %key, timeout_ms = duration_ms(timeout), "Request succeeded");
            // The receiver lives in `self`, so this only fails during teardown.
            let _ = self.resolved_tx.send(key.to_string());
            EchoOutcome::OnTime
        } else {
            let timeout = self.pacer.on_late();
            REQUEST_OUTCOMES.with_label_values(&["late"]).inc();
            self.progress.mark(ProgressMarker::Late);
            debug!(
                key = %key,
                late_by_ms = duration_ms(now.duration_since(expiry)),
                timeout_ms = duration_ms(timeout),
                "Late response"
            );
            EchoOutcome::Late
        }
    }

    /// Issue one request with key `<identity> <counter>` to the leased frontend.
    pub async fn request(&self, counter: u64) -> Result<RequestOutcome, HarnessError> {
        let Some(frontend) = self.lease.frontend() else {
            return Ok(RequestOutcome::NoLease);
        };

        let key = CorrelationKey::new(self.identity, counter).to_string();
        let timeout = self.pacer.current();
        let expiry = Instant::now() + timeout;

        self.index.put(key.clone(), expiry);
        OUTSTANDING_REQUESTS.set(self.index.len() as i64);
        self.progress.mark(ProgressMarker::Sent);
        self.transport.send_to(key.as_bytes(), frontend).await?;
        REQUESTS_SENT.inc();

        let mut resolved = self.resolved_rx.lock().await;
        let timer = time::sleep_until(expiry);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                // An echo already judged on time wins over a timer that is
                // also ready.
                biased;

                Some(resolved_key) = resolved.recv() => {
                    if resolved_key == key {
                        debug!(key = %key, "Request resolved");
                        return Ok(RequestOutcome::Resolved);
                    }
                    debug!(key = %resolved_key, "Ignoring resolution of an earlier request");
                }
                _ = &mut timer => {
                    while let Ok(resolved_key) = resolved.try_recv() {
                        if resolved_key == key {
                            debug!(key = %key, "Request resolved at its deadline");
                            return Ok(RequestOutcome::Resolved);
                        }
                    }
                    let timeout = self.pacer.on_hard_timeout();
                    REQUEST_OUTCOMES.with_label_values(&["timeout"]).inc();
                    self.progress.mark(ProgressMarker::Timeout);
                    info!(key = %key, timeout_ms = duration_ms(timeout), "Request timed out");
                    return Ok(RequestOutcome::HardTimeout);
                }
            }
        }
    }

    /// Run until killed. Transport failures end the run with an error.
    pub async fn run(self: Arc<Self>) -> Result<(), HarnessError> {
        let mut receiver = self.spawn_receiver();
        info!(identity = self.identity, "Start requesting");

        let result = tokio::select! {
            _ = self.control.killed() => Ok(()),
            result = self.request_loop() => result,
            joined = &mut receiver => match joined {
                Ok(result) => result,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
            },
        };

        receiver.abort();
        if let Err(e) = &result {
            error!(error = %e, "Client stopped");
        }
        result
    }

    async fn request_loop(&self) -> Result<(), HarnessError> {
        let mut counter: u64 = 0;
        let mut last_purge = Instant::now();

        loop {
            match self.control.state() {
                ControlState::Killed => return Ok(()),
                ControlState::Stopped => {
                    if self.control.wait_for_start().await == ControlState::Killed {
                        return Ok(());
                    }
                    continue;
                }
                ControlState::Running => {}
            }

            if self.lease.is_valid(Utc::now()) {
                self.request(counter).await?;
                counter += 1;

                if last_purge.elapsed() >= PURGE_INTERVAL {
                    self.purge_stale_entries();
                    last_purge = Instant::now();
                }
            } else {
                info!("Lease ran out");
                self.lease
                    .renew(true, self.settings.lease_retry_timeout)
                    .await?;
            }
        }
    }

    fn purge_stale_entries(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.settings.late_entry_grace) else {
            return;
        };
        let purged = self.index.purge_expired_before(cutoff);
        if purged > 0 {
            OUTSTANDING_REQUESTS.set(self.index.len() as i64);
            debug!(purged, "Purged unanswered requests");
        }
    }
}
