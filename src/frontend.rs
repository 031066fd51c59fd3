//! The frontend proxy tier.
//!
//! On startup the frontend announces itself to the load balancer with
//! `frontend_up` and receives its backend address in reply. From then on every
//! datagram from a client is a request key: the frontend calls the backend,
//! racing the call against its own adaptive timeout, and echoes the key back to
//! the client only when the backend answered 200 in time.
//!
//! Later load balancer datagrams are status lines (`OK:<client>:<client>...`),
//! each acknowledged with `ACK`.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FrontendSettings};
use crate::control::{ControlSignal, ControlStateMachine};
use crate::errors::{BackendError, ErrorCategory, HarnessError};
use crate::metrics::{BACKEND_ERRORS_BY_CATEGORY, PROXY_OUTCOMES};
use crate::pacer::{AdaptivePacer, PacerBounds, PacerRole};
use crate::transport::{resolve, UdpTransport};
use crate::utils::duration_ms;

/// Sent to the load balancer once at startup.
pub const FRONTEND_UP: &str = "frontend_up";

/// Reply to every load balancer status line.
pub const ACK: &str = "ACK";

/// The backend endpoint: resolves to an HTTP status code.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self) -> Result<u16, BackendError>;
}

/// `GET http://<address><path>` through reqwest.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    pub fn new(address: &str, path: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: format!("http://{}{}", address.trim(), path),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self) -> Result<u16, BackendError> {
        let mut response = self.client.get(&self.url).send().await?;
        let status = response.status().as_u16();
        // Drain the body so the connection can be reused.
        while let Ok(Some(_chunk)) = response.chunk().await {}
        Ok(status)
    }
}

/// A status line from the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbStatus {
    pub status: String,
    pub clients: Vec<String>,
}

impl LbStatus {
    pub fn parse(text: &str) -> Self {
        let mut parts = text.trim().split(':');
        let status = parts.next().unwrap_or("").to_string();
        let clients = parts
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self { status, clients }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Result of one proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Backend answered 200 in time; the key was echoed to the client.
    Forwarded,
    /// Backend answered in time with another status; nothing was sent.
    Rejected(u16),
    /// The pacer deadline passed first.
    TimedOut,
    /// The backend call failed outright.
    BackendFailed,
}

/// Announce this frontend and wait for the backend address.
///
/// `frontend_up` is re-sent every `retry` until the load balancer answers.
/// Datagrams from other senders are ignored meanwhile.
pub async fn handshake(
    transport: &UdpTransport,
    load_balancer: SocketAddr,
    max_read: usize,
    retry: Duration,
) -> Result<String, HarnessError> {
    loop {
        transport
            .send_to(FRONTEND_UP.as_bytes(), load_balancer)
            .await?;
        info!(load_balancer = %load_balancer, "Announced frontend");

        let answer = time::timeout(retry, async {
            loop {
                let (payload, from) = transport.recv(max_read).await?;
                if from == load_balancer {
                    return Ok::<_, HarnessError>(String::from_utf8_lossy(&payload).trim().to_string());
                }
                debug!(from = %from, "Ignoring datagram before handshake completed");
            }
        })
        .await;

        match answer {
            Ok(Ok(backend)) if !backend.is_empty() => {
                info!(backend = %backend, "GOT MSG: load_balancer");
                return Ok(backend);
            }
            Ok(Ok(_)) => warn!("Load balancer sent an empty backend address"),
            Ok(Err(e)) => return Err(e),
            Err(_) => warn!(
                retry_ms = retry.as_millis() as u64,
                "No answer from load balancer, announcing again"
            ),
        }
    }
}

pub struct Frontend {
    settings: FrontendSettings,
    transport: Arc<UdpTransport>,
    load_balancer: SocketAddr,
    pacer: AdaptivePacer,
    backend: Arc<dyn Backend>,
    control: ControlStateMachine,
    clients: StdMutex<Vec<String>>,
    fatal_tx: mpsc::UnboundedSender<HarnessError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<HarnessError>>,
}

impl Frontend {
    /// Bind, complete the load balancer handshake and build the HTTP backend.
    pub async fn connect(config: &Config) -> Result<Arc<Self>, HarnessError> {
        let settings = config.frontend.clone();
        let transport =
            Arc::new(UdpTransport::bind(&format!("0.0.0.0:{}", settings.port)).await?);
        let load_balancer = resolve(&config.load_balancer).await?;

        let backend_addr = handshake(
            &transport,
            load_balancer,
            settings.max_read,
            settings.handshake_retry,
        )
        .await?;
        let backend = HttpBackend::new(&backend_addr, &settings.backend_path)
            .map_err(|e| HarnessError::Handshake(e.to_string()))?;
        info!(url = %backend.url(), "Backend configured");

        Ok(Self::new(
            settings,
            config.pacer,
            transport,
            load_balancer,
            Arc::new(backend),
        ))
    }

    pub fn new(
        settings: FrontendSettings,
        bounds: PacerBounds,
        transport: Arc<UdpTransport>,
        load_balancer: SocketAddr,
        backend: Arc<dyn Backend>,
    ) -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pacer: AdaptivePacer::new(PacerRole::Frontend, settings.initial_timeout, bounds),
            settings,
            transport,
            load_balancer,
            backend,
            control: ControlStateMachine::default(),
            clients: StdMutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HarnessError> {
        self.transport.local_addr()
    }

    pub fn pacer(&self) -> &AdaptivePacer {
        &self.pacer
    }

    pub fn control(&self) -> &ControlStateMachine {
        &self.control
    }

    /// Clients named by the last `OK` status line.
    pub fn known_clients(&self) -> Vec<String> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn spawn_receiver(self: &Arc<Self>) -> JoinHandle<Result<(), HarnessError>> {
        let frontend = Arc::clone(self);
        tokio::spawn(async move { frontend.receive_loop().await })
    }

    async fn receive_loop(self: Arc<Self>) -> Result<(), HarnessError> {
        loop {
            let (payload, from) = self.transport.recv(self.settings.max_read).await?;
            self.handle_datagram(payload, from).await?;
        }
    }

    async fn handle_datagram(
        self: &Arc<Self>,
        payload: Vec<u8>,
        from: SocketAddr,
    ) -> Result<(), HarnessError> {
        if let Some(signal) = ControlSignal::parse(&payload) {
            self.control.apply(signal);
            return Ok(());
        }

        if from == self.load_balancer {
            return self.handle_status(&String::from_utf8_lossy(&payload)).await;
        }

        if !self.control.is_running() {
            PROXY_OUTCOMES.with_label_values(&["dropped"]).inc();
            debug!(from = %from, "Frontend stopped, dropping request");
            return Ok(());
        }

        debug!(key = %String::from_utf8_lossy(&payload), from = %from, "Sending request to backend");
        let frontend = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = frontend.proxy(&payload, from).await {
                // The receiver lives in `frontend`, so this only fails during teardown.
                let _ = frontend.fatal_tx.send(e);
            }
        });
        Ok(())
    }

    async fn handle_status(&self, text: &str) -> Result<(), HarnessError> {
        self.transport
            .send_to(ACK.as_bytes(), self.load_balancer)
            .await?;

        let status = LbStatus::parse(text);
        if status.is_ok() {
            info!(clients = status.clients.len(), "Load balancer status OK");
            *self.clients.lock().unwrap_or_else(PoisonError::into_inner) = status.clients;
        } else {
            info!(status = %status.status, "GOT MSG: load_balancer");
        }
        Ok(())
    }

    /// Race one backend call against the pacer's current timeout.
    ///
    /// The deadline is captured once at the start. A call still running at the
    /// deadline is dropped.
    pub async fn proxy(&self, key: &[u8], from: SocketAddr) -> Result<ProxyOutcome, HarnessError> {
        let deadline = self.pacer.current();

        match time::timeout(deadline, self.backend.call()).await {
            Ok(Ok(200)) => {
                self.transport.send_to(key, from).await?;
                if self.settings.shrink_on_success {
                    self.pacer.on_success();
                }
                PROXY_OUTCOMES.with_label_values(&["forwarded"]).inc();
                Ok(ProxyOutcome::Forwarded)
            }
            Ok(Ok(status)) => {
                PROXY_OUTCOMES.with_label_values(&["rejected"]).inc();
                let category = ErrorCategory::from_status_code(status)
                    .unwrap_or(ErrorCategory::OtherError);
                debug!(status, category = %category, "Backend rejected request");
                Ok(ProxyOutcome::Rejected(status))
            }
            Ok(Err(e)) => {
                let timeout = self.pacer.on_hard_timeout();
                PROXY_OUTCOMES.with_label_values(&["backend_error"]).inc();
                BACKEND_ERRORS_BY_CATEGORY
                    .with_label_values(&[e.category().label()])
                    .inc();
                warn!(error = %e, timeout_ms = duration_ms(timeout), "Backend call failed");
                Ok(ProxyOutcome::BackendFailed)
            }
            Err(_) => {
                let timeout = self.pacer.on_hard_timeout();
                PROXY_OUTCOMES.with_label_values(&["timeout"]).inc();
                info!(
                    deadline_ms = duration_ms(deadline),
                    timeout_ms = duration_ms(timeout),
                    "timeout"
                );
                Ok(ProxyOutcome::TimedOut)
            }
        }
    }

    /// Serve until killed or a transport failure.
    pub async fn run(self: Arc<Self>) -> Result<(), HarnessError> {
        let mut receiver = self.spawn_receiver();
        let mut fatal = self.fatal_rx.lock().await;
        info!(load_balancer = %self.load_balancer, "Frontend serving");

        let result = tokio::select! {
            _ = self.control.killed() => Ok(()),
            Some(e) = fatal.recv() => Err(e),
            joined = &mut receiver => match joined {
                Ok(result) => result,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
            },
        };

        receiver.abort();
        if let Err(e) = &result {
            error!(error = %e, "Frontend stopped");
        }
        result
    }
}
