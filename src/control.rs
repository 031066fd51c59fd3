//! Run-state control driven by `start` / `stop` / `kill` datagrams.
//!
//! ```text
//! any     + start -> Running   (wakes one task blocked in wait_for_start)
//! any     + stop  -> Stopped
//! any     + kill  -> Killed    (terminal)
//! Killed  + *     -> Killed
//! ```

use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use crate::metrics::CONTROL_SIGNALS;

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const KILL: &str = "kill";

/// Process-wide run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Stopped,
    Killed,
}

/// A control literal received from any sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Start,
    Stop,
    Kill,
}

impl ControlSignal {
    /// Exact, case-sensitive match against the three literals.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"start" => Some(ControlSignal::Start),
            b"stop" => Some(ControlSignal::Stop),
            b"kill" => Some(ControlSignal::Kill),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Start => START,
            ControlSignal::Stop => STOP,
            ControlSignal::Kill => KILL,
        }
    }
}

/// Owner of the control state. Mutated only through [`apply`](Self::apply).
#[derive(Debug)]
pub struct ControlStateMachine {
    state: watch::Sender<ControlState>,
    started: Notify,
}

impl ControlStateMachine {
    pub fn new(initial: ControlState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            started: Notify::new(),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControlState::Running
    }

    /// Apply a signal and return the resulting state.
    pub fn apply(&self, signal: ControlSignal) -> ControlState {
        CONTROL_SIGNALS.with_label_values(&[signal.as_str()]).inc();

        let mut terminal = false;
        self.state.send_if_modified(|state| {
            if *state == ControlState::Killed {
                terminal = true;
                return false;
            }
            let next = match signal {
                ControlSignal::Start => ControlState::Running,
                ControlSignal::Stop => ControlState::Stopped,
                ControlSignal::Kill => ControlState::Killed,
            };
            let changed = *state != next;
            *state = next;
            changed
        });

        if terminal {
            warn!(signal = signal.as_str(), "Control signal ignored, process is being killed");
            return ControlState::Killed;
        }

        match signal {
            ControlSignal::Start => {
                info!("START signal received, now running");
                self.started.notify_one();
            }
            ControlSignal::Stop => info!("STOP signal received, now stopped"),
            ControlSignal::Kill => {
                info!("KILL signal received, shutting down");
                self.started.notify_waiters();
            }
        }
        self.state()
    }

    /// Block while the state is `Stopped`. Returns the state that ended the wait.
    pub async fn wait_for_start(&self) -> ControlState {
        loop {
            let notified = self.started.notified();
            match self.state() {
                ControlState::Stopped => notified.await,
                other => return other,
            }
        }
    }

    /// Resolves once the state becomes `Killed`.
    pub async fn killed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while borrowed.
        let _ = rx.wait_for(|state| *state == ControlState::Killed).await;
    }
}

impl Default for ControlStateMachine {
    fn default() -> Self {
        Self::new(ControlState::Running)
    }
}
