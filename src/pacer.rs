//! Adaptive request pacing.
//!
//! Each process keeps one self-tuning timeout: the client for requests to its
//! frontend, the frontend for calls to its backend. Successes shrink it by 1/16,
//! a late match grows it by 1/4 and a hard timeout grows it by 1/10. Every result
//! is clamped to [`PacerBounds`], so the timeout is always strictly positive.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::metrics::PACER_TIMEOUT_MS;
use crate::utils::duration_ms;

/// Which side of the harness a pacer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacerRole {
    Client,
    Frontend,
}

impl PacerRole {
    pub fn label(&self) -> &'static str {
        match self {
            PacerRole::Client => "client",
            PacerRole::Frontend => "frontend",
        }
    }
}

/// Floor and ceiling applied after every adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerBounds {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PacerBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1),
            max: Duration::from_secs(60),
        }
    }
}

impl PacerBounds {
    fn clamp(&self, value: Duration) -> Duration {
        let min = self.min.max(Duration::from_nanos(1));
        value.clamp(min, self.max.max(min))
    }
}

/// A lock-protected adaptive timeout.
#[derive(Debug)]
pub struct AdaptivePacer {
    role: PacerRole,
    bounds: PacerBounds,
    timeout: Mutex<Duration>,
}

impl AdaptivePacer {
    pub fn new(role: PacerRole, initial: Duration, bounds: PacerBounds) -> Self {
        let initial = bounds.clamp(initial);
        PACER_TIMEOUT_MS
            .with_label_values(&[role.label()])
            .set(duration_ms(initial));
        Self {
            role,
            bounds,
            timeout: Mutex::new(initial),
        }
    }

    pub fn role(&self) -> PacerRole {
        self.role
    }

    pub fn bounds(&self) -> PacerBounds {
        self.bounds
    }

    /// The current timeout. Read it once per request and derive both the expiry
    /// deadline and the wait timer from that single value.
    pub fn current(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Multiplicative decrease: `t - t/16`.
    pub fn on_success(&self) -> Duration {
        self.adjust("success", |t| t - t / 16)
    }

    /// Growth after a response that matched but arrived past its expiry: `t + t/4`.
    pub fn on_late(&self) -> Duration {
        self.adjust("late", |t| t + t / 4)
    }

    /// Growth after no response at all before the timer fired: `t + t/10`.
    pub fn on_hard_timeout(&self) -> Duration {
        self.adjust("timeout", |t| t + t / 10)
    }

    fn adjust(&self, event: &'static str, f: impl FnOnce(Duration) -> Duration) -> Duration {
        let mut timeout = self.timeout.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *timeout;
        *timeout = self.bounds.clamp(f(previous));
        let updated = *timeout;
        drop(timeout);

        PACER_TIMEOUT_MS
            .with_label_values(&[self.role.label()])
            .set(duration_ms(updated));
        debug!(
            role = self.role.label(),
            event,
            previous_ms = duration_ms(previous),
            timeout_ms = duration_ms(updated),
            "Pacer adjusted"
        );
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(initial_ms: u64) -> AdaptivePacer {
        AdaptivePacer::new(
            PacerRole::Client,
            Duration::from_millis(initial_ms),
            PacerBounds::default(),
        )
    }

    #[test]
    fn success_shrinks_by_one_sixteenth() {
        let p = pacer(100);
        assert_eq!(p.on_success(), Duration::from_micros(93_750));
        assert_eq!(p.current(), Duration::from_micros(93_750));
    }

    #[test]
    fn late_grows_by_one_quarter() {
        let p = pacer(100);
        assert_eq!(p.on_late(), Duration::from_millis(125));
    }

    #[test]
    fn hard_timeout_grows_by_one_tenth() {
        let p = pacer(100);
        assert_eq!(p.on_hard_timeout(), Duration::from_millis(110));
    }

    #[test]
    fn successes_never_cross_the_floor() {
        let p = pacer(100);
        let mut previous = p.current();
        for _ in 0..1_000 {
            let next = p.on_success();
            assert!(next <= previous, "timeout increased on success");
            assert!(next >= p.bounds().min);
            assert!(!next.is_zero());
            previous = next;
        }
        assert_eq!(p.current(), p.bounds().min);
    }

    #[test]
    fn hard_timeouts_strictly_increase_below_ceiling() {
        let p = pacer(10);
        let mut previous = p.current();
        while previous < Duration::from_secs(30) {
            let next = p.on_hard_timeout();
            assert!(next > previous, "{:?} did not grow past {:?}", next, previous);
            previous = next;
        }
    }

    #[test]
    fn growth_stops_at_ceiling() {
        let bounds = PacerBounds {
            min: Duration::from_millis(1),
            max: Duration::from_millis(120),
        };
        let p = AdaptivePacer::new(PacerRole::Frontend, Duration::from_millis(100), bounds);
        p.on_hard_timeout();
        assert_eq!(p.on_late(), Duration::from_millis(120));
    }

    #[test]
    fn initial_value_is_clamped() {
        let p = AdaptivePacer::new(PacerRole::Client, Duration::ZERO, PacerBounds::default());
        assert_eq!(p.current(), Duration::from_millis(1));
    }
}
