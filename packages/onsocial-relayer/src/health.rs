//! Lifecycle state consumed by the load balancer's readiness probe.

use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

const STARTING: u8 = 0;
const READY: u8 = 1;
const DRAINING: u8 = 2;
const STOPPED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Pool not yet populated or RPC not yet confirmed.
    Starting,
    Ready,
    /// Shutdown started; no new leases.
    Draining,
    Stopped,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            STARTING => Lifecycle::Starting,
            READY => Lifecycle::Ready,
            DRAINING => Lifecycle::Draining,
            _ => Lifecycle::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Ready => "ready",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// Forward-only lifecycle: Starting → Ready → Draining → Stopped.
/// A transition to an earlier state is ignored.
#[derive(Debug)]
pub struct Health {
    state: AtomicU8,
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

impl Health {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STARTING),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only `Ready` passes the readiness probe.
    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub fn mark_ready(&self) -> bool {
        self.advance(READY)
    }

    pub fn begin_drain(&self) -> bool {
        self.advance(DRAINING)
    }

    pub fn mark_stopped(&self) -> bool {
        self.advance(STOPPED)
    }

    /// Returns whether the state changed.
    fn advance(&self, to: u8) -> bool {
        let prev = self.state.fetch_max(to, Ordering::AcqRel);
        if prev < to {
            info!(
                from = Lifecycle::from_u8(prev).as_str(),
                to = Lifecycle::from_u8(to).as_str(),
                "Lifecycle transition"
            );
            true
        } else {
            false
        }
    }
}
