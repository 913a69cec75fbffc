//! Drain Coordinator: stop leasing keys, wait for leases to come back.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::Health;
use crate::key_pool::KeyPool;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every lease was released within the window.
    pub drained: bool,
    /// Leases still out when the coordinator gave up.
    pub remaining: usize,
}

pub struct DrainCoordinator {
    health: Arc<Health>,
    pool: Arc<KeyPool>,
    timeout: Duration,
}

impl DrainCoordinator {
    pub fn new(health: Arc<Health>, pool: Arc<KeyPool>, timeout: Duration) -> Self {
        Self {
            health,
            pool,
            timeout,
        }
    }

    /// Wait for the shutdown signal, then drain.
    pub async fn run(&self, shutdown: CancellationToken) -> DrainReport {
        shutdown.cancelled().await;
        self.drain().await
    }

    /// Flip to `Draining` (readiness fails from here on), close the pool and
    /// wait up to the drain window for in-flight submissions to finish.
    pub async fn drain(&self) -> DrainReport {
        self.health.begin_drain();
        self.pool.close();
        info!(
            in_flight = self.pool.in_flight(),
            timeout_secs = self.timeout.as_secs(),
            "Draining in-flight transactions"
        );

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let in_flight = self.pool.in_flight();
            if in_flight == 0 {
                info!("All in-flight transactions drained");
                return DrainReport {
                    drained: true,
                    remaining: 0,
                };
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = in_flight,
                    "Drain timeout, outcome of remaining transactions unknown"
                );
                return DrainReport {
                    drained: false,
                    remaining: in_flight,
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
