//! Application state shared across handlers.

use crate::chain::ChainClient;
use crate::config::Config;
use crate::health::Health;
use crate::key_pool::KeyPool;
use crate::relay::Relay;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub relay: Relay,
    pub chain: Arc<dyn ChainClient>,
    pub health: Arc<Health>,
    pub start_time: Instant,
    pub request_count: AtomicU64,
}

impl AppState {
    /// Wire the relay over an already built pool. The instance starts in
    /// `Starting`; the caller marks it ready once the chain answers.
    pub fn new(
        config: Config,
        chain: Arc<dyn ChainClient>,
        pool: Arc<KeyPool>,
    ) -> Result<Self, crate::Error> {
        let relay = Relay::from_config(&config, pool, chain.clone())?;

        info!(
            account = %relay.pool().relayer_account(),
            contract = %relay.contract_id(),
            keys = relay.pool().size(),
            "Relayer state initialized"
        );

        Ok(Self {
            config,
            relay,
            chain,
            health: Arc::new(Health::new()),
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        self.relay.pool()
    }
}
