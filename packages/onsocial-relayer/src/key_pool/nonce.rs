//! Per-key cached nonce.

use near_crypto::PublicKey;
use near_primitives::types::AccountId;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::chain::{ChainClient, SubmitError};

/// Sentinel for "not fetched yet". Chain nonces start at 0, so the next
/// nonce to sign with is always at least 1.
const UNKNOWN: u64 = 0;

/// The next nonce a key will sign with, or unknown.
///
/// Only the current lease holder writes it; readers are diagnostics.
pub(crate) struct NonceCell(AtomicU64);

impl NonceCell {
    pub(crate) fn unknown() -> Self {
        Self(AtomicU64::new(UNKNOWN))
    }

    pub(crate) fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            UNKNOWN => None,
            next => Some(next),
        }
    }

    pub(crate) fn set(&self, next: u64) {
        self.0.store(next, Ordering::Release);
    }

    /// One transaction consumed the cached nonce.
    pub(crate) fn advance(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                UNKNOWN => None,
                n => Some(n + 1),
            });
    }

    pub(crate) fn invalidate(&self) {
        self.0.store(UNKNOWN, Ordering::Release);
    }
}

/// Ask the chain for the key's nonce and return the next one to sign with.
pub(crate) async fn fetch_next(
    chain: &dyn ChainClient,
    account_id: &AccountId,
    public_key: &PublicKey,
) -> Result<u64, SubmitError> {
    let on_chain = chain.access_key_nonce(account_id, public_key).await?;
    debug!(key = %public_key, nonce = on_chain, "Fetched access key nonce");
    Ok(on_chain + 1)
}
