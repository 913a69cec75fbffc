//! Key slot and RAII lease types.

use near_crypto::{PublicKey, Signer};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::nonce::{self, NonceCell};
use super::KeyPool;
use crate::chain::SubmitError;

/// A single key slot in the pool. Created once at startup, never removed.
pub struct KeySlot {
    pub(crate) signer: Signer,
    pub(crate) nonce: NonceCell,
    pub(crate) busy: AtomicBool,
    /// Logical acquisition counter; lowest free value is least recently used.
    pub(crate) last_use_seq: AtomicU64,
    pub(crate) last_used_ms: AtomicU64,
}

impl KeySlot {
    pub(crate) fn new(signer: Signer) -> Self {
        Self {
            signer,
            nonce: NonceCell::unknown(),
            busy: AtomicBool::new(false),
            last_use_seq: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(0),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }
}

/// How a lease ended, from the nonce's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// A transaction signed with the cached nonce was included.
    Landed,
    /// Nothing was included; the cached nonce is still the next one.
    NotLanded,
    /// A transaction may or may not land later. Re-read the nonce from chain.
    Unknown,
}

/// RAII lease from [`KeyPool::acquire`]. Exactly one exists per busy slot.
///
/// Dropping without [`KeyGuard::release`] counts as [`Release::Unknown`].
pub struct KeyGuard {
    pub(crate) pool: Arc<KeyPool>,
    pub(crate) slot: Arc<KeySlot>,
    pub(crate) index: usize,
    released: bool,
    // Dropped after `Drop::drop` has returned the slot to the free list.
    _permit: OwnedSemaphorePermit,
}

impl KeyGuard {
    pub(crate) fn new(
        pool: Arc<KeyPool>,
        slot: Arc<KeySlot>,
        index: usize,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            slot,
            index,
            released: false,
            _permit: permit,
        }
    }

    pub fn signer(&self) -> &Signer {
        &self.slot.signer
    }

    pub fn public_key(&self) -> PublicKey {
        self.slot.public_key()
    }

    pub fn slot_index(&self) -> usize {
        self.index
    }

    /// Cached next nonce, if known.
    pub fn cached_nonce(&self) -> Option<u64> {
        self.slot.nonce.get()
    }

    /// The nonce to sign with, fetched from chain on first use or after the
    /// cache was invalidated.
    pub async fn next_nonce(&self) -> Result<u64, SubmitError> {
        if let Some(next) = self.slot.nonce.get() {
            return Ok(next);
        }
        let next = nonce::fetch_next(
            self.pool.chain.as_ref(),
            &self.pool.account_id,
            &self.slot.public_key(),
        )
        .await?;
        self.slot.nonce.set(next);
        Ok(next)
    }

    /// Forget the cached nonce so the next [`KeyGuard::next_nonce`] reads
    /// the chain again. Used after a nonce mismatch.
    pub fn refresh_nonce(&self) {
        debug!(key = %self.public_key(), "Nonce cache invalidated");
        self.slot.nonce.invalidate();
    }

    /// Hand the key back, recording what happened to its nonce.
    pub fn release(mut self, outcome: Release) {
        self.settle(outcome);
    }

    fn settle(&mut self, outcome: Release) {
        self.released = true;
        match outcome {
            Release::Landed => self.slot.nonce.advance(),
            Release::NotLanded => {}
            Release::Unknown => self.slot.nonce.invalidate(),
        }
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never the signer: it holds the secret key.
        f.debug_struct("KeyGuard")
            .field("slot", &self.index)
            .field("public_key", &self.public_key())
            .field("cached_nonce", &self.cached_nonce())
            .finish()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if !self.released {
            self.settle(Release::Unknown);
        }
        self.slot.busy.store(false, Ordering::Release);
        self.pool.return_slot(self.index);
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
