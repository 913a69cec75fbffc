//! Fixed-size pool of NEAR function-call access keys.
//!
//! One semaphore permit per slot bounds concurrency to the pool size. A
//! caller that cannot get a permit within the acquisition timeout gets
//! [`RelayError::PoolExhausted`]; nothing queues beyond that.

mod nonce;
mod slot;

pub use slot::{KeyGuard, KeySlot, Release};

use near_crypto::Signer;
use near_primitives::types::AccountId;
use slot::now_ms;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::error::RelayError;
use crate::key_store::Credential;
use crate::response::KeyStats;

/// The key pool.
pub struct KeyPool {
    pub(crate) account_id: AccountId,
    pub(crate) chain: Arc<dyn ChainClient>,
    slots: Vec<Arc<KeySlot>>,
    /// Indices of idle slots. Its length always equals the available permits.
    free: Mutex<Vec<usize>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    use_seq: AtomicU64,
}

impl KeyPool {
    /// Build a pool from an ordered list of signers for one account.
    pub fn new(
        account_id: AccountId,
        signers: Vec<Signer>,
        chain: Arc<dyn ChainClient>,
        acquire_timeout: Duration,
    ) -> Result<Arc<Self>, crate::Error> {
        if signers.is_empty() {
            return Err(crate::Error::KeyPool("Key pool cannot be empty".into()));
        }
        if let Some(other) = signers
            .iter()
            .find(|s| s.get_account_id().clone() != account_id)
        {
            return Err(crate::Error::KeyPool(format!(
                "Signer {} belongs to {}, not {account_id}",
                other.public_key(),
                other.get_account_id()
            )));
        }

        let slots: Vec<Arc<KeySlot>> = signers
            .into_iter()
            .map(|signer| Arc::new(KeySlot::new(signer)))
            .collect();
        let size = slots.len();

        info!(keys = size, account = %account_id, "Key pool initialized");

        Ok(Arc::new(Self {
            account_id,
            chain,
            slots,
            free: Mutex::new((0..size).collect()),
            permits: Arc::new(Semaphore::new(size)),
            acquire_timeout,
            use_seq: AtomicU64::new(0),
        }))
    }

    pub fn from_credentials(
        credentials: Vec<Credential>,
        chain: Arc<dyn ChainClient>,
        acquire_timeout: Duration,
    ) -> Result<Arc<Self>, crate::Error> {
        let account_id = credentials
            .first()
            .map(|c| c.account_id.clone())
            .ok_or_else(|| crate::Error::KeyPool("No credentials loaded".into()))?;
        let signers = credentials
            .into_iter()
            .map(|c| near_crypto::InMemorySigner::from_secret_key(c.account_id, c.secret_key))
            .collect();
        Self::new(account_id, signers, chain, acquire_timeout)
    }

    // --- Hot path ---

    /// Lease the least recently used free key, waiting up to the configured
    /// acquisition timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<KeyGuard, RelayError> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Like [`KeyPool::acquire`], waiting at most `min(limit, acquire_timeout)`.
    pub async fn acquire_within(self: &Arc<Self>, limit: Duration) -> Result<KeyGuard, RelayError> {
        if self.permits.is_closed() {
            return Err(RelayError::Draining);
        }

        let wait = limit.min(self.acquire_timeout);
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match tokio::time::timeout(wait, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(RelayError::Draining),
            Err(_elapsed) => {
                warn!(waited_ms = wait.as_millis() as u64, "Key pool exhausted");
                return Err(RelayError::PoolExhausted);
            }
        };

        let index = self.take_lru().ok_or(RelayError::PoolExhausted)?;
        let slot = Arc::clone(&self.slots[index]);
        slot.busy.store(true, Ordering::Release);
        let seq = self.use_seq.fetch_add(1, Ordering::Relaxed) + 1;
        slot.last_use_seq.store(seq, Ordering::Relaxed);
        slot.last_used_ms.store(now_ms(), Ordering::Relaxed);
        debug!(slot = index, key = %slot.public_key(), "Key acquired");

        Ok(KeyGuard::new(Arc::clone(self), slot, index, permit))
    }

    /// Pop the free slot with the oldest use; ties go to the lower index.
    fn take_lru(&self) -> Option<usize> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        let pos = free
            .iter()
            .enumerate()
            .min_by_key(|(_, &idx)| (self.slots[idx].last_use_seq.load(Ordering::Relaxed), idx))
            .map(|(pos, _)| pos)?;
        Some(free.swap_remove(pos))
    }

    pub(crate) fn return_slot(&self, index: usize) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(index);
    }

    /// Stop handing out keys. Leases already out are unaffected.
    pub fn close(&self) {
        if !self.permits.is_closed() {
            info!(in_flight = self.in_flight(), "Key pool closed for draining");
            self.permits.close();
        }
    }

    // --- Diagnostics ---

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.busy.load(Ordering::Acquire))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn relayer_account(&self) -> &AccountId {
        &self.account_id
    }

    pub fn key_stats(&self) -> Vec<KeyStats> {
        self.slots
            .iter()
            .map(|s| KeyStats {
                public_key: s.public_key().to_string(),
                nonce: s.nonce.get(),
                busy: s.busy.load(Ordering::Acquire),
                last_used_ms: s.last_used_ms.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// --- Test helpers (shared across module tests) ---

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::tests::MockChain;
    use near_crypto::{InMemorySigner, KeyType, SecretKey};
    use std::collections::HashSet;

    pub(crate) const TEST_ACCOUNT: &str = "relayer.testnet";

    pub(crate) fn make_test_signer(n: u8) -> Signer {
        InMemorySigner::from_secret_key(
            TEST_ACCOUNT.parse().unwrap(),
            SecretKey::from_seed(KeyType::ED25519, &format!("pool-key-{n}")),
        )
    }

    /// Pool of `n` keys, each registered on the mock chain at `nonce`.
    pub(crate) fn make_test_pool(
        n: u8,
        nonce: u64,
        acquire_timeout: Duration,
    ) -> (Arc<KeyPool>, Arc<MockChain>) {
        let signers: Vec<Signer> = (0..n).map(make_test_signer).collect();
        let chain = signers
            .iter()
            .fold(MockChain::new(), |chain, s| chain.with_key(s.public_key(), nonce));
        let chain = Arc::new(chain);
        let pool = KeyPool::new(
            TEST_ACCOUNT.parse().unwrap(),
            signers,
            chain.clone(),
            acquire_timeout,
        )
        .unwrap();
        (pool, chain)
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let chain = Arc::new(MockChain::new());
        let result = KeyPool::new(
            TEST_ACCOUNT.parse().unwrap(),
            vec![],
            chain,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(crate::Error::KeyPool(_))));
    }

    #[test]
    fn test_foreign_signer_is_rejected() {
        let chain = Arc::new(MockChain::new());
        let foreign = InMemorySigner::from_secret_key(
            "someone.testnet".parse().unwrap(),
            SecretKey::from_seed(KeyType::ED25519, "foreign"),
        );
        let result = KeyPool::new(
            TEST_ACCOUNT.parse().unwrap(),
            vec![make_test_signer(0), foreign],
            chain,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_credentials_keeps_order() {
        let json = crate::key_store::tests::credential_json(TEST_ACCOUNT, &["a", "b"]);
        let creds = crate::key_store::parse_credentials(json.to_string().as_bytes()).unwrap();
        let expected: Vec<String> = creds.iter().map(|c| c.public_key.to_string()).collect();

        let pool = KeyPool::from_credentials(
            creds,
            Arc::new(MockChain::new()),
            Duration::from_secs(1),
        )
        .unwrap();
        let keys: Vec<String> = pool.key_stats().into_iter().map(|k| k.public_key).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_acquire_marks_busy_and_drop_frees() {
        let (pool, _) = make_test_pool(3, 0, Duration::from_secs(1));
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.available(), 2);
        drop(guard);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_lru_rotates_through_all_keys() {
        let (pool, _) = make_test_pool(3, 0, Duration::from_secs(1));
        let mut seen = Vec::new();
        for _ in 0..6 {
            let guard = pool.acquire().await.unwrap();
            seen.push(guard.slot_index());
            guard.release(Release::NotLanded);
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_lru_prefers_longest_idle_key() {
        let (pool, _) = make_test_pool(3, 0, Duration::from_secs(1));
        let g0 = pool.acquire().await.unwrap();
        let g1 = pool.acquire().await.unwrap();
        let g2 = pool.acquire().await.unwrap();
        // Release in reverse: slot 0 was used first, so it is still the LRU.
        drop(g2);
        drop(g1);
        drop(g0);
        assert_eq!(pool.acquire().await.unwrap().slot_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_caller_gets_pool_exhausted() {
        let (pool, _) = make_test_pool(2, 0, Duration::from_millis(500));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, RelayError::PoolExhausted);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(pool.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_caller_gets_freed_key() {
        let (pool, _) = make_test_pool(1, 0, Duration::from_secs(5));
        let held = pool.acquire().await.unwrap();
        let index = held.slot_index();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|g| g.slot_index()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        held.release(Release::Landed);
        assert_eq!(waiter.await.unwrap().unwrap(), index);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_caps_the_wait() {
        let (pool, _) = make_test_pool(1, 0, Duration::from_secs(5));
        let _held = pool.acquire().await.unwrap();
        let started = tokio::time::Instant::now();
        let err = pool.acquire_within(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, RelayError::PoolExhausted);
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_nonce_is_fetched_lazily_once() {
        let (pool, chain) = make_test_pool(1, 5, Duration::from_secs(1));
        assert_eq!(pool.key_stats()[0].nonce, None);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.next_nonce().await.unwrap(), 6);
        assert_eq!(guard.next_nonce().await.unwrap(), 6);
        assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 1);
        guard.release(Release::Landed);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.next_nonce().await.unwrap(), 7);
        assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_outcomes_drive_the_nonce() {
        let (pool, chain) = make_test_pool(1, 5, Duration::from_secs(1));

        let guard = pool.acquire().await.unwrap();
        let before = guard.next_nonce().await.unwrap();
        guard.release(Release::Landed);
        assert_eq!(pool.key_stats()[0].nonce, Some(before + 1));

        let guard = pool.acquire().await.unwrap();
        guard.release(Release::NotLanded);
        assert_eq!(pool.key_stats()[0].nonce, Some(before + 1));

        let guard = pool.acquire().await.unwrap();
        guard.release(Release::Unknown);
        assert_eq!(pool.key_stats()[0].nonce, None);

        // Next lease re-reads the chain.
        chain.set_nonce(&make_test_signer(0).public_key(), 9);
        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.next_nonce().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_refresh_nonce_rereads_chain() {
        let (pool, chain) = make_test_pool(1, 5, Duration::from_secs(1));
        let guard = pool.acquire().await.unwrap();
        assert_eq!(guard.next_nonce().await.unwrap(), 6);

        chain.set_nonce(&guard.public_key(), 20);
        guard.refresh_nonce();
        assert_eq!(guard.next_nonce().await.unwrap(), 21);
    }

    #[tokio::test]
    async fn test_dropped_guard_counts_as_unknown() {
        let (pool, _) = make_test_pool(1, 5, Duration::from_secs(1));
        let guard = pool.acquire().await.unwrap();
        guard.next_nonce().await.unwrap();
        drop(guard);
        assert_eq!(pool.key_stats()[0].nonce, None);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_new_leases() {
        let (pool, _) = make_test_pool(2, 0, Duration::from_secs(1));
        let held = pool.acquire().await.unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.acquire().await.unwrap_err(), RelayError::Draining);

        // Outstanding lease still releases cleanly.
        assert_eq!(pool.in_flight(), 1);
        held.release(Release::NotLanded);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_leases_never_share_key_and_nonce() {
        let (pool, _) = make_test_pool(4, 100, Duration::from_secs(5));
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let guard = pool.acquire().await.unwrap();
                let pair = (guard.public_key(), guard.next_nonce().await.unwrap());
                tokio::task::yield_now().await;
                guard.release(Release::Landed);
                pair
            }));
        }

        let mut pairs = HashSet::new();
        for task in tasks {
            assert!(pairs.insert(task.await.unwrap()), "duplicate (key, nonce)");
        }
        assert_eq!(pairs.len(), 64);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_guard_debug_shows_public_key_only() {
        let (pool, _) = make_test_pool(1, 5, Duration::from_secs(1));
        let guard = pool.acquire().await.unwrap();
        let rendered = format!("{guard:?}");

        assert!(rendered.contains(&guard.public_key().to_string()));
        let secret = SecretKey::from_seed(KeyType::ED25519, "pool-key-0").to_string();
        assert!(!rendered.contains(&secret));
        guard.release(Release::NotLanded);
    }
}
