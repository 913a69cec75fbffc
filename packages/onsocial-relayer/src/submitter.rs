//! Transaction Submitter: one signed `FunctionCall` per attempt.

use near_crypto::PublicKey;
use near_gas::NearGas;
use near_primitives::hash::CryptoHash;
use near_primitives::transaction::{
    Action, FunctionCallAction, SignedTransaction, Transaction, TransactionV0,
};
use near_primitives::types::AccountId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chain::{ChainClient, ChainOutcome, SubmitError};
use crate::config::Config;
use crate::key_pool::KeyGuard;
use crate::request::RelayRequest;

/// One try to land a request with one key and one nonce.
#[derive(Debug, Clone)]
pub struct SubmissionAttempt {
    /// 1-based, counting every submission including nonce corrections.
    pub attempt: u32,
    pub public_key: PublicKey,
    /// `None` when the nonce could not be read from chain.
    pub nonce: Option<u64>,
    /// Known as soon as the transaction is signed.
    pub tx_hash: Option<String>,
    pub outcome: Result<ChainOutcome, SubmitError>,
}

impl SubmissionAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct Submitter {
    chain: Arc<dyn ChainClient>,
    contract_id: AccountId,
    method_name: String,
    gas: NearGas,
    attempt_timeout: Duration,
}

impl Submitter {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        contract_id: AccountId,
        method_name: String,
        gas: NearGas,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            contract_id,
            method_name,
            gas,
            attempt_timeout,
        }
    }

    pub fn from_config(config: &Config, chain: Arc<dyn ChainClient>) -> Result<Self, crate::Error> {
        Ok(Self::new(
            chain,
            config.contract_account()?,
            config.method_name.clone(),
            NearGas::from_tgas(config.gas_tgas),
            config.attempt_timeout(),
        ))
    }

    pub fn contract_id(&self) -> &AccountId {
        &self.contract_id
    }

    /// The single zero-deposit call carrying `{"request": ...}`.
    pub fn build_actions(&self, request: &RelayRequest) -> Vec<Action> {
        vec![Action::FunctionCall(Box::new(FunctionCallAction {
            method_name: self.method_name.clone(),
            args: request.to_call_args(),
            gas: self.gas.as_gas(),
            deposit: 0,
        }))]
    }

    pub fn sign(
        &self,
        key: &KeyGuard,
        nonce: u64,
        block_hash: CryptoHash,
        request: &RelayRequest,
    ) -> SignedTransaction {
        let signer = key.signer();
        Transaction::V0(TransactionV0 {
            signer_id: signer.get_account_id().clone(),
            public_key: signer.public_key(),
            nonce,
            receiver_id: self.contract_id.clone(),
            block_hash,
            actions: self.build_actions(request),
        })
        .sign(signer)
    }

    /// Sign with the key's current nonce and submit, bounded by the
    /// per-attempt timeout. Never touches the key's cached nonce; the caller
    /// decides how to release the key.
    pub async fn submit(
        &self,
        request: &RelayRequest,
        key: &KeyGuard,
        attempt: u32,
    ) -> SubmissionAttempt {
        let mut record = SubmissionAttempt {
            attempt,
            public_key: key.public_key(),
            nonce: None,
            tx_hash: None,
            outcome: Err(SubmitError::Timeout),
        };

        let nonce = match self.bounded(key.next_nonce(), "nonce query").await {
            Ok(n) => n,
            Err(e) => {
                record.outcome = Err(e);
                return record;
            }
        };
        record.nonce = Some(nonce);

        let block_hash = match self
            .bounded(self.chain.latest_block_hash(), "block hash query")
            .await
        {
            Ok(h) => h,
            Err(e) => {
                record.outcome = Err(e);
                return record;
            }
        };

        let signed_tx = self.sign(key, nonce, block_hash, request);
        let tx_hash = signed_tx.get_hash().to_string();
        record.tx_hash = Some(tx_hash.clone());
        debug!(
            attempt,
            key = %record.public_key,
            nonce,
            tx_hash = %tx_hash,
            "Submitting transaction"
        );

        record.outcome =
            match tokio::time::timeout(self.attempt_timeout, self.chain.submit(signed_tx)).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    warn!(
                        attempt,
                        key = %record.public_key,
                        nonce,
                        tx_hash = %tx_hash,
                        "Submission timed out, outcome unknown"
                    );
                    Err(SubmitError::Timeout)
                }
            };
        record
    }

    /// Pre-submission reads are plain RPC failures when they run out of
    /// time: nothing was sent yet.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, SubmitError>>,
        what: &str,
    ) -> Result<T, SubmitError> {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SubmitError::TransientRpc(format!("{what} timed out"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::Scripted;
    use crate::key_pool::tests::make_test_pool;
    use crate::key_pool::Release;
    use crate::request::validate;
    use near_primitives::borsh;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn request() -> RelayRequest {
        validate(
            &json!({
                "target_account": "alice.testnet",
                "action": { "type": "set", "data": { "profile/name": "Alice" } },
                "auth": { "type": "direct" },
            }),
            1024,
        )
        .unwrap()
    }

    fn submitter(chain: Arc<dyn ChainClient>, timeout: Duration) -> Submitter {
        Submitter::new(
            chain,
            "core.onsocial.testnet".parse().unwrap(),
            "execute".into(),
            NearGas::from_tgas(100),
            timeout,
        )
    }

    #[test]
    fn test_actions_wrap_request_in_execute_call() {
        let (_, chain) = make_test_pool(1, 0, Duration::from_secs(1));
        let s = submitter(chain, Duration::from_secs(1));
        let actions = s.build_actions(&request());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::FunctionCall(call) => {
                assert_eq!(call.method_name, "execute");
                assert_eq!(call.gas, NearGas::from_tgas(100).as_gas());
                assert_eq!(call.deposit, 0);
                let args: serde_json::Value = serde_json::from_slice(&call.args).unwrap();
                assert_eq!(args["request"]["target_account"], "alice.testnet");
                assert_eq!(args["request"]["auth"]["type"], "direct");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signs_with_cached_nonce_and_lands() {
        let (pool, chain) = make_test_pool(1, 5, Duration::from_secs(1));
        let s = submitter(chain.clone(), Duration::from_secs(1));
        let key = pool.acquire().await.unwrap();

        let attempt = s.submit(&request(), &key, 1).await;
        assert!(attempt.succeeded());
        assert_eq!(attempt.nonce, Some(6));
        assert_eq!(attempt.tx_hash, attempt.outcome.as_ref().ok().map(|o| o.tx_hash.clone()));
        assert_eq!(chain.landed(), vec![(key.public_key(), 6)]);
        // The submitter leaves nonce bookkeeping to the release.
        assert_eq!(key.cached_nonce(), Some(6));
        key.release(Release::Landed);
    }

    #[tokio::test]
    async fn test_signature_verifies_against_key() {
        let (pool, chain) = make_test_pool(1, 0, Duration::from_secs(1));
        let s = submitter(chain, Duration::from_secs(1));
        let key = pool.acquire().await.unwrap();

        let tx = s.sign(&key, 1, CryptoHash::default(), &request());
        let bytes = borsh::to_vec(&tx.transaction).unwrap();
        let hash = CryptoHash::hash_bytes(&bytes);
        assert!(tx.signature.verify(hash.as_ref(), &key.public_key()));
        assert_eq!(tx.transaction.receiver_id().as_str(), "core.onsocial.testnet");
    }

    #[tokio::test]
    async fn test_stale_nonce_surfaces_mismatch() {
        let (pool, chain) = make_test_pool(1, 5, Duration::from_secs(1));
        let s = submitter(chain.clone(), Duration::from_secs(1));
        let key = pool.acquire().await.unwrap();
        key.next_nonce().await.unwrap();
        // Someone else used the key behind our back.
        chain.set_nonce(&key.public_key(), 9);

        let attempt = s.submit(&request(), &key, 1).await;
        assert!(matches!(attempt.outcome, Err(SubmitError::NonceMismatch(_))));
        assert!(chain.landed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_rpc_becomes_timeout_with_hash() {
        let (pool, chain) = make_test_pool(1, 0, Duration::from_secs(1));
        chain.script([Scripted::Hang]);
        let s = submitter(chain, Duration::from_millis(300));
        let key = pool.acquire().await.unwrap();

        let attempt = s.submit(&request(), &key, 1).await;
        assert_eq!(attempt.outcome, Err(SubmitError::Timeout));
        assert!(attempt.tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_chain_is_transient() {
        let (pool, chain) = make_test_pool(1, 0, Duration::from_secs(1));
        chain.reachable.store(false, Ordering::SeqCst);
        let s = submitter(chain.clone(), Duration::from_secs(1));
        let key = pool.acquire().await.unwrap();

        let attempt = s.submit(&request(), &key, 1).await;
        assert!(matches!(attempt.outcome, Err(SubmitError::TransientRpc(_))));
        assert_eq!(attempt.nonce, None);
        assert_eq!(chain.submissions.load(Ordering::SeqCst), 0);
    }
}
