//! NEAR JSON-RPC client with primary → fallback failover and circuit breaker.
//!
//! Only transport-level failures fail over. A node that answered with a
//! handler error has spoken for the chain; that answer is classified, not
//! retried elsewhere.

use async_trait::async_trait;
use near_crypto::PublicKey;
use near_jsonrpc_client::errors::{
    JsonRpcError, JsonRpcServerError, JsonRpcServerResponseStatusError,
    JsonRpcTransportSendError, RpcTransportError,
};
use near_jsonrpc_client::methods;
use near_jsonrpc_client::JsonRpcClient;
use near_jsonrpc_primitives::types::query::QueryResponseKind;
use near_jsonrpc_primitives::types::transactions::RpcTransactionError;
use near_primitives::errors::{ActionErrorKind, FunctionCallError, InvalidTxError, TxExecutionError};
use near_primitives::hash::CryptoHash;
use near_primitives::transaction::SignedTransaction;
use near_primitives::types::{AccountId, BlockReference, Finality};
use near_primitives::views::{FinalExecutionOutcomeView, FinalExecutionStatus, QueryRequest};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainOutcome, SubmitError, TxStatus};
use crate::metrics::METRICS;

/// Cached block hash TTL.
const BLOCK_HASH_TTL_SECS: u64 = 30;

const CIRCUIT_BREAKER_THRESHOLD: u64 = 5;
const CIRCUIT_BREAKER_WINDOW_MS: u64 = 30_000;

struct CircuitState {
    failures: u64,
    last_failure_ms: u64,
    open: bool,
}

pub struct RpcClient {
    primary: JsonRpcClient,
    fallback: JsonRpcClient,
    primary_url: String,
    fallback_url: String,
    circuit: Mutex<CircuitState>,
    total_failovers: AtomicU64,
    cached_block_hash: RwLock<Option<(CryptoHash, Instant)>>,
    block_hash_stale: AtomicBool,
}

impl RpcClient {
    pub fn new(primary_url: &str, fallback_url: &str) -> Self {
        info!(
            primary = primary_url,
            fallback = fallback_url,
            "RPC client initialized with failover"
        );
        Self {
            primary: JsonRpcClient::connect(primary_url),
            fallback: JsonRpcClient::connect(fallback_url),
            primary_url: primary_url.to_string(),
            fallback_url: fallback_url.to_string(),
            circuit: Mutex::new(CircuitState {
                failures: 0,
                last_failure_ms: 0,
                open: false,
            }),
            total_failovers: AtomicU64::new(0),
            cached_block_hash: RwLock::new(None),
            block_hash_stale: AtomicBool::new(false),
        }
    }

    // --- Failover / circuit breaker ---

    /// Active client (primary unless circuit is open).
    fn active(&self) -> &JsonRpcClient {
        if self.is_circuit_open() {
            &self.fallback
        } else {
            &self.primary
        }
    }

    fn record_success(&self) {
        let mut circuit = self.circuit.lock().unwrap_or_else(|e| e.into_inner());
        if circuit.failures > 0 {
            info!(primary = %self.primary_url, "Primary RPC recovered");
            circuit.failures = 0;
            circuit.open = false;
        }
    }

    fn record_failure(&self) {
        METRICS.rpc_errors.fetch_add(1, Ordering::Relaxed);
        let mut circuit = self.circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit.failures += 1;
        circuit.last_failure_ms = now_ms();
        if circuit.failures >= CIRCUIT_BREAKER_THRESHOLD && !circuit.open {
            circuit.open = true;
            self.total_failovers.fetch_add(1, Ordering::Relaxed);
            METRICS.rpc_failovers.fetch_add(1, Ordering::Relaxed);
            // Fallback may have a different chain head
            self.block_hash_stale.store(true, Ordering::Relaxed);
            warn!(
                failures = circuit.failures,
                fallback = %self.fallback_url,
                "Circuit breaker opened, routing to fallback"
            );
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        let mut circuit = self.circuit.lock().unwrap_or_else(|e| e.into_inner());
        if !circuit.open {
            return false;
        }
        if now_ms().saturating_sub(circuit.last_failure_ms) > CIRCUIT_BREAKER_WINDOW_MS {
            circuit.open = false;
            circuit.failures = 0;
            info!(primary = %self.primary_url, "Circuit breaker half-open, retrying primary");
            return false;
        }
        true
    }

    fn is_fallback(&self, client: &JsonRpcClient) -> bool {
        std::ptr::eq(client, &self.fallback)
    }

    /// Invalidate the cached block hash, e.g. after `Expired` rejections.
    pub fn mark_block_hash_stale(&self) {
        self.block_hash_stale.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn access_key_nonce(
        &self,
        account_id: &AccountId,
        public_key: &PublicKey,
    ) -> Result<u64, SubmitError> {
        let make_request = || methods::query::RpcQueryRequest {
            block_reference: BlockReference::Finality(Finality::Final),
            request: QueryRequest::ViewAccessKey {
                account_id: account_id.clone(),
                public_key: public_key.clone(),
            },
        };

        let client = self.active();
        let resp = match client.call(make_request()).await {
            Ok(r) => {
                self.record_success();
                r
            }
            Err(e) if e.handler_error().is_some() || self.is_fallback(client) => {
                return Err(SubmitError::TransientRpc(format!("access_key query failed: {e}")));
            }
            Err(e) => {
                self.record_failure();
                warn!(error = %e, "RPC access_key query failed, trying fallback");
                self.fallback.call(make_request()).await.map_err(|e2| {
                    SubmitError::TransientRpc(format!(
                        "access_key query failed: primary={e}, fallback={e2}"
                    ))
                })?
            }
        };

        match resp.kind {
            QueryResponseKind::AccessKey(ak) => Ok(ak.nonce),
            other => Err(SubmitError::TransientRpc(format!(
                "unexpected query response: {other:?}"
            ))),
        }
    }

    /// Recent block hash, served from cache while fresh (<30s).
    async fn latest_block_hash(&self) -> Result<CryptoHash, SubmitError> {
        if !self.block_hash_stale.load(Ordering::Relaxed) {
            let cache = self.cached_block_hash.read().await;
            if let Some((hash, when)) = *cache {
                if when.elapsed().as_secs() < BLOCK_HASH_TTL_SECS {
                    return Ok(hash);
                }
            }
        }

        let make_request = || methods::block::RpcBlockRequest {
            block_reference: BlockReference::Finality(Finality::Final),
        };
        let client = self.active();
        let block = match client.call(make_request()).await {
            Ok(b) => {
                self.record_success();
                b
            }
            Err(e) if self.is_fallback(client) => {
                return Err(SubmitError::TransientRpc(format!("block query failed: {e}")));
            }
            Err(e) => {
                self.record_failure();
                warn!(error = %e, "Primary RPC block query failed, trying fallback");
                self.fallback.call(make_request()).await.map_err(|e2| {
                    SubmitError::TransientRpc(format!(
                        "block query failed on both RPCs: primary={e}, fallback={e2}"
                    ))
                })?
            }
        };

        let hash = block.header.hash;
        let mut cache = self.cached_block_hash.write().await;
        *cache = Some((hash, Instant::now()));
        self.block_hash_stale.store(false, Ordering::Relaxed);
        Ok(hash)
    }

    /// `broadcast_tx_commit`: waits for the final outcome. The fallback gets
    /// the same signed transaction, so the chain accepts at most one of them.
    async fn submit(&self, signed_tx: SignedTransaction) -> Result<ChainOutcome, SubmitError> {
        let tx_hash = signed_tx.get_hash();
        let client = self.active();
        // Set when the primary may have broadcast before its connection failed.
        let mut primary_unconfirmed = None;
        let result = match client
            .call(methods::broadcast_tx_commit::RpcBroadcastTxCommitRequest {
                signed_transaction: signed_tx.clone(),
            })
            .await
        {
            Ok(outcome) => {
                self.record_success();
                Ok(outcome)
            }
            Err(e) if e.handler_error().is_some() || self.is_fallback(client) => Err(e),
            Err(e) => {
                self.record_failure();
                if broadcast_may_have_landed(&e) {
                    primary_unconfirmed = Some(e.to_string());
                }
                warn!(
                    error = %e,
                    tx_hash = %tx_hash,
                    "Primary broadcast_tx_commit failed, trying fallback"
                );
                self.fallback
                    .call(methods::broadcast_tx_commit::RpcBroadcastTxCommitRequest {
                        signed_transaction: signed_tx,
                    })
                    .await
            }
        };

        match result {
            Ok(outcome) => classify_outcome(outcome),
            Err(e) => {
                if let Some(RpcTransactionError::InvalidTransaction {
                    context: InvalidTxError::Expired,
                }) = e.handler_error()
                {
                    self.mark_block_hash_stale();
                }
                Err(match (primary_unconfirmed, classify_broadcast_error(&e)) {
                    // The primary's copy may be the one holding the nonce.
                    (
                        Some(primary),
                        SubmitError::NonceMismatch(_) | SubmitError::TransientRpc(_),
                    ) => SubmitError::Unconfirmed(primary),
                    (_, err) => err,
                })
            }
        }
    }

    /// Quick connectivity check. Returns "ok", "degraded", or error.
    async fn probe(&self) -> Result<&'static str, crate::Error> {
        let make_request = || methods::block::RpcBlockRequest {
            block_reference: BlockReference::Finality(Finality::Final),
        };
        match self.primary.call(make_request()).await {
            Ok(_) => Ok("ok"),
            Err(_) => match self.fallback.call(make_request()).await {
                Ok(_) => Ok("degraded"),
                Err(e) => Err(crate::Error::Rpc(format!("Both RPCs unreachable: {e}"))),
            },
        }
    }

    async fn tx_status(
        &self,
        tx_hash: CryptoHash,
        sender_id: &AccountId,
    ) -> Result<TxStatus, crate::Error> {
        let make_request = || methods::tx::RpcTransactionStatusRequest {
            transaction_info: methods::tx::TransactionInfo::TransactionId {
                tx_hash,
                sender_account_id: sender_id.clone(),
            },
            wait_until: near_primitives::views::TxExecutionStatus::Final,
        };

        let client = self.active();
        let result = match client.call(make_request()).await {
            Ok(r) => {
                self.record_success();
                Ok(r)
            }
            Err(e) if e.handler_error().is_some() || self.is_fallback(client) => Err(e),
            Err(e) => {
                self.record_failure();
                warn!(
                    error = %e,
                    tx_hash = %tx_hash,
                    "Primary tx status query failed, trying fallback"
                );
                self.fallback.call(make_request()).await
            }
        };

        match result {
            Ok(resp) => Ok(match resp.final_execution_outcome {
                Some(outcome) => match classify_outcome(outcome.into_outcome()) {
                    Ok(ChainOutcome { tx_hash, result }) => TxStatus::Succeeded { tx_hash, result },
                    Err(SubmitError::ChainRejected { error, .. }) => TxStatus::Failed {
                        tx_hash: tx_hash.to_string(),
                        error,
                    },
                    Err(_) => TxStatus::Pending,
                },
                None => TxStatus::Pending,
            }),
            Err(e) => match e.handler_error() {
                Some(RpcTransactionError::UnknownTransaction { .. })
                | Some(RpcTransactionError::TimeoutError) => Ok(TxStatus::Pending),
                _ => Err(crate::Error::Rpc(format!("tx_status failed: {e}"))),
            },
        }
    }

    fn active_endpoint(&self) -> String {
        if self.is_circuit_open() {
            self.fallback_url.clone()
        } else {
            self.primary_url.clone()
        }
    }

    fn failover_count(&self) -> u64 {
        self.total_failovers.load(Ordering::Relaxed)
    }
}

/// Map a final execution outcome to success or a landed rejection.
fn classify_outcome(outcome: FinalExecutionOutcomeView) -> Result<ChainOutcome, SubmitError> {
    let tx_hash = outcome.transaction_outcome.id.to_string();
    match outcome.status {
        FinalExecutionStatus::SuccessValue(bytes) => Ok(ChainOutcome {
            tx_hash,
            result: serde_json::from_slice(&bytes).ok(),
        }),
        FinalExecutionStatus::Failure(e) => Err(SubmitError::ChainRejected {
            error: execution_error_message(&e),
            tx_hash: Some(tx_hash),
        }),
        FinalExecutionStatus::Started | FinalExecutionStatus::NotStarted => {
            Err(SubmitError::Timeout)
        }
    }
}

/// The contract's own panic message when there is one, otherwise the
/// chain's description of the failure.
fn execution_error_message(e: &TxExecutionError) -> String {
    match e {
        TxExecutionError::ActionError(action) => match &action.kind {
            ActionErrorKind::FunctionCallError(FunctionCallError::ExecutionError(msg)) => {
                msg.clone()
            }
            _ => e.to_string(),
        },
        TxExecutionError::InvalidTxError(_) => e.to_string(),
    }
}

fn classify_broadcast_error(e: &JsonRpcError<RpcTransactionError>) -> SubmitError {
    match e.handler_error() {
        Some(RpcTransactionError::InvalidTransaction { context }) => classify_invalid_tx(context),
        Some(RpcTransactionError::TimeoutError)
        | Some(RpcTransactionError::RequestRouted { .. }) => SubmitError::Timeout,
        Some(_) => SubmitError::TransientRpc(e.to_string()),
        None if broadcast_may_have_landed(e) => SubmitError::Unconfirmed(e.to_string()),
        None => SubmitError::TransientRpc(e.to_string()),
    }
}

/// Whether a non-handler error could have happened after the node received
/// the transaction. Only failures that provably stopped before the node
/// (connect refused, rate limited, rejected request) say no.
fn broadcast_may_have_landed<E>(e: &JsonRpcError<E>) -> bool {
    match e {
        JsonRpcError::ServerError(JsonRpcServerError::HandlerError(_)) => false,
        JsonRpcError::TransportError(RpcTransportError::SendError(
            JsonRpcTransportSendError::PayloadSerializeError(_),
        )) => false,
        JsonRpcError::TransportError(RpcTransportError::SendError(
            JsonRpcTransportSendError::PayloadSendError(err),
        )) => !err.is_connect(),
        JsonRpcError::ServerError(JsonRpcServerError::RequestValidationError(_))
        | JsonRpcError::ServerError(JsonRpcServerError::ResponseStatusError(
            JsonRpcServerResponseStatusError::Unauthorized
            | JsonRpcServerResponseStatusError::TooManyRequests
            | JsonRpcServerResponseStatusError::BadRequest,
        )) => false,
        _ => true,
    }
}

/// Rejections before inclusion: the nonce was not consumed.
fn classify_invalid_tx(err: &InvalidTxError) -> SubmitError {
    match err {
        InvalidTxError::InvalidNonce { .. } | InvalidTxError::NonceTooLarge { .. } => {
            SubmitError::NonceMismatch(err.to_string())
        }
        // Re-signing against a fresh block hash or a calmer shard can succeed.
        InvalidTxError::Expired
        | InvalidTxError::ShardCongested { .. }
        | InvalidTxError::ShardStuck { .. } => SubmitError::TransientRpc(err.to_string()),
        // The relayer's own account or key is the problem, not the request.
        InvalidTxError::InvalidAccessKeyError(_)
        | InvalidTxError::InvalidSignerId { .. }
        | InvalidTxError::SignerDoesNotExist { .. }
        | InvalidTxError::InvalidSignature
        | InvalidTxError::NotEnoughBalance { .. }
        | InvalidTxError::LackBalanceForState { .. } => SubmitError::RelayerFault(err.to_string()),
        _ => SubmitError::ChainRejected {
            error: err.to_string(),
            tx_hash: None,
        },
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use axum::http::StatusCode;
    use near_primitives::errors::InvalidAccessKeyError;

    #[test]
    fn test_invalid_nonce_is_a_mismatch() {
        let err = classify_invalid_tx(&InvalidTxError::InvalidNonce {
            tx_nonce: 5,
            ak_nonce: 9,
        });
        assert!(matches!(err, SubmitError::NonceMismatch(_)));

        let err = classify_invalid_tx(&InvalidTxError::NonceTooLarge {
            tx_nonce: 10_000_000,
            upper_bound: 1_000,
        });
        assert!(matches!(err, SubmitError::NonceMismatch(_)));
    }

    #[test]
    fn test_expired_tx_is_retryable() {
        let err = classify_invalid_tx(&InvalidTxError::Expired);
        assert_eq!(err, SubmitError::TransientRpc(InvalidTxError::Expired.to_string()));
        assert!(!err.outcome_unknown());
    }

    #[test]
    fn test_relayer_account_problems_are_relayer_faults() {
        let relayer: AccountId = "relayer.testnet".parse().unwrap();
        let key = near_crypto::SecretKey::from_seed(near_crypto::KeyType::ED25519, "k")
            .public_key();
        let cases = [
            InvalidTxError::InvalidAccessKeyError(InvalidAccessKeyError::AccessKeyNotFound {
                account_id: relayer.clone(),
                public_key: Box::new(key),
            }),
            InvalidTxError::InvalidAccessKeyError(InvalidAccessKeyError::NotEnoughAllowance {
                account_id: relayer.clone(),
                public_key: Box::new(
                    near_crypto::SecretKey::from_seed(near_crypto::KeyType::ED25519, "k2")
                        .public_key(),
                ),
                allowance: 10,
                cost: 20,
            }),
            InvalidTxError::NotEnoughBalance {
                signer_id: relayer.clone(),
                balance: 1,
                cost: 2,
            },
            InvalidTxError::LackBalanceForState {
                signer_id: relayer.clone(),
                amount: 5,
            },
            InvalidTxError::SignerDoesNotExist { signer_id: relayer },
        ];
        for case in cases {
            let err = classify_invalid_tx(&case);
            assert_eq!(err, SubmitError::RelayerFault(case.to_string()), "{case:?}");
            assert_eq!(RelayError::from(err).status_code(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn test_request_level_refusal_is_rejected_without_hash() {
        let refusal = InvalidTxError::TransactionSizeExceeded {
            size: 5_000_000,
            limit: 4_194_304,
        };
        let err = classify_invalid_tx(&refusal);
        assert_eq!(
            err,
            SubmitError::ChainRejected {
                error: refusal.to_string(),
                tx_hash: None
            }
        );
        assert!(!err.nonce_consumed());
    }

    #[test]
    fn test_dropped_connection_after_send_is_unconfirmed() {
        let err: JsonRpcError<RpcTransactionError> =
            JsonRpcError::ServerError(JsonRpcServerError::InternalError { info: None });
        assert!(matches!(classify_broadcast_error(&err), SubmitError::Unconfirmed(_)));

        let err: JsonRpcError<RpcTransactionError> = JsonRpcError::ServerError(
            JsonRpcServerError::ResponseStatusError(JsonRpcServerResponseStatusError::TimeoutError),
        );
        assert!(classify_broadcast_error(&err).outcome_unknown());
    }

    #[test]
    fn test_refused_before_send_is_transient() {
        let err: JsonRpcError<RpcTransactionError> = JsonRpcError::ServerError(
            JsonRpcServerError::ResponseStatusError(
                JsonRpcServerResponseStatusError::TooManyRequests,
            ),
        );
        assert!(matches!(classify_broadcast_error(&err), SubmitError::TransientRpc(_)));

        let err: JsonRpcError<RpcTransactionError> =
            JsonRpcError::ServerError(JsonRpcServerError::HandlerError(
                RpcTransactionError::DoesNotTrackShard,
            ));
        assert!(matches!(classify_broadcast_error(&err), SubmitError::TransientRpc(_)));
    }

    #[tokio::test]
    async fn test_broadcast_to_unreachable_rpcs_is_not_unconfirmed() {
        let rpc = RpcClient::new("http://127.0.0.1:1", "http://127.0.0.1:2");
        let signer = near_crypto::InMemorySigner::from_seed(
            "relayer.testnet".parse().unwrap(),
            near_crypto::KeyType::ED25519,
            "k",
        );
        let tx = near_primitives::transaction::Transaction::V0(
            near_primitives::transaction::TransactionV0 {
                signer_id: "relayer.testnet".parse().unwrap(),
                public_key: signer.public_key(),
                nonce: 1,
                receiver_id: "core.onsocial.testnet".parse().unwrap(),
                block_hash: CryptoHash::default(),
                actions: vec![],
            },
        );
        let signed = tx.sign(&signer);
        // Connection refused on both endpoints: nothing was sent.
        assert!(matches!(rpc.submit(signed).await, Err(SubmitError::TransientRpc(_))));
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let rpc = RpcClient::new("http://127.0.0.1:1", "http://127.0.0.1:2");
        assert_eq!(rpc.active_endpoint(), "http://127.0.0.1:1");
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD {
            rpc.record_failure();
        }
        assert!(rpc.is_circuit_open());
        assert_eq!(rpc.active_endpoint(), "http://127.0.0.1:2");
        assert_eq!(rpc.failover_count(), 1);

        rpc.record_success();
        assert!(!rpc.is_circuit_open());
    }

    #[tokio::test]
    async fn test_unreachable_rpcs_fail_probe_and_nonce_query() {
        let rpc = RpcClient::new("http://127.0.0.1:1", "http://127.0.0.1:2");
        assert!(matches!(rpc.probe().await, Err(crate::Error::Rpc(_))));

        let key = near_crypto::SecretKey::from_seed(near_crypto::KeyType::ED25519, "k")
            .public_key();
        let err = rpc
            .access_key_nonce(&"relayer.testnet".parse().unwrap(), &key)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::TransientRpc(_)));
    }

    #[tokio::test]
    async fn test_tx_status_falls_back_when_primary_unreachable() {
        let rpc = RpcClient::new("http://127.0.0.1:1", "http://127.0.0.1:2");
        let result = rpc
            .tx_status(CryptoHash::hash_bytes(b"tx"), &"relayer.testnet".parse().unwrap())
            .await;
        assert!(matches!(result, Err(crate::Error::Rpc(_))));
        // The primary's transport failure was recorded before trying the fallback.
        assert_eq!(rpc.circuit.lock().unwrap().failures, 1);
    }
}
