//! The chain seam: everything the relay needs from NEAR, behind one trait.
//!
//! [`crate::rpc::RpcClient`] is the production implementation. Tests drive
//! the relay with the scripted in-memory chain in [`tests`].

use async_trait::async_trait;
use near_crypto::PublicKey;
use near_primitives::hash::CryptoHash;
use near_primitives::transaction::SignedTransaction;
use near_primitives::types::AccountId;
use serde_json::Value;

use crate::error::RelayError;

/// A transaction that executed successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub tx_hash: String,
    /// JSON-decoded return value of the contract call, if any.
    pub result: Option<Value>,
}

/// Why a submission did not produce a [`ChainOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The signed nonce is stale or too far ahead of the access key.
    #[error("nonce mismatch: {0}")]
    NonceMismatch(String),
    /// The RPC could not be reached or answered with a node-side error.
    /// Nothing landed.
    #[error("rpc unavailable: {0}")]
    TransientRpc(String),
    /// No answer within budget. The transaction may still land.
    #[error("submission timed out")]
    Timeout,
    /// The connection failed after the signed transaction was handed to the
    /// RPC. It may or may not have been broadcast.
    #[error("broadcast unconfirmed: {0}")]
    Unconfirmed(String),
    /// The relayer itself cannot pay for or sign the transaction (missing or
    /// exhausted access key, insufficient balance). Not the contract's verdict.
    #[error("relayer cannot submit: {0}")]
    RelayerFault(String),
    /// The chain or the contract refused the transaction. `tx_hash` is set
    /// when the transaction was included and failed during execution, which
    /// consumes the nonce.
    #[error("{error}")]
    ChainRejected {
        error: String,
        tx_hash: Option<String>,
    },
}

impl SubmitError {
    /// Whether the signed nonce was consumed on chain.
    pub fn nonce_consumed(&self) -> bool {
        matches!(self, SubmitError::ChainRejected { tx_hash: Some(_), .. })
    }

    /// The transaction may have landed; only the same (key, nonce) may be
    /// resubmitted.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, SubmitError::Timeout | SubmitError::Unconfirmed(_))
    }
}

impl From<SubmitError> for RelayError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::NonceMismatch(msg) => RelayError::NonceMismatch(msg),
            SubmitError::TransientRpc(msg) => RelayError::TransientRpc(msg),
            SubmitError::Timeout | SubmitError::Unconfirmed(_) => {
                RelayError::Timeout { tx_hash: None }
            }
            SubmitError::RelayerFault(msg) => RelayError::RelayerUnavailable(msg),
            SubmitError::ChainRejected { error, tx_hash } => {
                RelayError::ChainRejected { error, tx_hash }
            }
        }
    }
}

/// Final status of a previously relayed transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    Succeeded {
        tx_hash: String,
        result: Option<Value>,
    },
    Failed {
        tx_hash: String,
        error: String,
    },
    /// Unknown to the node or not final yet.
    Pending,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The access key's current on-chain nonce (the last one used).
    async fn access_key_nonce(
        &self,
        account_id: &AccountId,
        public_key: &PublicKey,
    ) -> Result<u64, SubmitError>;

    /// A recent final block hash to anchor new transactions.
    async fn latest_block_hash(&self) -> Result<CryptoHash, SubmitError>;

    /// Broadcast a signed transaction and wait for its final outcome.
    async fn submit(&self, signed_tx: SignedTransaction) -> Result<ChainOutcome, SubmitError>;

    /// Reachability check. `Ok("ok")` or `Ok("degraded")` when only the
    /// fallback answers.
    async fn probe(&self) -> Result<&'static str, crate::Error>;

    async fn tx_status(
        &self,
        tx_hash: CryptoHash,
        sender_id: &AccountId,
    ) -> Result<TxStatus, crate::Error>;

    /// Endpoint currently serving requests, for diagnostics.
    fn active_endpoint(&self) -> String {
        String::new()
    }

    fn failover_count(&self) -> u64 {
        0
    }
}

// --- Test helpers (shared across module tests) ---
