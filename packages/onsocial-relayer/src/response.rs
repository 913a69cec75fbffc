//! Response types for the relayer API.

use serde::Serialize;
use serde_json::Value;

/// Response from the execute endpoint.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl ExecuteResponse {
    pub fn ok(result: Option<Value>, tx_hash: String) -> Self {
        Self {
            success: true,
            result,
            error: None,
            tx_hash: Some(tx_hash),
        }
    }

    pub fn err(error: impl Into<String>, tx_hash: Option<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            tx_hash,
        }
    }
}

/// Response from the health endpoint.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub lifecycle: &'static str,
    pub relayer_account: String,
    pub contract_id: String,
    pub uptime_secs: u64,
    pub requests: u64,
    pub active_rpc: String,
    pub failovers: u64,
    pub key_pool: KeyPoolStats,
}

#[derive(Serialize)]
pub struct KeyPoolStats {
    pub size: usize,
    pub available: usize,
    pub in_flight: usize,
    pub keys: Vec<KeyStats>,
}

#[derive(Serialize)]
pub struct KeyStats {
    pub public_key: String,
    /// Next nonce the key will sign with. `None` until fetched from chain.
    pub nonce: Option<u64>,
    pub busy: bool,
    pub last_used_ms: u64,
}

/// Response from `GET /tx/{tx_hash}`.
#[derive(Serialize)]
pub struct TxStatusResponse {
    /// `"final"`, `"pending"` or `"error"`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TxStatusResponse {
    pub fn final_ok(tx_hash: String, result: Option<Value>) -> Self {
        Self {
            status: "final",
            tx_hash: Some(tx_hash),
            success: Some(true),
            result,
            error: None,
        }
    }

    pub fn final_err(tx_hash: String, error: String) -> Self {
        Self {
            status: "final",
            tx_hash: Some(tx_hash),
            success: Some(false),
            result: None,
            error: Some(error),
        }
    }

    pub fn pending(tx_hash: String) -> Self {
        Self {
            status: "pending",
            tx_hash: Some(tx_hash),
            success: None,
            result: None,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            status: "error",
            tx_hash: None,
            success: None,
            result: None,
            error: Some(error.into()),
        }
    }
}
