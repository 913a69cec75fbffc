//! Error types for the relayer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::response::ExecuteResponse;

/// Startup and infrastructure errors. Fatal before the relayer is `Ready`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration or credential error.
    #[error("config error: {0}")]
    Config(String),
    /// RPC communication error.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// Key pool error.
    #[error("key pool error: {0}")]
    KeyPool(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Rpc(_) => StatusCode::BAD_GATEWAY,
            Error::KeyPool(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(ExecuteResponse::err(self.to_string(), None))).into_response()
    }
}

/// Per-request failure taxonomy.
///
/// Each variant tells the caller something different: re-sign and resend
/// (`MalformedRequest`, `PayloadTooLarge`), back off (`PoolExhausted`,
/// `Draining`), retry later (`TransientRpc`, `NonceMismatch`), check the
/// chain before retrying (`Timeout`), try another instance
/// (`RelayerUnavailable`), or give up (`ChainRejected`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("action payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("relayer busy, no signing key available; retry later")]
    PoolExhausted,
    #[error("relayer is draining; retry against another instance")]
    Draining,
    #[error("nonce mismatch could not be corrected: {0}")]
    NonceMismatch(String),
    #[error("could not reach the chain: {0}")]
    TransientRpc(String),
    #[error("submission timed out; outcome unknown, check the chain before resubmitting")]
    Timeout { tx_hash: Option<String> },
    /// The relayer account or its keys cannot pay for the transaction.
    #[error("relayer unavailable: {0}")]
    RelayerUnavailable(String),
    /// The contract's verdict, passed through verbatim.
    #[error("{error}")]
    ChainRejected {
        error: String,
        tx_hash: Option<String>,
    },
}

impl RelayError {
    /// Short machine-readable class, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedRequest(_) => "malformed_request",
            RelayError::PayloadTooLarge { .. } => "payload_too_large",
            RelayError::PoolExhausted => "pool_exhausted",
            RelayError::Draining => "draining",
            RelayError::NonceMismatch(_) => "nonce_mismatch",
            RelayError::TransientRpc(_) => "transient_rpc",
            RelayError::Timeout { .. } => "timeout",
            RelayError::RelayerUnavailable(_) => "relayer_unavailable",
            RelayError::ChainRejected { .. } => "chain_rejected",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::MalformedRequest(_) | RelayError::PayloadTooLarge { .. } => {
                StatusCode::BAD_REQUEST
            }
            RelayError::PoolExhausted | RelayError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::NonceMismatch(_)
            | RelayError::TransientRpc(_)
            | RelayError::RelayerUnavailable(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // The request was validly forwarded; the contract said no.
            RelayError::ChainRejected { .. } => StatusCode::OK,
        }
    }

    pub fn tx_hash(&self) -> Option<&str> {
        match self {
            RelayError::Timeout { tx_hash } | RelayError::ChainRejected { tx_hash, .. } => {
                tx_hash.as_deref()
            }
            _ => None,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let tx_hash = self.tx_hash().map(str::to_string);
        (status, Json(ExecuteResponse::err(self.to_string(), tx_hash))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_separate_error_classes() {
        assert_eq!(
            RelayError::MalformedRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::PayloadTooLarge { size: 10, max: 5 }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RelayError::PoolExhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(RelayError::Draining.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            RelayError::TransientRpc("down".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::RelayerUnavailable("not enough balance".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::Timeout { tx_hash: None }.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::ChainRejected {
                error: "bad signature".into(),
                tx_hash: Some("abc".into())
            }
            .status_code(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_chain_rejection_message_is_verbatim() {
        let err = RelayError::ChainRejected {
            error: "Smart contract panicked: Invalid nonce".into(),
            tx_hash: None,
        };
        assert_eq!(err.to_string(), "Smart contract panicked: Invalid nonce");
    }

    #[test]
    fn test_timeout_message_says_outcome_unknown() {
        let err = RelayError::Timeout { tx_hash: None };
        assert!(err.to_string().contains("outcome unknown"));
    }
}
