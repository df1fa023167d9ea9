//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use faucet_common::CommonError;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure of one batched transfer.
///
/// A single outcome is shared by every request of the batch, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("transfer rejected by node: {0}")]
    Rejected(String),

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),
}

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("request processor is closed")]
    Closed,

    #[error("request aborted before a result arrived")]
    Aborted,

    #[error("unable to transfer tokens: {0}")]
    TransferFailed(#[from] TransferError),

    #[error("rate limit exhausted: {0}")]
    LimitExhausted(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CommonError> for FaucetError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::InvalidAddress(msg) => FaucetError::InvalidAddress(msg),
            CommonError::InvalidAmount(msg) => FaucetError::InvalidAmount(msg),
            CommonError::Config(msg) => FaucetError::Config(msg),
        }
    }
}

impl FaucetError {
    /// Status code and stable machine-readable code for the HTTP edge.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            FaucetError::LimitExhausted(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXHAUSTED"),
            FaucetError::InvalidAddress(_) => (StatusCode::NOT_ACCEPTABLE, "INVALID_ADDRESS"),
            FaucetError::InvalidAmount(_) => (StatusCode::NOT_ACCEPTABLE, "INVALID_AMOUNT"),
            FaucetError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "FAUCET_CLOSED"),
            FaucetError::Aborted => (StatusCode::GATEWAY_TIMEOUT, "REQUEST_ABORTED"),
            FaucetError::TransferFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TRANSFER_FAILED"),
            FaucetError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            FaucetError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let body = Json(json!({
            "error": error_code,
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_passes_through_verbatim() {
        let err: FaucetError = TransferError::Rejected("insufficient fee".to_string()).into();
        assert_eq!(
            err.to_string(),
            "unable to transfer tokens: transfer rejected by node: insufficient fee"
        );
        assert!(matches!(
            err,
            FaucetError::TransferFailed(TransferError::Rejected(ref msg)) if msg == "insufficient fee"
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            FaucetError::LimitExhausted("1.2.3.4".into()).status_and_code().0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(FaucetError::Closed.status_and_code().0, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(FaucetError::Aborted.status_and_code().0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            FaucetError::InvalidAddress("x".into()).status_and_code().0,
            StatusCode::NOT_ACCEPTABLE
        );
    }

    #[test]
    fn test_common_error_conversion() {
        let err: FaucetError = CommonError::InvalidAddress("0x12".into()).into();
        assert!(matches!(err, FaucetError::InvalidAddress(_)));
    }
}
