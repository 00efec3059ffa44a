use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::models::{LedgerReceipt, PipelineStep};

pub type Result<T> = std::result::Result<T, IssuanceError>;

/// Value-moving operations submitted to the token ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    CreateToken,
    Mint,
    Transfer,
    Burn,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LedgerOperation::CreateToken => "create_token",
            LedgerOperation::Mint => "mint",
            LedgerOperation::Transfer => "transfer",
            LedgerOperation::Burn => "burn",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Ledger {operation} failed: {reason}")]
    LedgerOperationFailed {
        operation: LedgerOperation,
        reason: String,
        receipt: Option<Box<LedgerReceipt>>,
    },

    #[error("Audit log append failed: {0}")]
    AuditLogFailed(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Deposit not found: {0}")]
    DepositNotFound(String),

    #[error("Deposit {deposit_id} previously failed at step {step}")]
    DepositFailed { deposit_id: String, step: PipelineStep },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IssuanceError {
    pub fn ledger(operation: LedgerOperation, reason: impl Into<String>) -> Self {
        IssuanceError::LedgerOperationFailed {
            operation,
            reason: reason.into(),
            receipt: None,
        }
    }

    /// Whether ledger state may already be committed when this error surfaces.
    pub fn is_partial_commit(&self) -> bool {
        matches!(
            self,
            IssuanceError::AuditLogFailed(_) | IssuanceError::PersistenceFailed(_)
        )
    }

    fn error_code(&self) -> &str {
        match self {
            IssuanceError::InvalidAmount(_) => "invalid_amount",
            IssuanceError::UnsupportedCurrency(_) => "unsupported_currency",
            IssuanceError::Validation(_) => "invalid_request",
            IssuanceError::Unauthorized => "unauthorized",
            IssuanceError::RateLimitExceeded => "rate_limited",
            IssuanceError::DepositNotFound(_) => "not_found",
            IssuanceError::InvalidState(_) => "invalid_state",
            // Pipeline and infrastructure failures stay opaque to callers.
            _ => "internal",
        }
    }
}

impl<T> From<async_nats::error::Error<T>> for IssuanceError
where
    T: fmt::Debug + fmt::Display + Clone + PartialEq,
{
    fn from(err: async_nats::error::Error<T>) -> Self {
        IssuanceError::Nats(format!("NATS error: {}", err))
    }
}

impl From<serde_json::Error> for IssuanceError {
    fn from(err: serde_json::Error) -> Self {
        IssuanceError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for IssuanceError {
    fn from(err: validator::ValidationErrors) -> Self {
        IssuanceError::Validation(err.to_string())
    }
}

impl ResponseError for IssuanceError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.error_code() }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            IssuanceError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            IssuanceError::UnsupportedCurrency(_) => StatusCode::BAD_REQUEST,
            IssuanceError::Validation(_) => StatusCode::BAD_REQUEST,
            IssuanceError::Unauthorized => StatusCode::UNAUTHORIZED,
            IssuanceError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            IssuanceError::DepositNotFound(_) => StatusCode::NOT_FOUND,
            IssuanceError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
