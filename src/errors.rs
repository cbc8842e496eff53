// =============================================================================
// Error taxonomy — mapped to HTTP exactly once, at the edge
// =============================================================================
//
// Leaf components (trade_ledger, risk_evaluator, phase_state_machine,
// payout_ledger, session_gateway) raise `AppError`. The HTTP layer's single
// `IntoResponse` impl below performs the §7 taxonomy -> status code mapping.
// Background loops (Risk Evaluator ticks, Price Feed reconnects) use
// `anyhow::Result` instead, since their failures are logged and retried
// rather than surfaced to a client (spec.md §7 propagation policy).
// =============================================================================

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PreconditionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ApiEnvelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error surfaced to client");
        } else {
            tracing::warn!(error = %self, %status, "request rejected");
        }

        let body = ApiEnvelope::<()> {
            success: false,
            data: None,
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Trade Ledger error set (spec.md §4.2 "Errors").
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("invalid leverage")]
    InvalidLeverage,
    #[error("price unavailable for symbol")]
    PriceUnavailable,
    #[error("challenge is terminal")]
    ChallengeTerminal,
    #[error("invalid take-profit/stop-loss placement")]
    InvalidTpSl,
    #[error("symbol unknown")]
    SymbolUnknown,
    #[error("conflict: optimistic-lock version mismatch")]
    Conflict,
}

impl From<LedgerError> for AppError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientMargin | LedgerError::ChallengeTerminal | LedgerError::InvalidTpSl => {
                AppError::PreconditionFailed(e.to_string())
            }
            LedgerError::InvalidLeverage => AppError::InvalidInput(e.to_string()),
            LedgerError::SymbolUnknown => AppError::InvalidInput(e.to_string()),
            LedgerError::PriceUnavailable => AppError::Unavailable(e.to_string()),
            LedgerError::Conflict => AppError::Conflict(e.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
