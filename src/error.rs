use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::models::OrderStatus;
use crate::ledger::money::{Amount, MoneyError};
use crate::settlement::queue::QueueClosed;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid amount: {0}")]
    Money(#[from] MoneyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Order submission and settlement errors
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Order number {0:?} fails the checksum")]
    InvalidNumber(String),

    #[error("Order {0} was uploaded by another user")]
    OwnedByAnotherUser(String),

    #[error("Order {0} already exists")]
    AlreadyExists(String),

    #[error("Order {0} not found")]
    NotFound(i64),

    #[error("{0} is not a final order status")]
    NotFinal(OrderStatus),

    #[error("Accrual {0} is negative")]
    NegativeAccrual(Amount),
}

/// Withdrawal errors
#[derive(Error, Debug)]
pub enum WithdrawalError {
    #[error("Withdrawal amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },
}

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Login {0:?} is already taken")]
    LoginTaken(String),

    #[error("Invalid login or password")]
    InvalidCredentials,

    #[error("Missing Authorization header")]
    MissingToken,

    #[error("Invalid or expired session token")]
    InvalidToken,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Order(OrderError::InvalidNumber(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_ORDER_NUMBER")
            }
            AppError::Order(OrderError::OwnedByAnotherUser(_)) => {
                (StatusCode::CONFLICT, "ORDER_OWNED_BY_ANOTHER_USER")
            }
            AppError::Order(OrderError::AlreadyExists(_)) => {
                (StatusCode::CONFLICT, "ORDER_ALREADY_EXISTS")
            }
            AppError::Order(OrderError::NotFound(_)) => (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND"),
            AppError::Withdrawal(WithdrawalError::InvalidAmount(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_AMOUNT")
            }
            AppError::Withdrawal(WithdrawalError::InsufficientFunds { .. }) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_FUNDS")
            }
            AppError::Auth(AuthError::LoginTaken(_)) => (StatusCode::CONFLICT, "LOGIN_TAKEN"),
            AppError::Auth(AuthError::InvalidCredentials) => {
                (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS")
            }
            AppError::Auth(AuthError::MissingToken | AuthError::InvalidToken) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
            }
            AppError::Money(_) => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            AppError::Database(_) | AppError::Migration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        // Storage and internal details stay in the logs.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<QueueClosed> for AppError {
    fn from(error: QueueClosed) -> Self {
        AppError::Internal(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::Unavailable("storage call timed out".to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
