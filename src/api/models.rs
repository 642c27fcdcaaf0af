use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ledger::models::{BalanceAudit, BonusTransaction, Order, OrderStatus};

// ========== REQUEST MODELS ==========

/// Register and login body
#[derive(Debug, Deserialize, Validate)]
pub struct CredentialsRequest {
    #[validate(length(min = 1, max = 255, message = "login must not be empty"))]
    pub login: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
}

/// Spend bonus points against an order number
#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawRequest {
    #[validate(length(min = 1, message = "order must not be empty"))]
    pub order: String,
    pub sum: Decimal,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: OrderStatus,
    /// Only present once the order was processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let accrual = (order.status == OrderStatus::Processed).then(|| order.accrual.to_decimal());
        Self {
            number: order.order_number,
            status: order.status,
            accrual,
            uploaded_at: order.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl From<BalanceAudit> for BalanceResponse {
    fn from(audit: BalanceAudit) -> Self {
        Self {
            current: audit.balance.to_decimal(),
            withdrawn: audit.withdrawn.to_decimal(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<BonusTransaction> for WithdrawalResponse {
    fn from(tx: BonusTransaction) -> Self {
        Self {
            order: tx.order_number,
            sum: tx.amount.to_decimal(),
            processed_at: tx.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
