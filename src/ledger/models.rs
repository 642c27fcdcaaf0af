use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;

use super::money::Amount;

/// Order lifecycle status.
///
/// NEW orders wait for the reconciliation worker; PROCESSED and INVALID are
/// final. WITHDRAWN rows only anchor withdrawal transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
    Withdrawn,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Withdrawn => "WITHDRAWN",
        }
    }

    /// Statuses a settlement may finish an order with.
    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Statuses the reconciliation worker still has to poll for.
    pub fn is_pending(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Accrual,
    Withdrawal,
}

///User entity
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
    pub balance: Amount,
    pub created_at: DateTime<Utc>,
}

/// Order entity, with the accrual credited for it (zero until settled).
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub status: OrderStatus,
    pub user_id: i64,
    pub accrual: Amount,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger entry. Amounts are always positive; the type says
/// which way the money moved.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct BonusTransaction {
    pub id: i64,
    pub amount: Amount,
    #[sqlx(rename = "type")]
    pub kind: TransactionType,
    pub user_id: i64,
    pub order_id: i64,
    pub order_number: String,
    pub created_at: DateTime<Utc>,
}

/// Cached balance next to the sums it is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct BalanceAudit {
    pub balance: Amount,
    pub accrued: Amount,
    pub withdrawn: Amount,
}

impl BalanceAudit {
    /// `balance == Σ accrual − Σ withdrawal`
    pub fn is_consistent(&self) -> bool {
        self.accrued
            .checked_sub(self.withdrawn)
            .is_some_and(|derived| derived == self.balance)
    }
}

/// Result of applying a final accrual status to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled { status: OrderStatus, credited: Amount },
    /// The order was already final; nothing was written.
    AlreadySettled(OrderStatus),
}

/// Transient handle the reconciliation worker keeps while an order is in
/// flight. It does not own the order row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingOrder {
    pub order_id: i64,
    pub order_number: String,
}

impl From<&Order> for PendingOrder {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
        }
    }
}
