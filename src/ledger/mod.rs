// Ledger store: users, orders and the append-only bonus transaction log
pub mod memory;
pub mod models;
pub mod money;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use models::{BalanceAudit, BonusTransaction, Order, OrderStatus, SettlementOutcome, User};
use money::Amount;

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;

/// Persistence operations over users, orders and bonus transactions.
///
/// Every method that moves money runs as one atomic unit, so
/// `balance == Σ accrual − Σ withdrawal` holds for any read.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== USER OPERATIONS ==========

    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User>;

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>>;

    async fn store_session(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Look up the user owning an unexpired session.
    async fn find_user_by_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<User>>;

    // ========== ORDER OPERATIONS ==========

    async fn find_order(&self, order_number: &str) -> AppResult<Option<Order>>;

    /// Insert an order in NEW status. A number that already exists yields
    /// `OrderError::AlreadyExists`.
    async fn create_order(&self, user_id: i64, order_number: &str) -> AppResult<Order>;

    /// Orders uploaded by the user, newest first. Withdrawal anchors are
    /// not included.
    async fn list_orders(&self, user_id: i64) -> AppResult<Vec<Order>>;

    /// Orders the accrual service has not finished with yet.
    async fn pending_orders(&self) -> AppResult<Vec<Order>>;

    // ========== SETTLEMENT ==========

    /// Finish an order with a final status and credit its accrual.
    ///
    /// Status update, transaction insert and balance increment commit
    /// together. Settling an order that is already final writes nothing.
    async fn settle_order(
        &self,
        order_id: i64,
        status: OrderStatus,
        accrual: Amount,
    ) -> AppResult<SettlementOutcome>;

    /// Debit the user's balance against a new WITHDRAWN order.
    ///
    /// The balance check and the decrement are a single conditional update.
    async fn withdraw(
        &self,
        user_id: i64,
        order_number: &str,
        amount: Amount,
    ) -> AppResult<BonusTransaction>;

    // ========== BALANCE OPERATIONS ==========

    async fn balance_audit(&self, user_id: i64) -> AppResult<BalanceAudit>;

    /// Withdrawal transactions of the user, newest first.
    async fn list_withdrawals(&self, user_id: i64) -> AppResult<Vec<BonusTransaction>>;

    async fn ping(&self) -> AppResult<()>;
}
