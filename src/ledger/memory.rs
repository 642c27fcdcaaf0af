//! In-process ledger.
//!
//! Backs local runs without a database and the test suite. Every operation
//! takes the single state lock once and never awaits while holding it, which
//! gives it the same all-or-nothing behaviour as the Postgres transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::models::*;
use super::money::Amount;
use super::LedgerStore;
use crate::error::{AppError, AppResult, AuthError, OrderError, WithdrawalError};

struct UserRow {
    user: User,
    token_hash: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
}

struct OrderRow {
    id: i64,
    order_number: String,
    status: OrderStatus,
    user_id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    users: HashMap<i64, UserRow>,
    orders: HashMap<i64, OrderRow>,
    order_ids_by_number: HashMap<String, i64>,
    transactions: Vec<BonusTransaction>,
    next_user_id: i64,
    next_order_id: i64,
    next_transaction_id: i64,
}

impl State {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }

    fn accrual_for(&self, order_id: i64) -> Amount {
        self.transactions
            .iter()
            .filter(|t| t.order_id == order_id && t.kind == TransactionType::Accrual)
            .map(|t| t.amount)
            .sum()
    }

    fn to_order(&self, row: &OrderRow) -> Order {
        Order {
            id: row.id,
            order_number: row.order_number.clone(),
            status: row.status,
            user_id: row.user_id,
            accrual: self.accrual_for(row.id),
            created_at: row.created_at,
        }
    }

    fn insert_order(
        &mut self,
        user_id: i64,
        order_number: &str,
        status: OrderStatus,
    ) -> AppResult<i64> {
        if self.order_ids_by_number.contains_key(order_number) {
            return Err(OrderError::AlreadyExists(order_number.to_string()).into());
        }

        let id = Self::next_id(&mut self.next_order_id);
        self.orders.insert(
            id,
            OrderRow {
                id,
                order_number: order_number.to_string(),
                status,
                user_id,
                created_at: Utc::now(),
            },
        );
        self.order_ids_by_number.insert(order_number.to_string(), id);
        Ok(id)
    }

    fn append_transaction(
        &mut self,
        amount: Amount,
        kind: TransactionType,
        user_id: i64,
        order_id: i64,
        order_number: &str,
    ) -> BonusTransaction {
        let transaction = BonusTransaction {
            id: Self::next_id(&mut self.next_transaction_id),
            amount,
            kind,
            user_id,
            order_id,
            order_number: order_number.to_string(),
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn sorted_newest_first(mut orders: Vec<Order>) -> Vec<Order> {
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        orders
    }
}

/// Ledger kept in memory behind one lock.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
        let mut state = self.state.lock();
        if state.users.values().any(|row| row.user.login == login) {
            return Err(AuthError::LoginTaken(login.to_string()).into());
        }

        let user = User {
            id: State::next_id(&mut state.next_user_id),
            login: login.to_string(),
            password_hash: password_hash.to_string(),
            balance: Amount::ZERO,
            created_at: Utc::now(),
        };
        state.users.insert(
            user.id,
            UserRow {
                user: user.clone(),
                token_hash: None,
                token_expires_at: None,
            },
        );
        Ok(user)
    }

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>> {
        let state = self.state.lock();
        Ok(state
            .users
            .values()
            .find(|row| row.user.login == login)
            .map(|row| row.user.clone()))
    }

    async fn store_session(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.lock();
        let row = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
        row.token_hash = Some(token_hash.to_string());
        row.token_expires_at = Some(expires_at);
        Ok(())
    }

    async fn find_user_by_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<User>> {
        let state = self.state.lock();
        Ok(state
            .users
            .values()
            .find(|row| {
                row.token_hash.as_deref() == Some(token_hash)
                    && row.token_expires_at.is_some_and(|expires| expires > now)
            })
            .map(|row| row.user.clone()))
    }

    async fn find_order(&self, order_number: &str) -> AppResult<Option<Order>> {
        let state = self.state.lock();
        Ok(state
            .order_ids_by_number
            .get(order_number)
            .and_then(|id| state.orders.get(id))
            .map(|row| state.to_order(row)))
    }

    async fn create_order(&self, user_id: i64, order_number: &str) -> AppResult<Order> {
        let mut state = self.state.lock();
        if !state.users.contains_key(&user_id) {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        let id = state.insert_order(user_id, order_number, OrderStatus::New)?;
        let order = state.to_order(&state.orders[&id]);
        Ok(order)
    }

    async fn list_orders(&self, user_id: i64) -> AppResult<Vec<Order>> {
        let state = self.state.lock();
        let orders = state
            .orders
            .values()
            .filter(|row| row.user_id == user_id && row.status != OrderStatus::Withdrawn)
            .map(|row| state.to_order(row))
            .collect();
        Ok(State::sorted_newest_first(orders))
    }

    async fn pending_orders(&self) -> AppResult<Vec<Order>> {
        let state = self.state.lock();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|row| row.status.is_pending())
            .map(|row| state.to_order(row))
            .collect();
        orders.sort_by_key(|order| order.id);
        Ok(orders)
    }

    async fn settle_order(
        &self,
        order_id: i64,
        status: OrderStatus,
        accrual: Amount,
    ) -> AppResult<SettlementOutcome> {
        if !status.is_final() {
            return Err(OrderError::NotFinal(status).into());
        }
        if accrual.is_negative() {
            return Err(OrderError::NegativeAccrual(accrual).into());
        }

        let mut state = self.state.lock();
        let (user_id, order_number, current) = {
            let row = state
                .orders
                .get(&order_id)
                .ok_or(OrderError::NotFound(order_id))?;
            (row.user_id, row.order_number.clone(), row.status)
        };

        if !current.is_pending() {
            return Ok(SettlementOutcome::AlreadySettled(current));
        }

        // Validate every write before applying any of them.
        let new_balance = if accrual.is_zero() {
            None
        } else {
            let user = state
                .users
                .get(&user_id)
                .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;
            let balance = user
                .user
                .balance
                .checked_add(accrual)
                .ok_or_else(|| AppError::Internal(format!("Balance overflow for user {}", user_id)))?;
            Some(balance)
        };

        if let Some(row) = state.orders.get_mut(&order_id) {
            row.status = status;
        }
        if let Some(balance) = new_balance {
            state.append_transaction(
                accrual,
                TransactionType::Accrual,
                user_id,
                order_id,
                &order_number,
            );
            if let Some(row) = state.users.get_mut(&user_id) {
                row.user.balance = balance;
            }
        }

        Ok(SettlementOutcome::Settled {
            status,
            credited: accrual,
        })
    }

    async fn withdraw(
        &self,
        user_id: i64,
        order_number: &str,
        amount: Amount,
    ) -> AppResult<BonusTransaction> {
        if !amount.is_positive() {
            return Err(WithdrawalError::InvalidAmount(amount).into());
        }

        let mut state = self.state.lock();
        let available = state
            .users
            .get(&user_id)
            .map(|row| row.user.balance)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        if available < amount {
            return Err(WithdrawalError::InsufficientFunds {
                required: amount,
                available,
            }
            .into());
        }

        let order_id = state.insert_order(user_id, order_number, OrderStatus::Withdrawn)?;
        let transaction = state.append_transaction(
            amount,
            TransactionType::Withdrawal,
            user_id,
            order_id,
            order_number,
        );
        if let Some(row) = state.users.get_mut(&user_id) {
            row.user.balance = available - amount;
        }

        Ok(transaction)
    }

    async fn balance_audit(&self, user_id: i64) -> AppResult<BalanceAudit> {
        let state = self.state.lock();
        let balance = state
            .users
            .get(&user_id)
            .map(|row| row.user.balance)
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        let sum_of = |kind: TransactionType| -> Amount {
            state
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id && t.kind == kind)
                .map(|t| t.amount)
                .sum()
        };

        Ok(BalanceAudit {
            balance,
            accrued: sum_of(TransactionType::Accrual),
            withdrawn: sum_of(TransactionType::Withdrawal),
        })
    }

    async fn list_withdrawals(&self, user_id: i64) -> AppResult<Vec<BonusTransaction>> {
        let state = self.state.lock();
        let mut withdrawals: Vec<BonusTransaction> = state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.kind == TransactionType::Withdrawal)
            .cloned()
            .collect();
        withdrawals.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(withdrawals)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
