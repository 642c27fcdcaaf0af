use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use super::models::*;
use super::money::Amount;
use super::LedgerStore;
use crate::error::{AppError, AppResult, AuthError, OrderError, WithdrawalError};

/// Order columns plus the accrual credited for the order.
const ORDER_SELECT: &str = r#"
    SELECT o.id, o.order_number, o.status, o.user_id, o.created_at,
           COALESCE((
               SELECT SUM(t.amount) FROM bonus_transactions t
               WHERE t.order_id = o.id AND t.type = 'accrual'
           ), 0)::BIGINT AS accrual
    FROM orders o
"#;

const USER_COLUMNS: &str = "id, login, password_hash, balance, created_at";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Postgres ledger - THE source of truth for balances and orders
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== USER OPERATIONS ==========

    async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (login, password_hash) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
        ))
        .bind(login)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::from(AuthError::LoginTaken(login.to_string()))
            } else {
                AppError::from(e)
            }
        })?;

        Ok(user)
    }

    async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE login = $1"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn store_session(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET token_hash = $2, token_expires_at = $3
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }

        Ok(())
    }

    async fn find_user_by_session(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE token_hash = $1 AND token_expires_at > $2"
        ))
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    // ========== ORDER OPERATIONS ==========

    async fn find_order(&self, order_number: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!("{ORDER_SELECT} WHERE o.order_number = $1"))
            .bind(order_number)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    async fn create_order(&self, user_id: i64, order_number: &str) -> AppResult<Order> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (order_number, status, user_id)
            VALUES ($1, $2, $3)
            RETURNING id, order_number, status, user_id, created_at, 0::BIGINT AS accrual
            "#,
        )
        .bind(order_number)
        .bind(OrderStatus::New)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::from(OrderError::AlreadyExists(order_number.to_string()))
            } else {
                AppError::from(e)
            }
        })?;

        info!(order_number = %order.order_number, user_id, "Order created");
        Ok(order)
    }

    async fn list_orders(&self, user_id: i64) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "{ORDER_SELECT} WHERE o.user_id = $1 AND o.status <> $2 ORDER BY o.created_at DESC, o.id DESC"
        ))
        .bind(user_id)
        .bind(OrderStatus::Withdrawn)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn pending_orders(&self) -> AppResult<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "{ORDER_SELECT} WHERE o.status IN ($1, $2) ORDER BY o.created_at, o.id"
        ))
        .bind(OrderStatus::New)
        .bind(OrderStatus::Processing)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    // ========== SETTLEMENT ==========

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

        let mut tx = self.pool.begin().await?;

        // Only a pending order can move; a concurrent or repeated settlement
        // finds no row to update.
        let advanced: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = $2
            WHERE id = $1 AND status IN ($3, $4)
            RETURNING user_id
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(OrderStatus::New)
        .bind(OrderStatus::Processing)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id,)) = advanced else {
            let current: Option<(OrderStatus,)> =
                sqlx::query_as("SELECT status FROM orders WHERE id = $1")
                    .bind(order_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match current {
                Some((current,)) => {
                    debug!(order_id, %current, "Order already settled");
                    Ok(SettlementOutcome::AlreadySettled(current))
                }
                None => Err(OrderError::NotFound(order_id).into()),
            };
        };

        if !accrual.is_zero() {
            sqlx::query(
                r#"
                INSERT INTO bonus_transactions (amount, type, user_id, order_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(accrual)
            .bind(TransactionType::Accrual)
            .bind(user_id)
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
                .bind(user_id)
                .bind(accrual)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

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

        let mut tx = self.pool.begin().await?;

        // Check and decrement in one statement; the row lock serializes
        // concurrent withdrawals and each re-evaluates the predicate.
        let debited: Option<(Amount,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET balance = balance - $2
            WHERE id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        if debited.is_none() {
            let available: Option<(Amount,)> =
                sqlx::query_as("SELECT balance FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match available {
                Some((available,)) => Err(WithdrawalError::InsufficientFunds {
                    required: amount,
                    available,
                }
                .into()),
                None => Err(AppError::NotFound(format!("User {} not found", user_id))),
            };
        }

        let (order_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orders (order_number, status, user_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(order_number)
        .bind(OrderStatus::Withdrawn)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::from(OrderError::AlreadyExists(order_number.to_string()))
            } else {
                AppError::from(e)
            }
        })?;

        let (transaction_id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO bonus_transactions (amount, type, user_id, order_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, created_at
            "#,
        )
        .bind(amount)
        .bind(TransactionType::Withdrawal)
        .bind(user_id)
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(BonusTransaction {
            id: transaction_id,
            amount,
            kind: TransactionType::Withdrawal,
            user_id,
            order_id,
            order_number: order_number.to_string(),
            created_at,
        })
    }

    // ========== BALANCE OPERATIONS ==========

    async fn balance_audit(&self, user_id: i64) -> AppResult<BalanceAudit> {
        sqlx::query_as::<_, BalanceAudit>(
            r#"
            SELECT u.balance,
                   COALESCE((
                       SELECT SUM(t.amount) FROM bonus_transactions t
                       WHERE t.user_id = u.id AND t.type = 'accrual'
                   ), 0)::BIGINT AS accrued,
                   COALESCE((
                       SELECT SUM(t.amount) FROM bonus_transactions t
                       WHERE t.user_id = u.id AND t.type = 'withdrawal'
                   ), 0)::BIGINT AS withdrawn
            FROM users u
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    async fn list_withdrawals(&self, user_id: i64) -> AppResult<Vec<BonusTransaction>> {
        let withdrawals = sqlx::query_as::<_, BonusTransaction>(
            r#"
            SELECT t.id, t.amount, t.type, t.user_id, t.order_id, o.order_number, t.created_at
            FROM bonus_transactions t
            JOIN orders o ON o.id = t.order_id
            WHERE t.user_id = $1 AND t.type = $2
            ORDER BY t.created_at DESC, t.id DESC
            "#,
        )
        .bind(user_id)
        .bind(TransactionType::Withdrawal)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
