// Order and withdrawal intake
//
// Validates what users submit, writes it through the ledger store and hands
// new orders to the reconciliation worker.

pub mod luhn;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{AppError, AppResult, OrderError};
use crate::ledger::models::{BonusTransaction, Order, PendingOrder};
use crate::ledger::money::Amount;
use crate::ledger::LedgerStore;
use crate::settlement::queue::OrderQueue;

/// Result of an order upload that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New order, queued for accrual.
    Accepted(Order),
    /// The caller uploaded this number before. Nothing was written.
    AlreadyUploaded(Order),
}

pub struct OrderGateway {
    ledger: Arc<dyn LedgerStore>,
    queue: OrderQueue,
}

impl OrderGateway {
    pub fn new(ledger: Arc<dyn LedgerStore>, queue: OrderQueue) -> Self {
        Self { ledger, queue }
    }

    /// Register an order number for the user and queue it for accrual.
    pub async fn submit_order(&self, user_id: i64, raw_number: &str) -> AppResult<SubmitOutcome> {
        let number = validated_number(raw_number)?;

        if let Some(existing) = self.ledger.find_order(number).await? {
            return resolve_existing(user_id, existing);
        }

        let order = match self.ledger.create_order(user_id, number).await {
            Ok(order) => order,
            // Lost an insert race on the unique order number.
            Err(AppError::Order(OrderError::AlreadyExists(_))) => {
                let existing = self
                    .ledger
                    .find_order(number)
                    .await?
                    .ok_or_else(|| OrderError::AlreadyExists(number.to_string()))?;
                return resolve_existing(user_id, existing);
            }
            Err(e) => return Err(e),
        };

        // Detached so a cancelled request still hands the stored order over.
        let queue = self.queue.clone();
        let pending = PendingOrder::from(&order);
        tokio::spawn(async move { queue.enqueue(pending).await })
            .await
            .map_err(|e| AppError::Internal(format!("order hand-off failed: {}", e)))??;
        info!(user_id, order_number = %order.order_number, "📥 Order accepted");

        Ok(SubmitOutcome::Accepted(order))
    }

    /// Spend `sum` of the user's bonus balance against a new order number.
    pub async fn withdraw(
        &self,
        user_id: i64,
        order_number: &str,
        sum: Decimal,
    ) -> AppResult<BonusTransaction> {
        let number = validated_number(order_number)?;
        let amount = Amount::from_decimal(sum)?;

        let transaction = self.ledger.withdraw(user_id, number, amount).await?;
        info!(user_id, order_number = %number, amount = %amount, "💸 Withdrawal recorded");

        Ok(transaction)
    }
}

fn validated_number(raw: &str) -> AppResult<&str> {
    let number = raw.trim();
    if number.is_empty() {
        return Err(AppError::BadRequest("order number is empty".to_string()));
    }
    if !luhn::is_valid(number) {
        return Err(OrderError::InvalidNumber(number.to_string()).into());
    }
    Ok(number)
}

fn resolve_existing(user_id: i64, existing: Order) -> AppResult<SubmitOutcome> {
    if existing.user_id == user_id {
        debug!(user_id, order_number = %existing.order_number, "Order already uploaded by this user");
        Ok(SubmitOutcome::AlreadyUploaded(existing))
    } else {
        Err(OrderError::OwnedByAnotherUser(existing.order_number).into())
    }
}
