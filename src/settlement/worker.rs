// Reconciliation worker - polls the accrual system for queued orders
//
// Tick loop:
// - Drains the order queue (never waits on it)
// - Asks the accrual system about each order in the batch
// - Settles orders that reached a final status
// - Carries everything else over to the next tick

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::queue::OrderDrain;
use crate::accrual::{AccrualError, AccrualService, AccrualStatus, OrderAccrual};
use crate::ledger::models::{OrderStatus, PendingOrder, SettlementOutcome};
use crate::ledger::money::Amount;
use crate::ledger::LedgerStore;

/// Worker schedule configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between two batch drains
    pub tick: Duration,
    /// Upper bound for one settlement write
    pub settle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(3),
            settle_timeout: Duration::from_secs(3),
        }
    }
}

/// What happened to one order during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Settled { status: OrderStatus, credited: Amount },
    AlreadySettled(OrderStatus),
    NotFinal(AccrualStatus),
    AccrualUnavailable,
    StoreFailed,
}

impl ReconcileOutcome {
    pub fn needs_requeue(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::NotFinal(_)
                | ReconcileOutcome::AccrualUnavailable
                | ReconcileOutcome::StoreFailed
        )
    }
}

/// Per-tick counters, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: usize,
    pub settled: usize,
    pub requeued: usize,
}

/// Single consumer of the order queue.
pub struct ReconciliationWorker {
    config: WorkerConfig,
    ledger: Arc<dyn LedgerStore>,
    accrual: Arc<dyn AccrualService>,
    drain: OrderDrain,
    /// Orders polled on an earlier tick that are not final yet. Kept here
    /// rather than pushed back into the bounded queue so the worker can never
    /// block on its own queue.
    carry_over: Vec<PendingOrder>,
}

impl ReconciliationWorker {
    pub fn new(
        config: WorkerConfig,
        ledger: Arc<dyn LedgerStore>,
        accrual: Arc<dyn AccrualService>,
        drain: OrderDrain,
    ) -> Self {
        Self {
            config,
            ledger,
            accrual,
            drain,
            carry_over: Vec::new(),
        }
    }

    /// Pick up orders that were accepted before the process (re)started.
    pub fn seed<I>(&mut self, orders: I)
    where
        I: IntoIterator<Item = PendingOrder>,
    {
        let before = self.carry_over.len();
        self.carry_over.extend(orders);
        let seeded = self.carry_over.len() - before;
        if seeded > 0 {
            info!("🔁 Resuming {} pending orders", seeded);
        }
    }

    /// Orders waiting for a later tick.
    pub fn backlog(&self) -> usize {
        self.carry_over.len()
    }

    /// Start the worker (runs in background until `shutdown` flips to true)
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("⏰ Reconciliation worker started (tick {:?})", self.config.tick);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.polled > 0 {
                        debug!(
                            polled = report.polled,
                            settled = report.settled,
                            requeued = report.requeued,
                            "Reconciliation tick finished"
                        );
                    }
                }
            }
        }

        info!(
            backlog = self.backlog(),
            "✓ Reconciliation worker stopped"
        );
    }

    /// Process one batch: carried-over orders plus everything newly queued.
    pub async fn tick(&mut self) -> TickReport {
        let mut batch = std::mem::take(&mut self.carry_over);
        batch.extend(self.drain.drain());

        let mut report = TickReport {
            polled: batch.len(),
            ..TickReport::default()
        };

        // One failing order never aborts the rest of the batch.
        for order in batch {
            let outcome = self.reconcile(&order).await;
            if outcome.needs_requeue() {
                report.requeued += 1;
                self.carry_over.push(order);
            } else if matches!(outcome, ReconcileOutcome::Settled { .. }) {
                report.settled += 1;
            }
        }

        report
    }

    /// Poll the accrual system for one order and apply a final result.
    pub async fn reconcile(&self, order: &PendingOrder) -> ReconcileOutcome {
        let result = match self.accrual.check_order(&order.order_number).await {
            Ok(result) => result,
            Err(err) => {
                log_accrual_error(order, &err);
                return ReconcileOutcome::AccrualUnavailable;
            }
        };

        if !result.status.is_final() {
            debug!(
                order_number = %order.order_number,
                accrual_status = %result.status,
                "Accrual has not processed the order yet"
            );
            return ReconcileOutcome::NotFinal(result.status);
        }

        self.settle(order, &result).await
    }

    async fn settle(&self, order: &PendingOrder, result: &OrderAccrual) -> ReconcileOutcome {
        let (status, credit) = match result.status {
            AccrualStatus::Processed => (OrderStatus::Processed, Amount::from_decimal(result.accrual)),
            _ => (OrderStatus::Invalid, Ok(Amount::ZERO)),
        };

        let credit = match credit {
            Ok(credit) if !credit.is_negative() => credit,
            Ok(credit) => {
                error!(order_number = %order.order_number, %credit, "Accrual service reported a negative accrual");
                return ReconcileOutcome::AccrualUnavailable;
            }
            Err(err) => {
                error!(order_number = %order.order_number, error = %err, "Accrual does not fit the ledger");
                return ReconcileOutcome::AccrualUnavailable;
            }
        };

        let settled = timeout(
            self.config.settle_timeout,
            self.ledger.settle_order(order.order_id, status, credit),
        )
        .await;

        match settled {
            Ok(Ok(SettlementOutcome::Settled { status, credited })) => {
                info!(
                    order_number = %order.order_number,
                    %status,
                    %credited,
                    "✓ Order settled"
                );
                ReconcileOutcome::Settled { status, credited }
            }
            Ok(Ok(SettlementOutcome::AlreadySettled(current))) => {
                warn!(
                    order_number = %order.order_number,
                    %current,
                    "Order was already settled, dropping it from the queue"
                );
                ReconcileOutcome::AlreadySettled(current)
            }
            Ok(Err(err)) => {
                error!(order_number = %order.order_number, error = %err, "❌ Settlement failed, retrying next tick");
                ReconcileOutcome::StoreFailed
            }
            Err(_) => {
                error!(order_number = %order.order_number, "❌ Settlement timed out, retrying next tick");
                ReconcileOutcome::StoreFailed
            }
        }
    }
}

fn log_accrual_error(order: &PendingOrder, err: &AccrualError) {
    match err {
        AccrualError::UnexpectedStatus {
            status: 429,
            retry_after,
        } => warn!(
            order_number = %order.order_number,
            ?retry_after,
            "Accrual service is rate limiting"
        ),
        AccrualError::UnexpectedStatus { status: 204, .. } => debug!(
            order_number = %order.order_number,
            "Order is not registered in the accrual system yet"
        ),
        other => error!(
            order_number = %order.order_number,
            error = %other,
            "Accrual check failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use crate::ledger::models::*;
    use crate::ledger::InMemoryLedger;
    use crate::settlement::queue::OrderQueue;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};

    /// Replays scripted answers per order number; the last one repeats.
    #[derive(Default)]
    struct ScriptedAccrual {
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
    }

    #[derive(Clone)]
    enum Scripted {
        Status(AccrualStatus, Decimal),
        Unavailable,
    }

    impl ScriptedAccrual {
        fn with(self, number: &str, answers: Vec<Scripted>) -> Self {
            self.script.lock().insert(number.to_string(), answers.into());
            self
        }

        fn calls_for(&self, number: &str) -> usize {
            self.calls.lock().iter().filter(|n| n.as_str() == number).count()
        }
    }

    #[async_trait]
    impl AccrualService for ScriptedAccrual {
        async fn check_order(&self, order_number: &str) -> Result<OrderAccrual, AccrualError> {
            self.calls.lock().push(order_number.to_string());
            let answer = {
                let mut script = self.script.lock();
                let answers = script.get_mut(order_number).expect("unscripted order");
                if answers.len() > 1 {
                    answers.pop_front()
                } else {
                    answers.front().cloned()
                }
            };
            match answer {
                Some(Scripted::Status(status, accrual)) => Ok(OrderAccrual {
                    order: order_number.to_string(),
                    status,
                    accrual,
                }),
                _ => Err(AccrualError::UnexpectedStatus {
                    status: 500,
                    retry_after: None,
                }),
            }
        }
    }

    /// Ledger whose settlements fail a fixed number of times first.
    struct FlakyLedger {
        inner: InMemoryLedger,
        failures_left: Mutex<usize>,
    }

    #[async_trait]
    impl LedgerStore for FlakyLedger {
        async fn create_user(&self, login: &str, password_hash: &str) -> AppResult<User> {
            self.inner.create_user(login, password_hash).await
        }
        async fn find_user_by_login(&self, login: &str) -> AppResult<Option<User>> {
            self.inner.find_user_by_login(login).await
        }
        async fn store_session(
            &self,
            user_id: i64,
            token_hash: &str,
            expires_at: DateTime<Utc>,
        ) -> AppResult<()> {
            self.inner.store_session(user_id, token_hash, expires_at).await
        }
        async fn find_user_by_session(
            &self,
            token_hash: &str,
            now: DateTime<Utc>,
        ) -> AppResult<Option<User>> {
            self.inner.find_user_by_session(token_hash, now).await
        }
        async fn find_order(&self, order_number: &str) -> AppResult<Option<Order>> {
            self.inner.find_order(order_number).await
        }
        async fn create_order(&self, user_id: i64, order_number: &str) -> AppResult<Order> {
            self.inner.create_order(user_id, order_number).await
        }
        async fn list_orders(&self, user_id: i64) -> AppResult<Vec<Order>> {
            self.inner.list_orders(user_id).await
        }
        async fn pending_orders(&self) -> AppResult<Vec<Order>> {
            self.inner.pending_orders().await
        }
        async fn settle_order(
            &self,
            order_id: i64,
            status: OrderStatus,
            accrual: Amount,
        ) -> AppResult<SettlementOutcome> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(sqlx::Error::PoolTimedOut.into());
                }
            }
            self.inner.settle_order(order_id, status, accrual).await
        }
        async fn withdraw(
            &self,
            user_id: i64,
            order_number: &str,
            amount: Amount,
        ) -> AppResult<BonusTransaction> {
            self.inner.withdraw(user_id, order_number, amount).await
        }
        async fn balance_audit(&self, user_id: i64) -> AppResult<BalanceAudit> {
            self.inner.balance_audit(user_id).await
        }
        async fn list_withdrawals(&self, user_id: i64) -> AppResult<Vec<BonusTransaction>> {
            self.inner.list_withdrawals(user_id).await
        }
        async fn ping(&self) -> AppResult<()> {
            self.inner.ping().await
        }
    }

    struct Harness {
        ledger: Arc<dyn LedgerStore>,
        accrual: Arc<ScriptedAccrual>,
        queue: OrderQueue,
        worker: ReconciliationWorker,
        user_id: i64,
    }

    async fn harness(ledger: Arc<dyn LedgerStore>, accrual: ScriptedAccrual) -> Harness {
        let accrual = Arc::new(accrual);
        let (queue, drain) = OrderQueue::bounded(8);
        let user_id = ledger.create_user("alice", "hash").await.unwrap().id;
        let worker = ReconciliationWorker::new(
            WorkerConfig {
                tick: Duration::from_millis(100),
                settle_timeout: Duration::from_secs(1),
            },
            ledger.clone(),
            accrual.clone(),
            drain,
        );
        Harness {
            ledger,
            accrual,
            queue,
            worker,
            user_id,
        }
    }

    impl Harness {
        async fn submit(&self, number: &str) -> Order {
            let order = self.ledger.create_order(self.user_id, number).await.unwrap();
            self.queue.enqueue(PendingOrder::from(&order)).await.unwrap();
            order
        }

        async fn order(&self, number: &str) -> Order {
            self.ledger.find_order(number).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_processing_then_processed_scenario() {
        let accrual = ScriptedAccrual::default().with(
            "123",
            vec![
                Scripted::Status(AccrualStatus::Processing, Decimal::ZERO),
                Scripted::Status(AccrualStatus::Processed, dec!(7.29)),
            ],
        );
        let mut h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        h.submit("123").await;

        let first = h.worker.tick().await;
        assert_eq!(first, TickReport { polled: 1, settled: 0, requeued: 1 });
        assert_eq!(h.order("123").await.status, OrderStatus::New);
        assert_eq!(h.ledger.balance_audit(h.user_id).await.unwrap().balance, Amount::ZERO);

        let second = h.worker.tick().await;
        assert_eq!(second, TickReport { polled: 1, settled: 1, requeued: 0 });

        let order = h.order("123").await;
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Amount::from_minor(729));

        let audit = h.ledger.balance_audit(h.user_id).await.unwrap();
        assert_eq!(audit.balance, Amount::from_minor(729));
        assert!(audit.is_consistent());

        // Final orders leave the queue for good.
        assert_eq!(h.worker.tick().await, TickReport::default());
        assert_eq!(h.accrual.calls_for("123"), 2);
    }

    #[tokio::test]
    async fn test_registered_status_leaves_ledger_untouched() {
        let accrual = ScriptedAccrual::default().with(
            "555",
            vec![Scripted::Status(AccrualStatus::Registered, dec!(99))],
        );
        let mut h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        h.submit("555").await;

        for _ in 0..3 {
            let report = h.worker.tick().await;
            assert_eq!(report.requeued, 1);
        }

        assert_eq!(h.order("555").await.status, OrderStatus::New);
        let audit = h.ledger.balance_audit(h.user_id).await.unwrap();
        assert_eq!(audit.balance, Amount::ZERO);
        assert_eq!(audit.accrued, Amount::ZERO);
        assert_eq!(h.worker.backlog(), 1);
    }

    #[tokio::test]
    async fn test_invalid_order_is_marked_without_credit() {
        let accrual = ScriptedAccrual::default()
            .with("777", vec![Scripted::Status(AccrualStatus::Invalid, Decimal::ZERO)]);
        let mut h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        h.submit("777").await;

        let report = h.worker.tick().await;
        assert_eq!(report.settled, 1);
        assert_eq!(h.order("777").await.status, OrderStatus::Invalid);
        assert_eq!(h.ledger.balance_audit(h.user_id).await.unwrap().balance, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_accrual_failure_does_not_abort_batch() {
        let accrual = ScriptedAccrual::default()
            .with("1", vec![Scripted::Unavailable, Scripted::Status(AccrualStatus::Processed, dec!(1))])
            .with("2", vec![Scripted::Status(AccrualStatus::Processed, dec!(2.5))]);
        let mut h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        h.submit("1").await;
        h.submit("2").await;

        let report = h.worker.tick().await;
        assert_eq!(report, TickReport { polled: 2, settled: 1, requeued: 1 });
        assert_eq!(h.order("1").await.status, OrderStatus::New);
        assert_eq!(h.order("2").await.status, OrderStatus::Processed);

        h.worker.tick().await;
        let audit = h.ledger.balance_audit(h.user_id).await.unwrap();
        assert_eq!(audit.balance, Amount::from_minor(350));
        assert!(audit.is_consistent());
    }

    #[tokio::test]
    async fn test_failed_settlement_is_retried_on_later_tick() {
        let ledger = Arc::new(FlakyLedger {
            inner: InMemoryLedger::new(),
            failures_left: Mutex::new(1),
        });
        let accrual = ScriptedAccrual::default()
            .with("42", vec![Scripted::Status(AccrualStatus::Processed, dec!(10))]);
        let mut h = harness(ledger, accrual).await;
        h.submit("42").await;

        let first = h.worker.tick().await;
        assert_eq!(first.requeued, 1);
        assert_eq!(h.order("42").await.status, OrderStatus::New);

        let second = h.worker.tick().await;
        assert_eq!(second.settled, 1);
        let audit = h.ledger.balance_audit(h.user_id).await.unwrap();
        assert_eq!(audit.balance, Amount::from_minor(1000));
    }

    #[tokio::test]
    async fn test_redelivered_order_is_not_credited_twice() {
        let accrual = ScriptedAccrual::default()
            .with("900", vec![Scripted::Status(AccrualStatus::Processed, dec!(5))]);
        let mut h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        let order = h.submit("900").await;
        // Same order arrives again, e.g. seeded after a restart.
        h.worker.seed([PendingOrder::from(&order)]);

        let report = h.worker.tick().await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.settled, 1);
        assert_eq!(report.requeued, 0);

        let audit = h.ledger.balance_audit(h.user_id).await.unwrap();
        assert_eq!(audit.balance, Amount::from_minor(500));
        assert_eq!(audit.accrued, Amount::from_minor(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_polls_on_ticks_and_stops_on_shutdown() {
        let accrual = ScriptedAccrual::default().with(
            "321",
            vec![
                Scripted::Status(AccrualStatus::Registered, Decimal::ZERO),
                Scripted::Status(AccrualStatus::Processed, dec!(1.5)),
            ],
        );
        let h = harness(Arc::new(InMemoryLedger::new()), accrual).await;
        h.submit("321").await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = h.worker.start(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let order = h.ledger.find_order("321").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Amount::from_minor(150));
        assert_eq!(h.accrual.calls_for("321"), 2);
    }
}
