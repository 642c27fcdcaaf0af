pub mod client;
pub mod models;

use async_trait::async_trait;

pub use client::{AccrualClient, AccrualClientConfig};
pub use models::{AccrualError, AccrualStatus, OrderAccrual};

/// Source of accrual results for submitted orders.
#[async_trait]
pub trait AccrualService: Send + Sync {
    async fn check_order(&self, order_number: &str) -> Result<OrderAccrual, AccrualError>;
}
