// Order reconciliation: queue hand-off and the background worker
pub mod queue;
pub mod worker;

pub use queue::OrderQueue;
pub use worker::{ReconciliationWorker, WorkerConfig};
