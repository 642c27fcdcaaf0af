use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Order status as reported by the accrual system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    /// PROCESSED and INVALID end polling for the order.
    pub fn is_final(&self) -> bool {
        matches!(self, AccrualStatus::Processed | AccrualStatus::Invalid)
    }
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccrualStatus::Registered => "REGISTERED",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Invalid => "INVALID",
            AccrualStatus::Processed => "PROCESSED",
        };
        f.write_str(s)
    }
}

/// `GET /api/orders/{number}` response body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderAccrual {
    #[serde(default)]
    pub order: String,
    pub status: AccrualStatus,
    /// Absent or null until the order is processed.
    #[serde(default, deserialize_with = "null_as_zero")]
    pub accrual: Decimal,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Decimal>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accrual client errors. The reconciliation worker treats all of them as
/// "try again on a later tick".
#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("Accrual request failed after {attempts} attempts: {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("Accrual service answered {status}")]
    UnexpectedStatus {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Malformed accrual response: {0}")]
    Decode(String),

    #[error("Invalid accrual URL: {0}")]
    InvalidUrl(String),
}
