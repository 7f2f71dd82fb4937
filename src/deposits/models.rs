use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt::Display;
use std::str::FromStr;

use crate::types::network::Network;

/// Deposit lifecycle. Advances monotonically and never regresses; FAILED is
/// terminal and reachable only from DETECTED (below-minimum).
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DepositStatus {
    Detected,
    Confirmed,
    Credited,
    Failed,
}

impl Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DepositStatus::Detected => "DETECTED",
            DepositStatus::Confirmed => "CONFIRMED",
            DepositStatus::Credited => "CREDITED",
            DepositStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DepositStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DETECTED" => Ok(DepositStatus::Detected),
            "CONFIRMED" => Ok(DepositStatus::Confirmed),
            "CREDITED" => Ok(DepositStatus::Credited),
            "FAILED" => Ok(DepositStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown deposit status: {}", s)),
        }
    }
}

impl Type<Sqlite> for DepositStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for DepositStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s: String = Decode::<'r, Sqlite>::decode(value)?;
        Ok(DepositStatus::from_str(&s)?)
    }
}

impl<'q> Encode<'q, Sqlite> for DepositStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Encode::<Sqlite>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A tracked inbound transfer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub(crate) struct Deposit {
    pub(crate) id: i64,
    pub(crate) user_id: String,
    pub(crate) network: Network,
    pub(crate) tx_hash: String,
    pub(crate) deposit_address: String,
    pub(crate) wallet_address_id: i64,
    pub(crate) raw_amount: String,
    pub(crate) amount_usd: Option<f64>,
    pub(crate) price_used: Option<f64>,
    pub(crate) status: DepositStatus,
    pub(crate) is_below_minimum: bool,
    pub(crate) detected_at: NaiveDateTime,
    pub(crate) confirmed_at: Option<NaiveDateTime>,
    pub(crate) credited_at: Option<NaiveDateTime>,
}

/// Outcome of an idempotent detection insert.
///
/// `AlreadyExists` means another detector (a concurrent cycle or an earlier
/// one) recorded the same transfer; it is success, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    Created,
    AlreadyExists,
}

/// Counts and collected errors from one deposit cycle.
///
/// Errors are collected instead of raised so one bad address or transaction
/// never blocks the rest of the batch.
#[derive(Debug, Default, Serialize)]
pub(crate) struct CycleReport {
    pub(crate) detected: usize,
    pub(crate) confirmed: usize,
    pub(crate) credited: usize,
    pub(crate) errors: Vec<String>,
}
