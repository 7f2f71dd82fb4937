use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

use crate::types::network::Network;

/// Withdrawal lifecycle.
///
/// PROCESSING is the claimed-for-send state (also written by an earlier
/// deployment); a request may move to SENT exactly once, and FAILED rows can
/// be re-approved through retry after a fresh debit.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum WithdrawalStatus {
    Pending,
    Approved,
    Processing,
    Sent,
    Failed,
}

impl Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Approved => "APPROVED",
            WithdrawalStatus::Processing => "PROCESSING",
            WithdrawalStatus::Sent => "SENT",
            WithdrawalStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for WithdrawalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WithdrawalStatus::Pending),
            "APPROVED" => Ok(WithdrawalStatus::Approved),
            "PROCESSING" => Ok(WithdrawalStatus::Processing),
            "SENT" => Ok(WithdrawalStatus::Sent),
            "FAILED" => Ok(WithdrawalStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown withdrawal status: {}", s)),
        }
    }
}

impl Type<Sqlite> for WithdrawalStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for WithdrawalStatus {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s: String = Decode::<'r, Sqlite>::decode(value)?;
        Ok(WithdrawalStatus::from_str(&s)?)
    }
}

impl<'q> Encode<'q, Sqlite> for WithdrawalStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Encode::<Sqlite>::encode_by_ref(&self.to_string(), buf)
    }
}

/// An outbound payout request. Rows are never deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub(crate) struct WithdrawalRequest {
    pub(crate) id: i64,
    pub(crate) user_id: String,
    pub(crate) network: Network,
    pub(crate) to_address: String,
    pub(crate) amount_gross: f64,
    pub(crate) fee: f64,
    pub(crate) amount_net: f64,
    pub(crate) status: WithdrawalStatus,
    pub(crate) tx_id: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) attempt: i64,
    pub(crate) created_at: NaiveDateTime,
}

/// Outcome of creating a withdrawal request.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub(crate) enum CreateOutcome {
    Ok {
        request: WithdrawalRequest,
        balance: f64,
    },
    NoUser,
    NoFunds,
    BelowMinimum {
        minimum: f64,
    },
    InvalidAmount,
}

/// Error types for withdrawal transitions
#[derive(Debug, Error)]
pub(crate) enum WithdrawalError {
    #[error("withdrawal request not found")]
    NotFound,

    #[error("invalid state {0} for this transition")]
    WrongState(WithdrawalStatus),

    #[error("payout already sent")]
    AlreadySent,

    #[error("balance no longer covers the gross amount")]
    InsufficientFunds,

    #[error("chain send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
