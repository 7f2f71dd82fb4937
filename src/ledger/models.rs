use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt::Display;
use std::str::FromStr;

/// Kind of ledger mutation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TxType {
    Deposit,
    Withdrawal,
    Refund,
}

impl Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxType::Deposit => "DEPOSIT",
            TxType::Withdrawal => "WITHDRAWAL",
            TxType::Refund => "REFUND",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TxType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TxType::Deposit),
            "WITHDRAWAL" => Ok(TxType::Withdrawal),
            "REFUND" => Ok(TxType::Refund),
            _ => Err(anyhow::anyhow!("Unknown transaction type: {}", s)),
        }
    }
}

impl Type<Sqlite> for TxType {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for TxType {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s: String = Decode::<'r, Sqlite>::decode(value)?;
        Ok(TxType::from_str(&s)?)
    }
}

impl<'q> Encode<'q, Sqlite> for TxType {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Encode::<Sqlite>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Immutable ledger entry paired with a balance mutation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub(crate) struct LedgerEntry {
    pub(crate) id: i64,
    pub(crate) user_id: String,
    pub(crate) external_id: String,
    pub(crate) tx_type: TxType,
    pub(crate) amount: f64,
    pub(crate) description: String,
    pub(crate) created_at: NaiveDateTime,
}

/// A user account as the ledger sees it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub(crate) struct UserAccount {
    pub(crate) id: String,
    pub(crate) balance: f64,
}

/// Result of an atomic ledger mutation.
///
/// `AlreadyRecorded` means the unique `external_id` was seen before: the
/// mutation already happened (possibly in a concurrent cycle) and the balance
/// was left untouched this time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LedgerOutcome {
    Applied { balance: f64 },
    AlreadyRecorded,
    InsufficientFunds,
}
