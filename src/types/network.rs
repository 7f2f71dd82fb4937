use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt::Display;
use std::str::FromStr;

/// Supported blockchain networks.
///
/// Pipeline code dispatches on this enum only at the chain boundary; the
/// stored form is the uppercase tag (`TRON`, `MATIC`, `SOL`) so rows written
/// by earlier deployments keep resolving.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Network {
    Tron,
    Polygon,
    Solana,
}

impl Network {
    pub(crate) const ALL: [Network; 3] = [Network::Tron, Network::Polygon, Network::Solana];

    /// Stable tag used in database rows and external ids.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Network::Tron => "TRON",
            Network::Polygon => "MATIC",
            Network::Solana => "SOL",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRON" => Ok(Network::Tron),
            "MATIC" | "POLYGON" => Ok(Network::Polygon),
            "SOL" | "SOLANA" => Ok(Network::Solana),
            _ => Err(anyhow::anyhow!("Unknown network: {}", s)),
        }
    }
}

impl Type<Sqlite> for Network {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for Network {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s: String = Decode::<'r, Sqlite>::decode(value)?;
        Ok(Network::from_str(&s)?)
    }
}

impl<'q> Encode<'q, Sqlite> for Network {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Encode::<Sqlite>::encode_by_ref(&self.tag().to_string(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tags() {
        for network in Network::ALL {
            assert_eq!(Network::from_str(network.tag()).unwrap(), network);
        }
    }

    #[test]
    fn accepts_long_names() {
        assert_eq!(Network::from_str("polygon").unwrap(), Network::Polygon);
        assert_eq!(Network::from_str("solana").unwrap(), Network::Solana);
    }
}
