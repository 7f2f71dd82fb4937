use async_trait::async_trait;

use crate::chains::error::ChainError;
use crate::chains::polygon::PolygonClient;
use crate::chains::solana::SolanaClient;
use crate::chains::tron::TronClient;
use crate::config::TreasuryConfig;
use crate::types::network::Network;

pub(crate) mod error;
pub(crate) mod keys;
pub(crate) mod polygon;
pub(crate) mod solana;
pub(crate) mod tatum;
pub(crate) mod tron;

/// One inbound token transfer observed on chain.
#[derive(Debug, Clone)]
pub(crate) struct TokenTransfer {
    /// Transaction hash / signature as the chain renders it
    pub(crate) tx_hash: String,

    /// Destination address the transfer credited
    pub(crate) to_address: String,

    /// Raw token amount as a decimal string, before decimals are applied
    pub(crate) raw_amount: String,
}

/// Uniform request/response surface over one chain's wallet and transfer APIs.
///
/// Balance lookups deliberately return zero on any failure: a transient read
/// error must never be mistaken for "no funds" by a caller deciding whether
/// to sweep or pay out.
#[async_trait]
pub(crate) trait ChainClient: Send + Sync {
    fn network(&self) -> Network;

    /// Derive the deposit address at `index` from the configured xpub.
    async fn derive_address(&self, index: u32) -> Result<String, ChainError>;

    /// Stablecoin balance of `address` in human units; zero on lookup failure.
    async fn token_balance(&self, address: &str) -> f64;

    /// Native-coin balance of `address`; zero on lookup failure.
    async fn native_balance(&self, address: &str) -> f64;

    /// Send `amount` stablecoin units to `to`, returning the transaction id.
    async fn send_token(&self, from_key: &str, to: &str, amount: f64)
        -> Result<String, ChainError>;

    /// Send `amount` native units to `to`, returning the transaction id.
    async fn send_native(
        &self,
        from_key: &str,
        to: &str,
        amount: f64,
    ) -> Result<String, ChainError>;
}

/// Per-network client instances, built once at startup.
pub(crate) struct Chains {
    tron: TronClient,
    polygon: PolygonClient,
    solana: SolanaClient,
}

impl Chains {
    pub(crate) fn new(config: &TreasuryConfig) -> Self {
        Self {
            tron: TronClient::new(config.network(Network::Tron)),
            polygon: PolygonClient::new(config.network(Network::Polygon)),
            solana: SolanaClient::new(config.network(Network::Solana)),
        }
    }

    /// Dispatch to the chain-specific client; the single place the
    /// network variant is branched on for wallet operations.
    pub(crate) fn client(&self, network: Network) -> &dyn ChainClient {
        match network {
            Network::Tron => &self.tron,
            Network::Polygon => &self.polygon,
            Network::Solana => &self.solana,
        }
    }

    pub(crate) fn tron(&self) -> &TronClient {
        &self.tron
    }

    pub(crate) fn polygon(&self) -> &PolygonClient {
        &self.polygon
    }

    pub(crate) fn solana(&self) -> &SolanaClient {
        &self.solana
    }
}
