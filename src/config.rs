use dotenvy::dotenv;
use std::collections::HashMap;
use tracing::info;

use crate::types::network::Network;

/// Default deposit cycle interval in seconds
const DEFAULT_DEPOSIT_CYCLE_INTERVAL_S: u64 = 60;

/// Default withdrawal sender interval in seconds
const DEFAULT_WITHDRAWAL_SEND_INTERVAL_S: u64 = 30;

/// Default log-scan chunk size in blocks
const DEFAULT_SCAN_CHUNK_BLOCKS: u64 = 1000;

/// Default lookback from chain head when a network is scanned for the first time
const DEFAULT_INITIAL_BLOCKS_BACK: u64 = 2000;

/// Default USD minimum below which a detected deposit is rejected
const DEFAULT_DEPOSIT_MIN_USD: f64 = 1.0;

/// Default minimum withdrawal amount in USD
const DEFAULT_WITHDRAWAL_MIN_USD: f64 = 10.0;

/// Per-network settings for chain access and business rules.
#[derive(Debug, Clone)]
pub(crate) struct NetworkSettings {
    /// Tatum REST base URL (wallet derivation, balances, sends)
    tatum_url: String,

    /// Tatum API key, sent as the `x-api-key` header
    tatum_api_key: String,

    /// Network-native endpoint: Trongrid REST (TRON), JSON-RPC (Polygon, Solana)
    rpc_url: String,

    /// Stablecoin contract address (TRC-20 / ERC-20) or mint (SPL)
    token_contract: String,

    /// Token decimals used to convert raw amounts to human units
    token_decimals: u32,

    /// Extended public key deposit addresses are derived from
    xpub: String,

    /// USD minimum below which a deposit is marked FAILED
    deposit_min_usd: f64,

    /// Minimum withdrawal amount in USD
    withdrawal_min: f64,

    /// Fixed withdrawal fee in USD
    withdrawal_fee: f64,

    /// Default chunk size for block-range log scans
    scan_chunk: u64,

    /// How far behind head the cursor starts on first scan
    initial_blocks_back: u64,
}

impl NetworkSettings {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tatum_url: String,
        tatum_api_key: String,
        rpc_url: String,
        token_contract: String,
        token_decimals: u32,
        xpub: String,
        deposit_min_usd: f64,
        withdrawal_min: f64,
        withdrawal_fee: f64,
        scan_chunk: u64,
        initial_blocks_back: u64,
    ) -> Self {
        Self {
            tatum_url,
            tatum_api_key,
            rpc_url,
            token_contract,
            token_decimals,
            xpub,
            deposit_min_usd,
            withdrawal_min,
            withdrawal_fee,
            scan_chunk,
            initial_blocks_back,
        }
    }

    fn from_env(network: Network) -> Self {
        let prefix = match network {
            Network::Tron => "TRON",
            Network::Polygon => "POLYGON",
            Network::Solana => "SOLANA",
        };

        let tatum_url = std::env::var("TATUM_API_URL")
            .ok()
            .unwrap_or_else(|| "https://api.tatum.io".to_string());

        let tatum_api_key = std::env::var("TATUM_API_KEY").ok().unwrap_or_default();

        let rpc_url = std::env::var(format!("{prefix}_RPC_URL"))
            .ok()
            .unwrap_or_else(|| default_rpc_url(network).to_string());

        let token_contract = std::env::var(format!("{prefix}_TOKEN_CONTRACT"))
            .ok()
            .unwrap_or_else(|| default_token_contract(network).to_string());

        let token_decimals = std::env::var(format!("{prefix}_TOKEN_DECIMALS"))
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(6);

        let xpub = std::env::var(format!("{prefix}_XPUB")).ok().unwrap_or_default();

        let deposit_min_usd = std::env::var(format!("{prefix}_DEPOSIT_MIN_USD"))
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(DEFAULT_DEPOSIT_MIN_USD);

        let withdrawal_min = std::env::var(format!("{prefix}_WITHDRAWAL_MIN"))
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(DEFAULT_WITHDRAWAL_MIN_USD);

        let withdrawal_fee = std::env::var(format!("{prefix}_WITHDRAWAL_FEE"))
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(1.0);

        let scan_chunk = std::env::var(format!("{prefix}_SCAN_CHUNK"))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_SCAN_CHUNK_BLOCKS);

        let initial_blocks_back = std::env::var(format!("{prefix}_INITIAL_BLOCKS_BACK"))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_INITIAL_BLOCKS_BACK);

        Self::new(
            tatum_url,
            tatum_api_key,
            rpc_url,
            token_contract,
            token_decimals,
            xpub,
            deposit_min_usd,
            withdrawal_min,
            withdrawal_fee,
            scan_chunk,
            initial_blocks_back,
        )
    }

    /// Getter for `tatum_url`
    pub(crate) fn tatum_url(&self) -> &str {
        &self.tatum_url
    }

    /// Getter for `tatum_api_key`
    pub(crate) fn tatum_api_key(&self) -> &str {
        &self.tatum_api_key
    }

    /// Getter for `rpc_url`
    pub(crate) fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Getter for `token_contract`
    pub(crate) fn token_contract(&self) -> &str {
        &self.token_contract
    }

    /// Getter for `token_decimals`
    pub(crate) fn token_decimals(&self) -> u32 {
        self.token_decimals
    }

    /// Getter for `xpub`
    pub(crate) fn xpub(&self) -> &str {
        &self.xpub
    }

    /// Getter for `deposit_min_usd`
    pub(crate) fn deposit_min_usd(&self) -> f64 {
        self.deposit_min_usd
    }

    /// Getter for `withdrawal_min`
    pub(crate) fn withdrawal_min(&self) -> f64 {
        self.withdrawal_min
    }

    /// Getter for `withdrawal_fee`
    pub(crate) fn withdrawal_fee(&self) -> f64 {
        self.withdrawal_fee
    }

    /// Getter for `scan_chunk`
    pub(crate) fn scan_chunk(&self) -> u64 {
        self.scan_chunk
    }

    /// Getter for `initial_blocks_back`
    pub(crate) fn initial_blocks_back(&self) -> u64 {
        self.initial_blocks_back
    }
}

fn default_rpc_url(network: Network) -> &'static str {
    match network {
        Network::Tron => "https://api.trongrid.io",
        Network::Polygon => "https://polygon-rpc.com",
        Network::Solana => "https://api.mainnet-beta.solana.com",
    }
}

fn default_token_contract(network: Network) -> &'static str {
    match network {
        // USDT on TRON
        Network::Tron => "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t",
        // USDC on Polygon PoS
        Network::Polygon => "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359",
        // USDC mint on Solana
        Network::Solana => "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
    }
}

/// Service-wide configuration loaded once at startup.
#[derive(Debug, Clone)]
pub(crate) struct TreasuryConfig {
    /// SQLite connection string
    database_url: String,

    /// Deposit cycle interval per network in seconds
    deposit_cycle_interval_s: u64,

    /// Withdrawal sender interval in seconds
    withdrawal_send_interval_s: u64,

    /// Per-network chain settings
    networks: HashMap<Network, NetworkSettings>,
}

impl TreasuryConfig {
    pub(crate) fn new() -> Self {
        dotenv().ok(); // Load `.env` file if present

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .unwrap_or_else(|| "sqlite://treasury.db?mode=rwc".to_string());

        let deposit_cycle_interval_s = std::env::var("DEPOSIT_CYCLE_INTERVAL_S")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_DEPOSIT_CYCLE_INTERVAL_S);

        let withdrawal_send_interval_s = std::env::var("WITHDRAWAL_SEND_INTERVAL_S")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_WITHDRAWAL_SEND_INTERVAL_S);

        let networks = Network::ALL
            .into_iter()
            .map(|network| (network, NetworkSettings::from_env(network)))
            .collect();

        info!(
            deposit_cycle_interval_s,
            withdrawal_send_interval_s, "Loaded treasury config:"
        );

        TreasuryConfig {
            database_url,
            deposit_cycle_interval_s,
            withdrawal_send_interval_s,
            networks,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_networks(
        database_url: String,
        networks: HashMap<Network, NetworkSettings>,
    ) -> Self {
        TreasuryConfig {
            database_url,
            deposit_cycle_interval_s: DEFAULT_DEPOSIT_CYCLE_INTERVAL_S,
            withdrawal_send_interval_s: DEFAULT_WITHDRAWAL_SEND_INTERVAL_S,
            networks,
        }
    }

    /// Getter for `database_url`
    pub(crate) fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Getter for `deposit_cycle_interval_s`
    pub(crate) fn deposit_cycle_interval(&self) -> u64 {
        self.deposit_cycle_interval_s
    }

    /// Getter for `withdrawal_send_interval_s`
    pub(crate) fn withdrawal_send_interval(&self) -> u64 {
        self.withdrawal_send_interval_s
    }

    /// Settings for one network; every supported network has an entry.
    pub(crate) fn network(&self, network: Network) -> &NetworkSettings {
        self.networks
            .get(&network)
            .expect("settings exist for every supported network")
    }
}
