use alloy_primitives::keccak256;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::chains::error::ChainError;
use crate::chains::ChainClient;
use crate::types::network::Network;

/// Error types for key resolution
#[derive(Debug, Error)]
pub(crate) enum KeyError {
    #[error("No private key available for {0}: set {1} or MASTER_SEED")]
    Unavailable(Network, String),
}

/// Resolves signing material and master addresses per network.
///
/// Preference order is an exact environment override, else deterministic
/// derivation from the master seed. Results are cached after first
/// resolution. Constructed once at startup and injected into the pipelines;
/// key material is never logged and never appears in error messages.
pub(crate) struct KeyProvider {
    master_seed: Option<String>,
    key_cache: Mutex<HashMap<Network, String>>,
    address_cache: Mutex<HashMap<Network, String>>,
}

impl KeyProvider {
    pub(crate) fn from_env() -> Self {
        Self::new(std::env::var("MASTER_SEED").ok())
    }

    pub(crate) fn new(master_seed: Option<String>) -> Self {
        Self {
            master_seed,
            key_cache: Mutex::new(HashMap::new()),
            address_cache: Mutex::new(HashMap::new()),
        }
    }

    fn env_prefix(network: Network) -> &'static str {
        match network {
            Network::Tron => "TRON",
            Network::Polygon => "POLYGON",
            Network::Solana => "SOLANA",
        }
    }

    /// Resolve the payout signing key for `network`.
    pub(crate) fn resolve_private_key(&self, network: Network) -> Result<String, KeyError> {
        if let Some(cached) = self
            .key_cache
            .lock()
            .expect("key cache lock")
            .get(&network)
        {
            return Ok(cached.clone());
        }

        let override_var = format!("{}_PRIVATE_KEY", Self::env_prefix(network));
        let resolved = match std::env::var(&override_var) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                let seed = self
                    .master_seed
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| KeyError::Unavailable(network, override_var))?;
                derive_key(seed, network)
            }
        };

        self.key_cache
            .lock()
            .expect("key cache lock")
            .insert(network, resolved.clone());

        Ok(resolved)
    }

    /// Resolve the master custody address for `network`: environment
    /// override first, else the chain's address at derivation index 0.
    pub(crate) async fn resolve_master_address(
        &self,
        network: Network,
        client: &dyn ChainClient,
    ) -> Result<String, ChainError> {
        if let Some(cached) = self
            .address_cache
            .lock()
            .expect("address cache lock")
            .get(&network)
        {
            return Ok(cached.clone());
        }

        let override_var = format!("{}_MASTER_ADDRESS", Self::env_prefix(network));
        let resolved = match std::env::var(&override_var) {
            Ok(address) if !address.is_empty() => address,
            _ => client.derive_address(0).await?,
        };

        self.address_cache
            .lock()
            .expect("address cache lock")
            .insert(network, resolved.clone());

        Ok(resolved)
    }
}

/// Deterministic per-network key from the master seed.
fn derive_key(seed: &str, network: Network) -> String {
    let digest = keccak256(format!("{}:{}", seed, network.tag()).as_bytes());
    hex::encode(digest)
}

impl std::fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProvider")
            .field("master_seed", &self.master_seed.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
