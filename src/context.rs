use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::chains::keys::KeyProvider;
use crate::chains::Chains;
use crate::config::TreasuryConfig;
use crate::types::network::Network;

/// Shared context for the deposit and withdrawal pipelines.
///
/// Constructed once at startup and passed around behind an `Arc`. The
/// per-network cycle locks serialize overlapping deposit cycles (cron tick
/// overlapping a manual trigger); the send lock serializes payout sends so
/// two admins cannot race the same request onto the chain.
pub(crate) struct TreasuryContext {
    config: TreasuryConfig,
    pool: SqlitePool,
    chains: Chains,
    keys: KeyProvider,
    cycle_locks: HashMap<Network, Mutex<()>>,
    send_lock: Mutex<()>,
}

impl TreasuryContext {
    pub(crate) fn new(
        config: TreasuryConfig,
        pool: SqlitePool,
        chains: Chains,
        keys: KeyProvider,
    ) -> Self {
        let cycle_locks = Network::ALL
            .into_iter()
            .map(|network| (network, Mutex::new(())))
            .collect();

        Self {
            config,
            pool,
            chains,
            keys,
            cycle_locks,
            send_lock: Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> &TreasuryConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn chains(&self) -> &Chains {
        &self.chains
    }

    pub(crate) fn keys(&self) -> &KeyProvider {
        &self.keys
    }

    pub(crate) fn cycle_lock(&self, network: Network) -> &Mutex<()> {
        self.cycle_locks
            .get(&network)
            .expect("lock exists for every supported network")
    }

    pub(crate) fn send_lock(&self) -> &Mutex<()> {
        &self.send_lock
    }
}
