use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::chains::error::ChainError;
use crate::chains::ChainClient;
use crate::ledger::store::{get_user, is_unique_violation};
use crate::types::network::Network;

/// Error types for deposit address issuance
#[derive(Debug, Error)]
pub(crate) enum AddressError {
    #[error("unknown user")]
    NoUser,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A per-user deposit address. Immutable once created.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub(crate) struct WalletAddress {
    pub(crate) id: i64,
    pub(crate) user_id: String,
    pub(crate) network: Network,
    pub(crate) address: String,
    pub(crate) derivation_index: i64,
}

/// All deposit addresses on one network; the detection phases filter chain
/// activity against this set.
pub(crate) async fn for_network(
    pool: &SqlitePool,
    network: Network,
) -> Result<Vec<WalletAddress>, sqlx::Error> {
    sqlx::query_as::<_, WalletAddress>(
        "SELECT id, user_id, network, address, derivation_index
         FROM wallet_addresses WHERE network = ?",
    )
    .bind(network)
    .fetch_all(pool)
    .await
}

/// Look up one user's address on one network.
pub(crate) async fn find(
    pool: &SqlitePool,
    user_id: &str,
    network: Network,
) -> Result<Option<WalletAddress>, sqlx::Error> {
    sqlx::query_as::<_, WalletAddress>(
        "SELECT id, user_id, network, address, derivation_index
         FROM wallet_addresses WHERE user_id = ? AND network = ?",
    )
    .bind(user_id)
    .bind(network)
    .fetch_optional(pool)
    .await
}

/// Look up the owner of a deposit address.
pub(crate) async fn find_by_address(
    pool: &SqlitePool,
    network: Network,
    address: &str,
) -> Result<Option<WalletAddress>, sqlx::Error> {
    sqlx::query_as::<_, WalletAddress>(
        "SELECT id, user_id, network, address, derivation_index
         FROM wallet_addresses WHERE network = ? AND address = ?",
    )
    .bind(network)
    .bind(address)
    .fetch_optional(pool)
    .await
}

/// Return the user's deposit address for `network`, deriving and persisting
/// it on first request.
///
/// Index 0 is reserved for the master address, so user indices start at 1.
/// A unique-constraint violation on insert means a concurrent request
/// created the row first; the fresh row is read back instead.
pub(crate) async fn deposit_address_for(
    pool: &SqlitePool,
    client: &dyn ChainClient,
    user_id: &str,
    network: Network,
) -> Result<WalletAddress, AddressError> {
    if get_user(pool, user_id).await?.is_none() {
        return Err(AddressError::NoUser);
    }

    if let Some(existing) = find(pool, user_id, network).await? {
        return Ok(existing);
    }

    let next_index: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(derivation_index), 0) + 1 FROM wallet_addresses WHERE network = ?",
    )
    .bind(network)
    .fetch_one(pool)
    .await?;

    let address = client.derive_address(next_index as u32).await?;

    let inserted = sqlx::query(
        "INSERT INTO wallet_addresses (user_id, network, address, derivation_index)
         VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(network)
    .bind(&address)
    .bind(next_index)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {
            info!(%user_id, %network, %address, derivation_index = next_index, "Issued deposit address");
        }
        Err(e) if is_unique_violation(&e) => {
            // Concurrent issuance won; fall through to the read below.
        }
        Err(e) => return Err(e.into()),
    }

    find(pool, user_id, network)
        .await?
        .ok_or(AddressError::NoUser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::tron::TronClient;
    use crate::config::NetworkSettings;
    use crate::db::test_pool;
    use crate::ledger::store::create_user;

    fn settings(base_url: &str) -> NetworkSettings {
        NetworkSettings::new(
            base_url.to_string(),
            "test-key".to_string(),
            base_url.to_string(),
            "TContract".to_string(),
            6,
            "xpub-test".to_string(),
            1.0,
            10.0,
            1.0,
            1000,
            2000,
        )
    }

    #[tokio::test]
    async fn issues_once_and_reuses_thereafter() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();

        let mut server = mockito::Server::new_async().await;
        let derive = server
            .mock("GET", "/v3/tron/address/xpub-test/1")
            .with_body(r#"{"address":"TFirstDerived"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));

        let first = deposit_address_for(&pool, &client, "u1", Network::Tron)
            .await
            .unwrap();
        let second = deposit_address_for(&pool, &client, "u1", Network::Tron)
            .await
            .unwrap();

        assert_eq!(first.address, "TFirstDerived");
        assert_eq!(first.id, second.id);
        assert_eq!(first.derivation_index, 1);
        derive.assert_async().await;
    }

    #[tokio::test]
    async fn indices_advance_per_network() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();
        create_user(&pool, "u2").await.unwrap();

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/tron/address/xpub-test/1")
            .with_body(r#"{"address":"TAddrOne"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v3/tron/address/xpub-test/2")
            .with_body(r#"{"address":"TAddrTwo"}"#)
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));

        let first = deposit_address_for(&pool, &client, "u1", Network::Tron)
            .await
            .unwrap();
        let second = deposit_address_for(&pool, &client, "u2", Network::Tron)
            .await
            .unwrap();

        assert_eq!(first.derivation_index, 1);
        assert_eq!(second.derivation_index, 2);
        assert_ne!(first.address, second.address);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let pool = test_pool().await;
        let server = mockito::Server::new_async().await;
        let client = TronClient::new(&settings(&server.url()));

        let result = deposit_address_for(&pool, &client, "ghost", Network::Tron).await;
        assert!(matches!(result, Err(AddressError::NoUser)));
    }
}
