use sqlx::SqlitePool;

use crate::types::network::Network;

/// Last fully processed block for a network, if a cursor exists yet.
pub(crate) async fn get(pool: &SqlitePool, network: Network) -> Result<Option<u64>, sqlx::Error> {
    let row: Option<i64> =
        sqlx::query_scalar("SELECT last_processed_block FROM block_cursors WHERE network = ?")
            .bind(network)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|block| block as u64))
}

/// Create the cursor on first scan, `initial_blocks_back` behind head so a
/// fresh network never scans from genesis. Returns the effective cursor,
/// which may come from a concurrent initializer.
pub(crate) async fn init(
    pool: &SqlitePool,
    network: Network,
    head: u64,
    initial_blocks_back: u64,
) -> Result<u64, sqlx::Error> {
    let start = head.saturating_sub(initial_blocks_back);

    sqlx::query("INSERT OR IGNORE INTO block_cursors (network, last_processed_block) VALUES (?, ?)")
        .bind(network)
        .bind(start as i64)
        .execute(pool)
        .await?;

    let current: i64 =
        sqlx::query_scalar("SELECT last_processed_block FROM block_cursors WHERE network = ?")
            .bind(network)
            .fetch_one(pool)
            .await?;

    Ok(current as u64)
}

/// Advance the cursor to `to_block`. Only called after the whole range up to
/// `to_block` was scanned and its transfers recorded; the guard keeps the
/// cursor monotonic under concurrent cycles.
pub(crate) async fn advance(
    pool: &SqlitePool,
    network: Network,
    to_block: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE block_cursors
         SET last_processed_block = ?, updated_at = CURRENT_TIMESTAMP
         WHERE network = ? AND last_processed_block < ?",
    )
    .bind(to_block as i64)
    .bind(network)
    .bind(to_block as i64)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn initializes_behind_head_and_clamps_at_zero() {
        let pool = test_pool().await;

        let cursor = init(&pool, Network::Polygon, 10_000, 2_000).await.unwrap();
        assert_eq!(cursor, 8_000);

        let cursor = init(&pool, Network::Tron, 500, 2_000).await.unwrap();
        assert_eq!(cursor, 0);
    }

    #[tokio::test]
    async fn init_is_a_noop_once_present() {
        let pool = test_pool().await;

        init(&pool, Network::Polygon, 10_000, 2_000).await.unwrap();
        advance(&pool, Network::Polygon, 9_000).await.unwrap();

        let cursor = init(&pool, Network::Polygon, 20_000, 2_000).await.unwrap();
        assert_eq!(cursor, 9_000);
    }

    #[tokio::test]
    async fn never_moves_backward() {
        let pool = test_pool().await;
        init(&pool, Network::Polygon, 10_000, 2_000).await.unwrap();

        advance(&pool, Network::Polygon, 9_500).await.unwrap();
        advance(&pool, Network::Polygon, 9_200).await.unwrap();

        assert_eq!(get(&pool, Network::Polygon).await.unwrap(), Some(9_500));
    }

    #[tokio::test]
    async fn absent_cursor_reads_as_none() {
        let pool = test_pool().await;
        assert_eq!(get(&pool, Network::Solana).await.unwrap(), None);
    }
}
