use sqlx::SqlitePool;

use crate::deposits::models::{Deposit, DepositStatus, InsertOutcome};
use crate::ledger::store::is_unique_violation;
use crate::types::network::Network;

const DEPOSIT_COLUMNS: &str = "id, user_id, network, tx_hash, deposit_address, wallet_address_id,
     raw_amount, amount_usd, price_used, status, is_below_minimum,
     detected_at, confirmed_at, credited_at";

/// Record a freshly detected transfer.
///
/// The unique (network, tx_hash, deposit_address) key makes this safe under
/// concurrent detection: losing the race reads as [`InsertOutcome::AlreadyExists`].
pub(crate) async fn record_detected(
    pool: &SqlitePool,
    user_id: &str,
    network: Network,
    tx_hash: &str,
    deposit_address: &str,
    wallet_address_id: i64,
    raw_amount: &str,
) -> Result<InsertOutcome, sqlx::Error> {
    let inserted = sqlx::query(
        "INSERT INTO deposits
           (user_id, network, tx_hash, deposit_address, wallet_address_id, raw_amount)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(network)
    .bind(tx_hash)
    .bind(deposit_address)
    .bind(wallet_address_id)
    .bind(raw_amount)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(InsertOutcome::Created),
        Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::AlreadyExists),
        Err(e) => Err(e),
    }
}

/// Deposits on one network in a given state, oldest first.
pub(crate) async fn list_by_status(
    pool: &SqlitePool,
    network: Network,
    status: DepositStatus,
) -> Result<Vec<Deposit>, sqlx::Error> {
    sqlx::query_as::<_, Deposit>(&format!(
        "SELECT {DEPOSIT_COLUMNS} FROM deposits
         WHERE network = ? AND status = ? ORDER BY id ASC"
    ))
    .bind(network)
    .bind(status)
    .fetch_all(pool)
    .await
}

/// Look up one deposit by its idempotency key.
pub(crate) async fn find_by_key(
    pool: &SqlitePool,
    network: Network,
    tx_hash: &str,
    deposit_address: &str,
) -> Result<Option<Deposit>, sqlx::Error> {
    sqlx::query_as::<_, Deposit>(&format!(
        "SELECT {DEPOSIT_COLUMNS} FROM deposits
         WHERE network = ? AND tx_hash = ? AND deposit_address = ?"
    ))
    .bind(network)
    .bind(tx_hash)
    .bind(deposit_address)
    .fetch_optional(pool)
    .await
}

/// Whether the idempotency key is already tracked; lets detectors skip
/// expensive per-transaction lookups.
pub(crate) async fn key_exists(
    pool: &SqlitePool,
    network: Network,
    tx_hash: &str,
    deposit_address: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM deposits
         WHERE network = ? AND tx_hash = ? AND deposit_address = ?",
    )
    .bind(network)
    .bind(tx_hash)
    .bind(deposit_address)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Whether a transaction hash is already tracked on a network, for any
/// deposit address.
pub(crate) async fn tx_recorded(
    pool: &SqlitePool,
    network: Network,
    tx_hash: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM deposits WHERE network = ? AND tx_hash = ?")
            .bind(network)
            .bind(tx_hash)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// DETECTED -> CONFIRMED, fixing the USD amount and the price applied.
pub(crate) async fn mark_confirmed(
    pool: &SqlitePool,
    deposit_id: i64,
    amount_usd: f64,
    price_used: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE deposits
         SET status = ?, amount_usd = ?, price_used = ?, confirmed_at = CURRENT_TIMESTAMP
         WHERE id = ? AND status = ?",
    )
    .bind(DepositStatus::Confirmed)
    .bind(amount_usd)
    .bind(price_used)
    .bind(deposit_id)
    .bind(DepositStatus::Detected)
    .execute(pool)
    .await?;

    Ok(())
}

/// DETECTED -> FAILED for a below-minimum transfer. Terminal.
pub(crate) async fn mark_failed_below_minimum(
    pool: &SqlitePool,
    deposit_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE deposits
         SET status = ?, is_below_minimum = 1
         WHERE id = ? AND status = ?",
    )
    .bind(DepositStatus::Failed)
    .bind(deposit_id)
    .bind(DepositStatus::Detected)
    .execute(pool)
    .await?;

    Ok(())
}

/// CONFIRMED -> CREDITED.
pub(crate) async fn mark_credited(pool: &SqlitePool, deposit_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE deposits
         SET status = ?, credited_at = CURRENT_TIMESTAMP
         WHERE id = ? AND status = ?",
    )
    .bind(DepositStatus::Credited)
    .bind(deposit_id)
    .bind(DepositStatus::Confirmed)
    .execute(pool)
    .await?;

    Ok(())
}
