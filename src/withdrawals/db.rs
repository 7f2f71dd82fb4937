use sqlx::SqlitePool;

use crate::ledger::models::TxType;
use crate::ledger::store::is_unique_violation;
use crate::types::network::Network;
use crate::withdrawals::models::{WithdrawalRequest, WithdrawalStatus};

const REQUEST_COLUMNS: &str = "id, user_id, network, to_address, amount_gross, fee, amount_net,
     status, tx_id, error, attempt, created_at";

/// Fetch one request.
pub(crate) async fn get(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<WithdrawalRequest>, sqlx::Error> {
    sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM withdrawal_requests WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// All APPROVED requests, oldest first, for the batch sender.
pub(crate) async fn list_approved(pool: &SqlitePool) -> Result<Vec<WithdrawalRequest>, sqlx::Error> {
    sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM withdrawal_requests WHERE status = ? ORDER BY id ASC"
    ))
    .bind(WithdrawalStatus::Approved)
    .fetch_all(pool)
    .await
}

/// Atomically reserve funds and open a PENDING request.
///
/// One transaction: guarded gross-amount debit, request insert, WITHDRAWAL
/// ledger entry under `withdrawal:<network>:<id>:0`. `None` means the balance
/// did not cover the gross amount and nothing was written.
pub(crate) async fn create_request(
    pool: &SqlitePool,
    user_id: &str,
    network: Network,
    to_address: &str,
    amount_gross: f64,
    fee: f64,
    amount_net: f64,
) -> Result<Option<(WithdrawalRequest, f64)>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let debited =
        sqlx::query("UPDATE users SET balance = balance - ? WHERE id = ? AND balance >= ?")
            .bind(amount_gross)
            .bind(user_id)
            .bind(amount_gross)
            .execute(&mut *tx)
            .await?;

    if debited.rows_affected() == 0 {
        return Ok(None);
    }

    let request_id = sqlx::query(
        "INSERT INTO withdrawal_requests
           (user_id, network, to_address, amount_gross, fee, amount_net)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(network)
    .bind(to_address)
    .bind(amount_gross)
    .bind(fee)
    .bind(amount_net)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    sqlx::query(
        "INSERT INTO transactions (user_id, external_id, tx_type, amount, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(format!("withdrawal:{}:{}:0", network, request_id))
    .bind(TxType::Withdrawal)
    .bind(-amount_gross)
    .bind(format!("Withdrawal to {} on {}", to_address, network))
    .execute(&mut *tx)
    .await?;

    let balance: f64 = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

    let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM withdrawal_requests WHERE id = ?"
    ))
    .bind(request_id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some((request, balance)))
}

/// PENDING -> APPROVED. False when the request was in any other state.
pub(crate) async fn approve(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query("UPDATE withdrawal_requests SET status = ? WHERE id = ? AND status = ?")
        .bind(WithdrawalStatus::Approved)
        .bind(id)
        .bind(WithdrawalStatus::Pending)
        .execute(pool)
        .await?;

    Ok(updated.rows_affected() == 1)
}

/// Claim a request for sending: APPROVED (or a PROCESSING row left behind by
/// an earlier deployment) with `tx_id` still unset. The guarded update plus
/// the tx_id check is the anti-double-payout gate.
pub(crate) async fn claim_for_send(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE withdrawal_requests SET status = ?
         WHERE id = ? AND status IN (?, ?) AND tx_id IS NULL",
    )
    .bind(WithdrawalStatus::Processing)
    .bind(id)
    .bind(WithdrawalStatus::Approved)
    .bind(WithdrawalStatus::Processing)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

/// Record a successful send: `tx_id` is written exactly once.
pub(crate) async fn mark_sent(pool: &SqlitePool, id: i64, tx_id: &str) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE withdrawal_requests SET status = ?, tx_id = ? WHERE id = ? AND tx_id IS NULL",
    )
    .bind(WithdrawalStatus::Sent)
    .bind(tx_id)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() == 1)
}

/// Fail a request and refund the gross amount, atomically.
///
/// One transaction: status FAILED with the error recorded, balance restored,
/// REFUND ledger entry under `refund:<network>:<id>:<attempt>`. A duplicate
/// refund entry means another path already refunded; nothing is re-applied.
pub(crate) async fn fail_with_refund(
    pool: &SqlitePool,
    request: &WithdrawalRequest,
    error: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE withdrawal_requests SET status = ?, error = ? WHERE id = ?")
        .bind(WithdrawalStatus::Failed)
        .bind(error)
        .bind(request.id)
        .execute(&mut *tx)
        .await?;

    let refund_entry = sqlx::query(
        "INSERT INTO transactions (user_id, external_id, tx_type, amount, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&request.user_id)
    .bind(format!(
        "refund:{}:{}:{}",
        request.network, request.id, request.attempt
    ))
    .bind(TxType::Refund)
    .bind(request.amount_gross)
    .bind(format!("Refund of withdrawal {}", request.id))
    .execute(&mut *tx)
    .await;

    match refund_entry {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => return Ok(()), // already refunded
        Err(e) => return Err(e),
    }

    sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
        .bind(request.amount_gross)
        .bind(&request.user_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Re-arm a FAILED request: fresh guarded debit, attempt bumped so the new
/// WITHDRAWAL ledger entry gets a distinct external id, status back to
/// APPROVED. `None` when the balance no longer covers the gross amount.
pub(crate) async fn retry_request(
    pool: &SqlitePool,
    request: &WithdrawalRequest,
) -> Result<Option<WithdrawalRequest>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let debited =
        sqlx::query("UPDATE users SET balance = balance - ? WHERE id = ? AND balance >= ?")
            .bind(request.amount_gross)
            .bind(&request.user_id)
            .bind(request.amount_gross)
            .execute(&mut *tx)
            .await?;

    if debited.rows_affected() == 0 {
        return Ok(None);
    }

    let next_attempt = request.attempt + 1;

    let rearmed = sqlx::query(
        "UPDATE withdrawal_requests SET status = ?, error = NULL, attempt = ?
         WHERE id = ? AND status = ?",
    )
    .bind(WithdrawalStatus::Approved)
    .bind(next_attempt)
    .bind(request.id)
    .bind(WithdrawalStatus::Failed)
    .execute(&mut *tx)
    .await?;

    if rearmed.rows_affected() == 0 {
        // Lost a race with another transition; leave everything untouched.
        return Ok(None);
    }

    sqlx::query(
        "INSERT INTO transactions (user_id, external_id, tx_type, amount, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&request.user_id)
    .bind(format!(
        "withdrawal:{}:{}:{}",
        request.network, request.id, next_attempt
    ))
    .bind(TxType::Withdrawal)
    .bind(-request.amount_gross)
    .bind(format!("Retry of withdrawal {}", request.id))
    .execute(&mut *tx)
    .await?;

    let request = sqlx::query_as::<_, WithdrawalRequest>(&format!(
        "SELECT {REQUEST_COLUMNS} FROM withdrawal_requests WHERE id = ?"
    ))
    .bind(request.id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(request))
}
