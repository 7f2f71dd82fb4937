use sqlx::SqlitePool;

use crate::ledger::models::{LedgerEntry, LedgerOutcome, TxType, UserAccount};

/// Whether a database error is a unique-constraint violation.
///
/// Both the deposit and ledger paths treat this as "another writer got there
/// first", so it is surfaced as a tagged outcome rather than an error.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Fetch a user account.
pub(crate) async fn get_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<UserAccount>, sqlx::Error> {
    sqlx::query_as::<_, UserAccount>("SELECT id, balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

/// Insert a user account with a zero balance.
pub(crate) async fn create_user(pool: &SqlitePool, user_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO users (id, balance) VALUES (?, 0)")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically record a ledger entry and credit the user's balance.
///
/// The entry insert and the balance increment commit together or not at all.
/// A duplicate `external_id` rolls back and reports [`LedgerOutcome::AlreadyRecorded`].
pub(crate) async fn credit(
    pool: &SqlitePool,
    user_id: &str,
    external_id: &str,
    tx_type: TxType,
    amount: f64,
    description: &str,
) -> Result<LedgerOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO transactions (user_id, external_id, tx_type, amount, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(external_id)
    .bind(tx_type)
    .bind(amount)
    .bind(description)
    .execute(&mut *tx)
    .await;

    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            return Ok(LedgerOutcome::AlreadyRecorded);
        }
        return Err(e);
    }

    let updated = sqlx::query("UPDATE users SET balance = balance + ? WHERE id = ?")
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }

    let balance: f64 = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(LedgerOutcome::Applied { balance })
}

/// Atomically record a ledger entry and debit the user's balance.
///
/// The decrement is guarded (`balance >= amount`), so the caller can rely on
/// funds being reserved exactly once; the ledger entry carries the negative
/// amount. [`LedgerOutcome::InsufficientFunds`] leaves everything untouched.
pub(crate) async fn debit(
    pool: &SqlitePool,
    user_id: &str,
    external_id: &str,
    tx_type: TxType,
    amount: f64,
    description: &str,
) -> Result<LedgerOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated =
        sqlx::query("UPDATE users SET balance = balance - ? WHERE id = ? AND balance >= ?")
            .bind(amount)
            .bind(user_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

    if updated.rows_affected() == 0 {
        return Ok(LedgerOutcome::InsufficientFunds);
    }

    let inserted = sqlx::query(
        "INSERT INTO transactions (user_id, external_id, tx_type, amount, description)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(external_id)
    .bind(tx_type)
    .bind(-amount)
    .bind(description)
    .execute(&mut *tx)
    .await;

    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            return Ok(LedgerOutcome::AlreadyRecorded);
        }
        return Err(e);
    }

    let balance: f64 = sqlx::query_scalar("SELECT balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(LedgerOutcome::Applied { balance })
}

/// A user's ledger entries, newest first. The transaction log is the audit
/// trail: rows are only ever inserted.
pub(crate) async fn entries_for_user(
    pool: &SqlitePool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<LedgerEntry>, sqlx::Error> {
    sqlx::query_as::<_, LedgerEntry>(
        "SELECT id, user_id, external_id, tx_type, amount, description, created_at
         FROM transactions WHERE user_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Number of ledger entries recorded for a user.
#[cfg(test)]
pub(crate) async fn entry_count(pool: &SqlitePool, user_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("count query")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn credit_is_idempotent_on_external_id() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();

        let first = credit(&pool, "u1", "deposit:MATIC:0xabc:0xdef", TxType::Deposit, 1.5, "")
            .await
            .unwrap();
        assert_eq!(first, LedgerOutcome::Applied { balance: 1.5 });

        let second = credit(&pool, "u1", "deposit:MATIC:0xabc:0xdef", TxType::Deposit, 1.5, "")
            .await
            .unwrap();
        assert_eq!(second, LedgerOutcome::AlreadyRecorded);

        let user = get_user(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(user.balance, 1.5);
        assert_eq!(entry_count(&pool, "u1").await, 1);
    }

    #[tokio::test]
    async fn concurrent_credits_apply_once() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();

        let (a, b) = tokio::join!(
            credit(&pool, "u1", "deposit:TRON:tx9:addr", TxType::Deposit, 3.0, ""),
            credit(&pool, "u1", "deposit:TRON:tx9:addr", TxType::Deposit, 3.0, ""),
        );

        let outcomes = [a.unwrap(), b.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, LedgerOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1);

        let user = get_user(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(user.balance, 3.0);
        assert_eq!(entry_count(&pool, "u1").await, 1);
    }

    #[tokio::test]
    async fn debit_refuses_overdraft() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();
        credit(&pool, "u1", "seed", TxType::Deposit, 5.0, "").await.unwrap();

        let outcome = debit(&pool, "u1", "withdrawal:TRON:1:0", TxType::Withdrawal, 10.0, "")
            .await
            .unwrap();
        assert_eq!(outcome, LedgerOutcome::InsufficientFunds);

        let user = get_user(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(user.balance, 5.0);
        assert_eq!(entry_count(&pool, "u1").await, 1);
    }

    #[tokio::test]
    async fn debit_records_negative_amount() {
        let pool = test_pool().await;
        create_user(&pool, "u1").await.unwrap();
        credit(&pool, "u1", "seed", TxType::Deposit, 50.0, "").await.unwrap();

        let outcome = debit(&pool, "u1", "withdrawal:TRON:1:0", TxType::Withdrawal, 10.0, "")
            .await
            .unwrap();
        assert_eq!(outcome, LedgerOutcome::Applied { balance: 40.0 });

        let amount: f64 = sqlx::query_scalar(
            "SELECT amount FROM transactions WHERE external_id = 'withdrawal:TRON:1:0'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(amount, -10.0);
    }
}
