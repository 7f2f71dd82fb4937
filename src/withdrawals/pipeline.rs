use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::context::TreasuryContext;
use crate::ledger::store::get_user;
use crate::types::network::Network;
use crate::withdrawals::db;
use crate::withdrawals::models::{
    CreateOutcome, WithdrawalError, WithdrawalRequest, WithdrawalStatus,
};

/// Create a withdrawal request, reserving the gross amount immediately.
///
/// Funds are debited at creation rather than at send time, deliberately
/// asymmetric with deposits (which credit only after confirmation): a payout
/// must never be attempted with unreserved funds.
pub(crate) async fn create(
    ctx: &TreasuryContext,
    user_id: &str,
    network: Network,
    to_address: &str,
    amount: f64,
) -> Result<CreateOutcome, sqlx::Error> {
    let settings = ctx.config().network(network);

    if get_user(ctx.pool(), user_id).await?.is_none() {
        return Ok(CreateOutcome::NoUser);
    }

    if amount < settings.withdrawal_min() {
        return Ok(CreateOutcome::BelowMinimum {
            minimum: settings.withdrawal_min(),
        });
    }

    let fee = settings.withdrawal_fee();
    let amount_net = amount - fee;
    if amount_net <= 0.0 {
        return Ok(CreateOutcome::InvalidAmount);
    }

    match db::create_request(ctx.pool(), user_id, network, to_address, amount, fee, amount_net)
        .await?
    {
        Some((request, balance)) => {
            info!(
                request_id = request.id,
                %user_id,
                %network,
                amount_gross = request.amount_gross,
                balance,
                "Withdrawal request created"
            );
            Ok(CreateOutcome::Ok { request, balance })
        }
        None => Ok(CreateOutcome::NoFunds),
    }
}

/// PENDING -> APPROVED.
pub(crate) async fn approve(
    ctx: &TreasuryContext,
    id: i64,
) -> Result<WithdrawalRequest, WithdrawalError> {
    let request = db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)?;

    if !db::approve(ctx.pool(), id).await? {
        return Err(WithdrawalError::WrongState(request.status));
    }

    info!(request_id = id, "Withdrawal approved");
    db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)
}

/// Send one approved payout on chain.
///
/// Allowed only from APPROVED (or a legacy PROCESSING row) with `tx_id`
/// unset; the claim is a guarded update and the whole send runs under the
/// process-wide send lock. A second invocation, even while the first chain
/// call is still in flight, is rejected rather than paid twice. A chain
/// failure fails the request and refunds the gross amount, so funds are
/// never left both debited and unsent.
pub(crate) async fn send_payout(
    ctx: &TreasuryContext,
    id: i64,
) -> Result<WithdrawalRequest, WithdrawalError> {
    let _guard = ctx.send_lock().lock().await;

    let request = db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)?;

    if request.tx_id.is_some() {
        return Err(WithdrawalError::AlreadySent);
    }
    if !matches!(
        request.status,
        WithdrawalStatus::Approved | WithdrawalStatus::Processing
    ) {
        return Err(WithdrawalError::WrongState(request.status));
    }

    if !db::claim_for_send(ctx.pool(), id).await? {
        // Someone got here between our read and the claim.
        return Err(WithdrawalError::AlreadySent);
    }

    let key = match ctx.keys().resolve_private_key(request.network) {
        Ok(key) => key,
        Err(e) => {
            // No chain interaction happened, but the admin still needs the
            // funds back to retry once configuration is fixed.
            db::fail_with_refund(ctx.pool(), &request, &e.to_string()).await?;
            return Err(WithdrawalError::SendFailed(e.to_string()));
        }
    };

    let client = ctx.chains().client(request.network);
    match client
        .send_token(&key, &request.to_address, request.amount_net)
        .await
    {
        Ok(tx_id) => {
            if !db::mark_sent(ctx.pool(), id, &tx_id).await? {
                // tx_id was set concurrently despite the claim; do not pay again.
                warn!(request_id = id, "Send raced a concurrent completion");
                return Err(WithdrawalError::AlreadySent);
            }
            info!(request_id = id, %tx_id, "Withdrawal sent");
            db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)
        }
        Err(e) => {
            let message = e.to_string();
            db::fail_with_refund(ctx.pool(), &request, &message).await?;
            warn!(request_id = id, error = %message, "Withdrawal send failed, refunded");
            Err(WithdrawalError::SendFailed(message))
        }
    }
}

/// FAILED -> APPROVED, re-debiting the gross amount under a fresh attempt.
pub(crate) async fn retry(
    ctx: &TreasuryContext,
    id: i64,
) -> Result<WithdrawalRequest, WithdrawalError> {
    let request = db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)?;

    if request.status != WithdrawalStatus::Failed {
        return Err(WithdrawalError::WrongState(request.status));
    }

    match db::retry_request(ctx.pool(), &request).await? {
        Some(rearmed) => {
            info!(request_id = id, attempt = rearmed.attempt, "Withdrawal re-approved for retry");
            Ok(rearmed)
        }
        None => Err(WithdrawalError::InsufficientFunds),
    }
}

/// Admin rejection: PENDING -> FAILED with a refund, before any chain
/// interaction.
pub(crate) async fn fail(
    ctx: &TreasuryContext,
    id: i64,
    reason: &str,
) -> Result<WithdrawalRequest, WithdrawalError> {
    let request = db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)?;

    if request.status != WithdrawalStatus::Pending {
        return Err(WithdrawalError::WrongState(request.status));
    }

    db::fail_with_refund(ctx.pool(), &request, reason).await?;
    info!(request_id = id, %reason, "Withdrawal rejected and refunded");
    db::get(ctx.pool(), id).await?.ok_or(WithdrawalError::NotFound)
}

/// Send every APPROVED request, sequentially, collecting per-request errors.
pub(crate) async fn send_approved(ctx: &TreasuryContext) -> (usize, Vec<String>) {
    let approved = match db::list_approved(ctx.pool()).await {
        Ok(rows) => rows,
        Err(e) => return (0, vec![format!("listing approved withdrawals: {e}")]),
    };

    let mut sent = 0;
    let mut errors = Vec::new();
    for request in &approved {
        match send_payout(ctx, request.id).await {
            Ok(_) => sent += 1,
            Err(e) => errors.push(format!("withdrawal {}: {e}", request.id)),
        }
    }

    (sent, errors)
}

/// Background task: flush approved withdrawals on an interval.
pub(crate) async fn withdrawal_sender_task(ctx: Arc<TreasuryContext>) {
    info!("Starting withdrawal sender task");
    let mut interval = interval(Duration::from_secs(ctx.config().withdrawal_send_interval()));

    loop {
        interval.tick().await;

        let (sent, errors) = send_approved(&ctx).await;
        if sent > 0 || !errors.is_empty() {
            info!(sent, errors = errors.len(), "Withdrawal sender pass finished");
        }
        for err in &errors {
            error!(error = %err, "Withdrawal send error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposits::pipeline::tests::test_context;
    use crate::ledger::models::TxType;
    use crate::ledger::store::{create_user, credit, get_user};

    async fn seed_funded_user(ctx: &TreasuryContext, user_id: &str, balance: f64) {
        create_user(ctx.pool(), user_id).await.unwrap();
        credit(ctx.pool(), user_id, "seed", TxType::Deposit, balance, "")
            .await
            .unwrap();
    }

    async fn send_failure_mock(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/v3/blockchain/token/transaction")
            .with_status(500)
            .with_body("insufficient energy")
            .create_async()
            .await
    }

    async fn send_success_mock(server: &mut mockito::Server, tx_id: &str) -> mockito::Mock {
        server
            .mock("POST", "/v3/blockchain/token/transaction")
            .with_body(format!(r#"{{"txId":"{tx_id}"}}"#))
            .create_async()
            .await
    }

    #[tokio::test]
    async fn full_withdrawal_scenario_with_failure_retry_and_send() {
        let mut server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 50.0).await;

        // $10 gross at a $0.50 fee reserves the gross amount immediately.
        let outcome = create(&ctx, "u1", Network::Polygon, "0xdest", 10.0)
            .await
            .unwrap();
        let request = match outcome {
            CreateOutcome::Ok { request, balance } => {
                assert_eq!(request.amount_gross, 10.0);
                assert_eq!(request.fee, 0.5);
                assert_eq!(request.amount_net, 9.5);
                assert_eq!(balance, 40.0);
                request
            }
            other => panic!("unexpected outcome: {other:?}"),
        };

        let approved = approve(&ctx, request.id).await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Approved);

        // Chain send blows up: the request fails and the gross comes back.
        let failure = send_failure_mock(&mut server).await;
        let err = send_payout(&ctx, request.id).await.unwrap_err();
        assert!(matches!(err, WithdrawalError::SendFailed(_)));
        failure.remove_async().await;

        let failed = db::get(ctx.pool(), request.id).await.unwrap().unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("500"));
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            50.0
        );

        // Retry re-debits and re-arms.
        let rearmed = retry(&ctx, request.id).await.unwrap();
        assert_eq!(rearmed.status, WithdrawalStatus::Approved);
        assert_eq!(rearmed.attempt, 1);
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            40.0
        );

        // Second attempt lands on chain.
        send_success_mock(&mut server, "abc").await;
        let sent = send_payout(&ctx, request.id).await.unwrap();
        assert_eq!(sent.status, WithdrawalStatus::Sent);
        assert_eq!(sent.tx_id.as_deref(), Some("abc"));
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            40.0
        );
    }

    #[tokio::test]
    async fn second_send_is_rejected_and_hits_the_chain_once() {
        let mut server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 50.0).await;

        let send = server
            .mock("POST", "/v3/blockchain/token/transaction")
            .with_body(r#"{"txId":"only-once"}"#)
            .expect(1)
            .create_async()
            .await;

        let request = match create(&ctx, "u1", Network::Polygon, "0xdest", 10.0)
            .await
            .unwrap()
        {
            CreateOutcome::Ok { request, .. } => request,
            other => panic!("unexpected outcome: {other:?}"),
        };
        approve(&ctx, request.id).await.unwrap();

        send_payout(&ctx, request.id).await.unwrap();
        let err = send_payout(&ctx, request.id).await.unwrap_err();

        assert!(matches!(err, WithdrawalError::AlreadySent));
        send.assert_async().await;

        // Exactly one debit survived: gross reserved once, never refunded.
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            40.0
        );
    }

    #[tokio::test]
    async fn create_validations() {
        let server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 5.0).await;

        let no_user = create(&ctx, "ghost", Network::Tron, "Tdest", 20.0)
            .await
            .unwrap();
        assert!(matches!(no_user, CreateOutcome::NoUser));

        let below = create(&ctx, "u1", Network::Tron, "Tdest", 2.0).await.unwrap();
        assert!(matches!(below, CreateOutcome::BelowMinimum { minimum } if minimum == 10.0));

        let no_funds = create(&ctx, "u1", Network::Tron, "Tdest", 20.0)
            .await
            .unwrap();
        assert!(matches!(no_funds, CreateOutcome::NoFunds));

        // Nothing was reserved along the way.
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            5.0
        );
    }

    #[tokio::test]
    async fn pending_rejection_refunds_the_gross_amount() {
        let server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 50.0).await;

        let request = match create(&ctx, "u1", Network::Tron, "Tdest", 10.0)
            .await
            .unwrap()
        {
            CreateOutcome::Ok { request, .. } => request,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            40.0
        );

        let failed = fail(&ctx, request.id, "suspicious destination").await.unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("suspicious destination"));
        assert_eq!(
            get_user(ctx.pool(), "u1").await.unwrap().unwrap().balance,
            50.0
        );

        // Reject is PENDING-only; a second fail is a state error.
        let err = fail(&ctx, request.id, "again").await.unwrap_err();
        assert!(matches!(err, WithdrawalError::WrongState(WithdrawalStatus::Failed)));
    }

    #[tokio::test]
    async fn approve_requires_pending() {
        let server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 50.0).await;

        let request = match create(&ctx, "u1", Network::Tron, "Tdest", 10.0)
            .await
            .unwrap()
        {
            CreateOutcome::Ok { request, .. } => request,
            other => panic!("unexpected outcome: {other:?}"),
        };

        approve(&ctx, request.id).await.unwrap();
        let err = approve(&ctx, request.id).await.unwrap_err();
        assert!(matches!(
            err,
            WithdrawalError::WrongState(WithdrawalStatus::Approved)
        ));
    }

    #[tokio::test]
    async fn send_approved_flushes_the_queue() {
        let mut server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_funded_user(&ctx, "u1", 100.0).await;
        send_success_mock(&mut server, "batch-tx").await;

        for _ in 0..2 {
            let request = match create(&ctx, "u1", Network::Polygon, "0xdest", 10.0)
                .await
                .unwrap()
            {
                CreateOutcome::Ok { request, .. } => request,
                other => panic!("unexpected outcome: {other:?}"),
            };
            approve(&ctx, request.id).await.unwrap();
        }

        let (sent, errors) = send_approved(&ctx).await;
        assert_eq!(sent, 2);
        assert!(errors.is_empty());
    }
}
