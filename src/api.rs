use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::context::TreasuryContext;
use crate::deposits::models::CycleReport;
use crate::deposits::pipeline::run_cycle;
use crate::deposits::recover::{credit_deposit_by_tx_hash, rescan_for_address};
use crate::ledger::models::LedgerEntry;
use crate::ledger::store::entries_for_user;
use crate::types::network::Network;
use crate::wallets::addresses::{deposit_address_for, AddressError, WalletAddress};
use crate::withdrawals::models::{CreateOutcome, WithdrawalError, WithdrawalRequest};
use crate::withdrawals::pipeline as withdrawals;

type ApiError = (StatusCode, Json<Value>);

/// Build the service router. Every operation the market engine or the admin
/// UI needs goes through here; the scheduler drives the same pipeline
/// functions directly.
pub(crate) fn router(ctx: Arc<TreasuryContext>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/balances", get(master_balances))
        .route(
            "/api/users/:user_id/deposit-address/:network",
            post(issue_deposit_address),
        )
        .route("/api/users/:user_id/transactions", get(list_transactions))
        .route("/api/deposits/cycle/:network", post(trigger_deposit_cycle))
        .route("/api/deposits/credit-tx", post(credit_by_tx_hash))
        .route("/api/deposits/rescan", post(rescan_address))
        .route("/api/withdrawals", post(create_withdrawal))
        .route("/api/withdrawals/send-approved", post(send_all_approved))
        .route("/api/withdrawals/:id/approve", post(approve_withdrawal))
        .route("/api/withdrawals/:id/send", post(send_withdrawal))
        .route("/api/withdrawals/:id/retry", post(retry_withdrawal))
        .route("/api/withdrawals/:id/fail", post(fail_withdrawal))
        .with_state(ctx)
}

fn error_body(message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "error": message.to_string() }))
}

fn parse_network(raw: &str) -> Result<Network, ApiError> {
    Network::from_str(raw).map_err(|e| (StatusCode::BAD_REQUEST, error_body(e)))
}

fn map_withdrawal_error(err: WithdrawalError) -> ApiError {
    let status = match &err {
        WithdrawalError::NotFound => StatusCode::NOT_FOUND,
        WithdrawalError::WrongState(_)
        | WithdrawalError::AlreadySent
        | WithdrawalError::InsufficientFunds => StatusCode::CONFLICT,
        WithdrawalError::SendFailed(_) => StatusCode::BAD_GATEWAY,
        WithdrawalError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body(err))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Master custody balances per network, for the admin dashboard. Balance
/// lookups read as zero on provider failure, so this never errors on a
/// flaky upstream.
async fn master_balances(State(ctx): State<Arc<TreasuryContext>>) -> Json<Value> {
    let mut networks = Vec::new();

    for network in Network::ALL {
        let client = ctx.chains().client(network);
        match ctx.keys().resolve_master_address(network, client).await {
            Ok(address) => {
                let token_balance = client.token_balance(&address).await;
                let native_balance = client.native_balance(&address).await;
                networks.push(json!({
                    "network": network,
                    "address": address,
                    "token_balance": token_balance,
                    "native_balance": native_balance,
                }));
            }
            Err(e) => networks.push(json!({ "network": network, "error": e.to_string() })),
        }
    }

    Json(json!({ "networks": networks }))
}

async fn issue_deposit_address(
    State(ctx): State<Arc<TreasuryContext>>,
    Path((user_id, network)): Path<(String, String)>,
) -> Result<Json<WalletAddress>, ApiError> {
    let network = parse_network(&network)?;
    let client = ctx.chains().client(network);

    match deposit_address_for(ctx.pool(), client, &user_id, network).await {
        Ok(address) => Ok(Json(address)),
        Err(AddressError::NoUser) => Err((StatusCode::NOT_FOUND, error_body("unknown user"))),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, error_body(e))),
    }
}

async fn list_transactions(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    entries_for_user(ctx.pool(), &user_id, 100)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, error_body(e)))
}

async fn trigger_deposit_cycle(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(network): Path<String>,
) -> Result<Json<CycleReport>, ApiError> {
    let network = parse_network(&network)?;
    Ok(Json(run_cycle(&ctx, network).await))
}

#[derive(Deserialize)]
struct CreditTxBody {
    network: String,
    tx_hash: String,
}

async fn credit_by_tx_hash(
    State(ctx): State<Arc<TreasuryContext>>,
    Json(body): Json<CreditTxBody>,
) -> Result<Json<CycleReport>, ApiError> {
    let network = parse_network(&body.network)?;
    Ok(Json(
        credit_deposit_by_tx_hash(&ctx, network, &body.tx_hash).await,
    ))
}

#[derive(Deserialize)]
struct RescanBody {
    network: String,
    address: String,
    from_block: u64,
    to_block: Option<u64>,
}

async fn rescan_address(
    State(ctx): State<Arc<TreasuryContext>>,
    Json(body): Json<RescanBody>,
) -> Result<Json<CycleReport>, ApiError> {
    let network = parse_network(&body.network)?;
    Ok(Json(
        rescan_for_address(&ctx, network, &body.address, body.from_block, body.to_block).await,
    ))
}

#[derive(Deserialize)]
struct CreateWithdrawalBody {
    user_id: String,
    network: String,
    to_address: String,
    amount: f64,
}

async fn create_withdrawal(
    State(ctx): State<Arc<TreasuryContext>>,
    Json(body): Json<CreateWithdrawalBody>,
) -> Result<Json<CreateOutcome>, ApiError> {
    let network = parse_network(&body.network)?;

    withdrawals::create(&ctx, &body.user_id, network, &body.to_address, body.amount)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, error_body(e)))
}

async fn approve_withdrawal(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    withdrawals::approve(&ctx, id).await.map(Json).map_err(map_withdrawal_error)
}

async fn send_withdrawal(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    withdrawals::send_payout(&ctx, id).await.map(Json).map_err(map_withdrawal_error)
}

async fn retry_withdrawal(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(id): Path<i64>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    withdrawals::retry(&ctx, id).await.map(Json).map_err(map_withdrawal_error)
}

#[derive(Deserialize)]
struct FailBody {
    reason: String,
}

async fn fail_withdrawal(
    State(ctx): State<Arc<TreasuryContext>>,
    Path(id): Path<i64>,
    Json(body): Json<FailBody>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    withdrawals::fail(&ctx, id, &body.reason)
        .await
        .map(Json)
        .map_err(map_withdrawal_error)
}

async fn send_all_approved(State(ctx): State<Arc<TreasuryContext>>) -> Json<Value> {
    let (sent, errors) = withdrawals::send_approved(&ctx).await;
    Json(json!({ "sent": sent, "errors": errors }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposits::pipeline::tests::test_context;
    use crate::ledger::store::create_user;

    #[tokio::test]
    async fn unknown_network_is_a_bad_request() {
        let server = mockito::Server::new_async().await;
        let ctx = Arc::new(test_context(&server.url()).await);

        let result = trigger_deposit_cycle(State(ctx), Path("DOGE".to_string())).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn withdrawal_errors_map_to_conflict_codes() {
        let server = mockito::Server::new_async().await;
        let ctx = Arc::new(test_context(&server.url()).await);
        create_user(ctx.pool(), "u1").await.unwrap();

        let result = send_withdrawal(State(Arc::clone(&ctx)), Path(999)).await;
        let (status, _) = result.err().unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
