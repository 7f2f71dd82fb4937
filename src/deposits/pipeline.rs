use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::context::TreasuryContext;
use crate::deposits::db::{list_by_status, mark_confirmed, mark_credited, mark_failed_below_minimum};
use crate::deposits::detect::detect;
use crate::deposits::models::{CycleReport, Deposit, DepositStatus};
use crate::ledger::models::{LedgerOutcome, TxType};
use crate::ledger::store::credit;
use crate::types::network::Network;
use crate::utils::amounts::raw_to_human;

/// Stablecoin deposits are valued 1:1, no oracle lookup.
const STABLECOIN_PRICE_USD: f64 = 1.0;

/// Deterministic ledger key for crediting one on-chain transfer.
pub(crate) fn deposit_external_id(deposit: &Deposit) -> String {
    format!(
        "deposit:{}:{}:{}",
        deposit.network, deposit.tx_hash, deposit.deposit_address
    )
}

/// Run one full detect -> confirm -> credit cycle for a network.
///
/// Safe under concurrent re-entry: overlapping invocations for the same
/// network serialize on the cycle lock, and every phase is idempotent, so a
/// manual trigger racing the scheduled one cannot double-credit.
pub(crate) async fn run_cycle(ctx: &TreasuryContext, network: Network) -> CycleReport {
    let _guard = ctx.cycle_lock(network).lock().await;

    let mut report = CycleReport::default();

    let (detected, mut detect_errors) = detect(ctx, network).await;
    report.detected = detected;
    report.errors.append(&mut detect_errors);

    let (confirmed, mut confirm_errors) = confirm_detected(ctx, network).await;
    report.confirmed = confirmed;
    report.errors.append(&mut confirm_errors);

    let (credited, mut credit_errors) = credit_confirmed(ctx, network).await;
    report.credited = credited;
    report.errors.append(&mut credit_errors);

    info!(
        %network,
        detected = report.detected,
        confirmed = report.confirmed,
        credited = report.credited,
        errors = report.errors.len(),
        "Deposit cycle finished"
    );

    report
}

/// Confirm phase: apply the network's USD minimum to every DETECTED deposit.
pub(crate) async fn confirm_detected(
    ctx: &TreasuryContext,
    network: Network,
) -> (usize, Vec<String>) {
    let settings = ctx.config().network(network);
    let mut confirmed = 0;
    let mut errors = Vec::new();

    let detected = match list_by_status(ctx.pool(), network, DepositStatus::Detected).await {
        Ok(rows) => rows,
        Err(e) => return (0, vec![format!("listing detected deposits: {e}")]),
    };

    for deposit in &detected {
        let human = raw_to_human(&deposit.raw_amount, settings.token_decimals());
        let amount_usd = human * STABLECOIN_PRICE_USD;

        let result = if amount_usd < settings.deposit_min_usd() {
            info!(
                deposit_id = deposit.id,
                %network,
                amount_usd,
                minimum = settings.deposit_min_usd(),
                "Deposit below minimum, failing"
            );
            mark_failed_below_minimum(ctx.pool(), deposit.id).await
        } else {
            mark_confirmed(ctx.pool(), deposit.id, amount_usd, STABLECOIN_PRICE_USD)
                .await
                .map(|_| confirmed += 1)
        };

        if let Err(e) = result {
            errors.push(format!("confirming deposit {}: {e}", deposit.id));
        }
    }

    (confirmed, errors)
}

/// Credit phase: one atomic ledger mutation per CONFIRMED deposit.
///
/// An `AlreadyRecorded` ledger outcome means a concurrent cycle credited the
/// row between our list and our credit; the deposit is marked CREDITED
/// without touching the balance again. This is the core double-credit
/// defense.
pub(crate) async fn credit_confirmed(
    ctx: &TreasuryContext,
    network: Network,
) -> (usize, Vec<String>) {
    let mut credited = 0;
    let mut errors = Vec::new();

    let confirmed = match list_by_status(ctx.pool(), network, DepositStatus::Confirmed).await {
        Ok(rows) => rows,
        Err(e) => return (0, vec![format!("listing confirmed deposits: {e}")]),
    };

    for deposit in &confirmed {
        let Some(amount_usd) = deposit.amount_usd else {
            errors.push(format!("deposit {} confirmed without amount", deposit.id));
            continue;
        };

        let external_id = deposit_external_id(deposit);
        let description = format!("Deposit on {}", network);

        match credit(
            ctx.pool(),
            &deposit.user_id,
            &external_id,
            TxType::Deposit,
            amount_usd,
            &description,
        )
        .await
        {
            Ok(LedgerOutcome::Applied { balance }) => {
                if let Err(e) = mark_credited(ctx.pool(), deposit.id).await {
                    errors.push(format!("marking deposit {} credited: {e}", deposit.id));
                    continue;
                }
                info!(deposit_id = deposit.id, %network, amount_usd, balance, "Deposit credited");
                credited += 1;
            }
            Ok(LedgerOutcome::AlreadyRecorded) => {
                // Credited by someone else already; converge the row.
                if let Err(e) = mark_credited(ctx.pool(), deposit.id).await {
                    errors.push(format!("marking deposit {} credited: {e}", deposit.id));
                    continue;
                }
                credited += 1;
            }
            Ok(LedgerOutcome::InsufficientFunds) => {
                // Credits cannot underflow; unreachable by construction.
                errors.push(format!("deposit {} credit refused", deposit.id));
            }
            Err(e) => errors.push(format!("crediting deposit {}: {e}", deposit.id)),
        }
    }

    (credited, errors)
}

/// Background task: run the deposit cycle for one network on an interval.
pub(crate) async fn deposit_cycle_task(ctx: Arc<TreasuryContext>, network: Network) {
    info!(%network, "Starting deposit cycle task");
    let mut interval = interval(Duration::from_secs(ctx.config().deposit_cycle_interval()));

    loop {
        interval.tick().await;

        let report = run_cycle(&ctx, network).await;
        for err in &report.errors {
            error!(%network, error = %err, "Deposit cycle error");
        }
    }
}
