use std::collections::HashSet;
use tracing::info;

use crate::chains::TokenTransfer;
use crate::context::TreasuryContext;
use crate::deposits::detect;
use crate::deposits::models::CycleReport;
use crate::deposits::pipeline::{confirm_detected, credit_confirmed};
use crate::scanner::logs::LogScanner;
use crate::types::network::Network;
use crate::wallets::addresses::{find_by_address, for_network, WalletAddress};

/// Manual recovery: replay detect -> confirm -> credit for one known
/// transaction hash. Safe to re-run arbitrarily; every phase is idempotent.
pub(crate) async fn credit_deposit_by_tx_hash(
    ctx: &TreasuryContext,
    network: Network,
    tx_hash: &str,
) -> CycleReport {
    let _guard = ctx.cycle_lock(network).lock().await;
    info!(%network, %tx_hash, "Manual deposit recovery for transaction");

    let mut report = CycleReport::default();

    let (detected, mut errors) = match network {
        Network::Tron => recover_tron_tx(ctx, tx_hash).await,
        Network::Polygon => recover_polygon_tx(ctx, tx_hash).await,
        Network::Solana => recover_solana_tx(ctx, tx_hash).await,
    };
    report.detected = detected;
    report.errors.append(&mut errors);

    finish_phases(ctx, network, &mut report).await;
    report
}

/// Manual recovery: re-detect activity for a single address. For Polygon the
/// given block range is scanned (head-bounded when open-ended) without
/// touching the cursor; TRON and Solana replay the address's transfer
/// history, where block ranges do not apply.
pub(crate) async fn rescan_for_address(
    ctx: &TreasuryContext,
    network: Network,
    address: &str,
    from_block: u64,
    to_block: Option<u64>,
) -> CycleReport {
    let _guard = ctx.cycle_lock(network).lock().await;
    info!(%network, %address, from_block, ?to_block, "Manual rescan for address");

    let mut report = CycleReport::default();

    let wallet = match find_by_address(ctx.pool(), network, address).await {
        Ok(Some(wallet)) => wallet,
        Ok(None) => {
            report.errors.push(format!("no wallet with address {address}"));
            return report;
        }
        Err(e) => {
            report.errors.push(format!("looking up {address}: {e}"));
            return report;
        }
    };

    let (detected, mut errors) = match network {
        Network::Polygon => rescan_polygon_range(ctx, &wallet, from_block, to_block).await,
        Network::Tron => recover_tron_address(ctx, &wallet, None).await,
        Network::Solana => recover_solana_address(ctx, &wallet, None).await,
    };
    report.detected = detected;
    report.errors.append(&mut errors);

    finish_phases(ctx, network, &mut report).await;
    report
}

/// Re-running recovery for a transfer recorded earlier is success, not
/// "transaction not found".
async fn already_recorded(ctx: &TreasuryContext, network: Network, tx_hash: &str) -> bool {
    crate::deposits::db::tx_recorded(ctx.pool(), network, tx_hash)
        .await
        .unwrap_or(false)
}

async fn finish_phases(ctx: &TreasuryContext, network: Network, report: &mut CycleReport) {
    let (confirmed, mut confirm_errors) = confirm_detected(ctx, network).await;
    report.confirmed = confirmed;
    report.errors.append(&mut confirm_errors);

    let (credited, mut credit_errors) = credit_confirmed(ctx, network).await;
    report.credited = credited;
    report.errors.append(&mut credit_errors);
}

async fn recover_tron_tx(ctx: &TreasuryContext, tx_hash: &str) -> (usize, Vec<String>) {
    let wallets = match for_network(ctx.pool(), Network::Tron).await {
        Ok(wallets) => wallets,
        Err(e) => return (0, vec![format!("loading TRON addresses: {e}")]),
    };

    let mut created = 0;
    let mut errors = Vec::new();
    for wallet in &wallets {
        let (found, mut errs) = recover_tron_address(ctx, wallet, Some(tx_hash)).await;
        created += found;
        errors.append(&mut errs);
        if found > 0 {
            break;
        }
    }

    if created == 0 && errors.is_empty() && !already_recorded(ctx, Network::Tron, tx_hash).await {
        errors.push(format!("transaction {tx_hash} not found for any deposit address"));
    }

    (created, errors)
}

async fn recover_tron_address(
    ctx: &TreasuryContext,
    wallet: &WalletAddress,
    only_tx: Option<&str>,
) -> (usize, Vec<String>) {
    let transfers = match ctx.chains().tron().trc20_transfers_to(&wallet.address).await {
        Ok(transfers) => transfers,
        Err(e) => return (0, vec![format!("TRON history for {}: {e}", wallet.address)]),
    };

    let mut created = 0;
    let mut errors = Vec::new();
    for transfer in &transfers {
        if transfer.to_address != wallet.address {
            continue;
        }
        if only_tx.is_some_and(|tx| tx != transfer.tx_hash) {
            continue;
        }
        match detect::record_transfer(ctx, Network::Tron, wallet, transfer).await {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => errors.push(format!("recording TRON tx {}: {e}", transfer.tx_hash)),
        }
    }

    (created, errors)
}

async fn recover_polygon_tx(ctx: &TreasuryContext, tx_hash: &str) -> (usize, Vec<String>) {
    let logs = match ctx.chains().polygon().receipt_logs(tx_hash).await {
        Ok(logs) => logs,
        Err(e) => return (0, vec![format!("receipt for {tx_hash}: {e}")]),
    };

    let mut created = 0;
    let mut errors = Vec::new();
    for entry in &logs {
        let decoded = match crate::chains::polygon::decode_transfer(entry) {
            Ok(decoded) => decoded,
            Err(_) => continue, // non-Transfer logs in the receipt
        };

        let to_address = decoded.to_address();
        let wallet = match find_by_address(ctx.pool(), Network::Polygon, &to_address).await {
            Ok(Some(wallet)) => wallet,
            Ok(None) => continue,
            Err(e) => {
                errors.push(format!("looking up {to_address}: {e}"));
                continue;
            }
        };

        let observed = TokenTransfer {
            tx_hash: format!("{:#x}", decoded.tx_hash),
            to_address,
            raw_amount: decoded.value.to_string(),
        };
        match detect::record_transfer(ctx, Network::Polygon, &wallet, &observed).await {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => errors.push(format!("recording Polygon tx {}: {e}", observed.tx_hash)),
        }
    }

    if created == 0 && errors.is_empty() && !already_recorded(ctx, Network::Polygon, tx_hash).await
    {
        errors.push(format!("transaction {tx_hash} carries no transfer to a deposit address"));
    }

    (created, errors)
}

async fn rescan_polygon_range(
    ctx: &TreasuryContext,
    wallet: &WalletAddress,
    from_block: u64,
    to_block: Option<u64>,
) -> (usize, Vec<String>) {
    let client = ctx.chains().polygon();
    let settings = ctx.config().network(Network::Polygon);
    let mut errors = Vec::new();

    let to_block = match to_block {
        Some(block) => block,
        None => match client.head_block().await {
            Ok(head) => head,
            Err(e) => return (0, vec![format!("polygon head: {e}")]),
        },
    };
    if to_block < from_block {
        return (0, vec![format!("empty range {from_block}..{to_block}")]);
    }

    let addresses: HashSet<String> = [wallet.address.to_lowercase()].into();
    let scanner = LogScanner::new(client, settings.scan_chunk());
    let outcome = scanner.scan(from_block, to_block, &addresses).await;

    let mut created = 0;
    for chunk in &outcome.chunks {
        for transfer in &chunk.transfers {
            let observed = TokenTransfer {
                tx_hash: format!("{:#x}", transfer.tx_hash),
                to_address: transfer.to_address(),
                raw_amount: transfer.value.to_string(),
            };
            match detect::record_transfer(ctx, Network::Polygon, wallet, &observed).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => errors.push(format!("recording Polygon tx {}: {e}", observed.tx_hash)),
            }
        }
    }

    if let Some(scan_error) = outcome.error {
        errors.push(format!("polygon rescan: {scan_error}"));
    }

    (created, errors)
}

async fn recover_solana_tx(ctx: &TreasuryContext, tx_hash: &str) -> (usize, Vec<String>) {
    let client = ctx.chains().solana();
    let tx = match client.transaction(tx_hash).await {
        Ok(Some(tx)) => tx,
        Ok(None) => return (0, vec![format!("transaction {tx_hash} not found")]),
        Err(e) => return (0, vec![format!("fetching Solana tx {tx_hash}: {e}")]),
    };

    let mut created = 0;
    let mut errors = Vec::new();
    for transfer in client.spl_transfers(tx_hash, &tx) {
        let wallet = match find_by_address(ctx.pool(), Network::Solana, &transfer.to_address).await
        {
            Ok(Some(wallet)) => wallet,
            Ok(None) => continue,
            Err(e) => {
                errors.push(format!("looking up {}: {e}", transfer.to_address));
                continue;
            }
        };

        match detect::record_transfer(ctx, Network::Solana, &wallet, &transfer).await {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => errors.push(format!("recording Solana tx {tx_hash}: {e}")),
        }
    }

    if created == 0 && errors.is_empty() && !already_recorded(ctx, Network::Solana, tx_hash).await {
        errors.push(format!("transaction {tx_hash} carries no transfer to a deposit address"));
    }

    (created, errors)
}

async fn recover_solana_address(
    ctx: &TreasuryContext,
    wallet: &WalletAddress,
    only_tx: Option<&str>,
) -> (usize, Vec<String>) {
    let client = ctx.chains().solana();
    let signatures = match client.signatures_for_address(&wallet.address).await {
        Ok(signatures) => signatures,
        Err(e) => return (0, vec![format!("Solana signatures for {}: {e}", wallet.address)]),
    };

    let mut created = 0;
    let mut errors = Vec::new();
    for signature in &signatures {
        if only_tx.is_some_and(|tx| tx != signature) {
            continue;
        }

        let tx = match client.transaction(signature).await {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(e) => {
                errors.push(format!("fetching Solana tx {signature}: {e}"));
                continue;
            }
        };

        for transfer in client.spl_transfers(signature, &tx) {
            if transfer.to_address != wallet.address {
                continue;
            }
            match detect::record_transfer(ctx, Network::Solana, wallet, &transfer).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => errors.push(format!("recording Solana tx {signature}: {e}")),
            }
        }
    }

    (created, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposits::models::DepositStatus;
    use crate::deposits::pipeline::tests::{seed_wallet, test_context};
    use crate::ledger::store::get_user;

    #[tokio::test]
    async fn recovers_a_polygon_deposit_from_its_receipt() {
        let mut server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        let user_address = "0x2222222222222222222222222222222222222222";
        seed_wallet(&ctx, "u1", Network::Polygon, user_address).await;

        let log = crate::chains::polygon::tests::transfer_log_json(
            user_address,
            5_000_000,
            42,
            "0x00000000000000000000000000000000000000000000000000000000000000cc",
        );
        server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"method": "eth_getTransactionReceipt"}),
            ))
            .with_body(
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"logs": [log]}})
                    .to_string(),
            )
            .create_async()
            .await;

        let tx = "0x00000000000000000000000000000000000000000000000000000000000000cc";
        let report = credit_deposit_by_tx_hash(&ctx, Network::Polygon, tx).await;
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        assert_eq!(report.detected, 1);
        assert_eq!(report.credited, 1);

        let user = get_user(ctx.pool(), "u1").await.unwrap().unwrap();
        assert_eq!(user.balance, 5.0);

        // Replaying the recovery must not double-credit.
        let replay = credit_deposit_by_tx_hash(&ctx, Network::Polygon, tx).await;
        assert_eq!(replay.detected, 0);
        let user = get_user(ctx.pool(), "u1").await.unwrap().unwrap();
        assert_eq!(user.balance, 5.0);
    }

    #[tokio::test]
    async fn rescan_records_only_the_requested_address() {
        let mut server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;
        seed_wallet(&ctx, "u1", Network::Tron, "Taddr").await;

        server
            .mock(
                "GET",
                mockito::Matcher::Regex("/v1/accounts/Taddr/transactions/trc20.*".to_string()),
            )
            .with_body(
                r#"{"data":[{"transaction_id":"oldtx","to":"Taddr","value":"3000000"}]}"#,
            )
            .create_async()
            .await;

        let report = rescan_for_address(&ctx, Network::Tron, "Taddr", 0, None).await;
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        assert_eq!(report.detected, 1);

        let deposit = crate::deposits::db::find_by_key(ctx.pool(), Network::Tron, "oldtx", "Taddr")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Credited);
    }

    #[tokio::test]
    async fn unknown_address_rescan_reports_the_problem() {
        let server = mockito::Server::new_async().await;
        let ctx = test_context(&server.url()).await;

        let report = rescan_for_address(&ctx, Network::Tron, "TUnknown", 0, None).await;
        assert_eq!(report.detected, 0);
        assert!(report.errors[0].contains("no wallet"));
    }
}
