use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::chains::TokenTransfer;
use crate::context::TreasuryContext;
use crate::deposits::db::{key_exists, record_detected};
use crate::deposits::models::InsertOutcome;
use crate::scanner::cursor;
use crate::scanner::logs::LogScanner;
use crate::types::network::Network;
use crate::utils::amounts::raw_to_human;
use crate::utils::rpc_client::execute_with_retries;
use crate::wallets::addresses::{for_network, WalletAddress};

/// Run the detection phase for one network.
///
/// Returns the number of newly recorded deposits and the errors hit along
/// the way; a failing address or transaction is reported and skipped, never
/// fatal to the rest of the pass.
pub(crate) async fn detect(ctx: &TreasuryContext, network: Network) -> (usize, Vec<String>) {
    match network {
        Network::Tron => detect_tron(ctx).await,
        Network::Polygon => detect_polygon(ctx).await,
        Network::Solana => detect_solana(ctx).await,
    }
}

/// Record one observed transfer against the wallet that owns the address.
/// Zero or unparseable amounts are ignored.
pub(crate) async fn record_transfer(
    ctx: &TreasuryContext,
    network: Network,
    wallet: &WalletAddress,
    transfer: &TokenTransfer,
) -> Result<bool, sqlx::Error> {
    let decimals = ctx.config().network(network).token_decimals();
    if raw_to_human(&transfer.raw_amount, decimals) <= 0.0 {
        return Ok(false);
    }

    let outcome = record_detected(
        ctx.pool(),
        &wallet.user_id,
        network,
        &transfer.tx_hash,
        &wallet.address,
        wallet.id,
        &transfer.raw_amount,
    )
    .await?;

    Ok(outcome == InsertOutcome::Created)
}

/// TRON: per-address TRC-20 transfer history from Trongrid.
async fn detect_tron(ctx: &TreasuryContext) -> (usize, Vec<String>) {
    let mut created = 0;
    let mut errors = Vec::new();

    let wallets = match for_network(ctx.pool(), Network::Tron).await {
        Ok(wallets) => wallets,
        Err(e) => return (0, vec![format!("loading TRON addresses: {e}")]),
    };

    for wallet in &wallets {
        let transfers = match ctx.chains().tron().trc20_transfers_to(&wallet.address).await {
            Ok(transfers) => transfers,
            Err(e) => {
                errors.push(format!("TRON history for {}: {e}", wallet.address));
                continue;
            }
        };

        for transfer in &transfers {
            if transfer.to_address != wallet.address {
                continue;
            }
            match record_transfer(ctx, Network::Tron, wallet, transfer).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => errors.push(format!("recording TRON tx {}: {e}", transfer.tx_hash)),
            }
        }
    }

    (created, errors)
}

/// Polygon: cursor-driven Transfer-log scan between the last processed
/// block and head. The cursor advances per fully handled chunk and never
/// past a failure.
async fn detect_polygon(ctx: &TreasuryContext) -> (usize, Vec<String>) {
    let settings = ctx.config().network(Network::Polygon);
    let client = ctx.chains().polygon();
    let mut created = 0;
    let mut errors = Vec::new();

    let head = match execute_with_retries(|| client.head_block(), "eth_blockNumber").await {
        Ok(head) => head,
        Err(e) => return (0, vec![format!("polygon head: {e}")]),
    };

    let last_processed = match cursor::get(ctx.pool(), Network::Polygon).await {
        Ok(Some(block)) => block,
        Ok(None) => {
            match cursor::init(ctx.pool(), Network::Polygon, head, settings.initial_blocks_back())
                .await
            {
                Ok(block) => block,
                Err(e) => return (0, vec![format!("initializing polygon cursor: {e}")]),
            }
        }
        Err(e) => return (0, vec![format!("reading polygon cursor: {e}")]),
    };

    if last_processed >= head {
        debug!(last_processed, head, "No new Polygon blocks");
        return (0, errors);
    }

    let wallets = match for_network(ctx.pool(), Network::Polygon).await {
        Ok(wallets) => wallets,
        Err(e) => return (0, vec![format!("loading Polygon addresses: {e}")]),
    };
    let by_address: HashMap<String, &WalletAddress> = wallets
        .iter()
        .map(|w| (w.address.to_lowercase(), w))
        .collect();
    let address_set: HashSet<String> = by_address.keys().cloned().collect();

    let scanner = LogScanner::new(client, settings.scan_chunk());
    let outcome = scanner.scan(last_processed + 1, head, &address_set).await;

    'chunks: for chunk in &outcome.chunks {
        for transfer in &chunk.transfers {
            let to_address = transfer.to_address();
            let Some(wallet) = by_address.get(&to_address) else {
                continue;
            };

            let observed = TokenTransfer {
                tx_hash: format!("{:#x}", transfer.tx_hash),
                to_address,
                raw_amount: transfer.value.to_string(),
            };

            match record_transfer(ctx, Network::Polygon, wallet, &observed).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    // Leave the cursor short of this chunk; the range is
                    // rescanned next cycle and the insert is idempotent.
                    errors.push(format!("recording Polygon tx {}: {e}", observed.tx_hash));
                    break 'chunks;
                }
            }
        }

        if let Err(e) = cursor::advance(ctx.pool(), Network::Polygon, chunk.to_block).await {
            errors.push(format!("advancing polygon cursor: {e}"));
            break;
        }
    }

    if let Some(scan_error) = outcome.error {
        errors.push(format!("polygon scan: {scan_error}"));
    }

    (created, errors)
}

/// Solana: recent signatures per address, each new one fetched in
/// `jsonParsed` form and searched for SPL transfers to the address.
async fn detect_solana(ctx: &TreasuryContext) -> (usize, Vec<String>) {
    let client = ctx.chains().solana();
    let mut created = 0;
    let mut errors = Vec::new();

    let wallets = match for_network(ctx.pool(), Network::Solana).await {
        Ok(wallets) => wallets,
        Err(e) => return (0, vec![format!("loading Solana addresses: {e}")]),
    };

    for wallet in &wallets {
        let signatures = match client.signatures_for_address(&wallet.address).await {
            Ok(signatures) => signatures,
            Err(e) => {
                errors.push(format!("Solana signatures for {}: {e}", wallet.address));
                continue;
            }
        };

        for signature in &signatures {
            let seen = match key_exists(ctx.pool(), Network::Solana, signature, &wallet.address)
                .await
            {
                Ok(seen) => seen,
                Err(e) => {
                    errors.push(format!("checking Solana sig {signature}: {e}"));
                    continue;
                }
            };
            if seen {
                continue;
            }

            let tx = match client.transaction(signature).await {
                Ok(Some(tx)) => tx,
                Ok(None) => {
                    warn!(%signature, "Solana transaction not available yet");
                    continue;
                }
                Err(e) => {
                    errors.push(format!("fetching Solana tx {signature}: {e}"));
                    continue;
                }
            };

            for transfer in client.spl_transfers(signature, &tx) {
                if transfer.to_address != wallet.address {
                    continue;
                }
                match record_transfer(ctx, Network::Solana, wallet, &transfer).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => errors.push(format!("recording Solana tx {signature}: {e}")),
                }
            }
        }
    }

    (created, errors)
}
