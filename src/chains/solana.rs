use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::chains::error::ChainError;
use crate::chains::tatum::TatumApi;
use crate::chains::{ChainClient, TokenTransfer};
use crate::config::NetworkSettings;
use crate::types::network::Network;
use crate::utils::retry_policy::ExponentialBackoff;

/// Lamports per SOL
const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// How many signatures one detection pass requests per address
const SIGNATURE_PAGE_LIMIT: u64 = 50;

/// Whether an error is the public RPC's rate limit (HTTP 429).
///
/// Matched by substring as well as status code: gateways in front of the
/// public endpoint phrase the condition differently.
pub(crate) fn is_rate_limited(err: &ChainError) -> bool {
    match err {
        ChainError::Provider { status, .. } if *status == 429 => true,
        other => {
            let text = other.to_string();
            text.contains("429") || text.contains("Too Many Requests")
        }
    }
}

/// Solana client: Tatum REST for wallet derivation and sends, the public
/// JSON-RPC endpoint for signature and transaction queries.
///
/// Every RPC call backs off exponentially on HTTP 429; the public endpoint
/// rate-limits aggressively.
pub(crate) struct SolanaClient {
    tatum: TatumApi,
    http: reqwest::Client,
    backoff: ExponentialBackoff,
    settings: NetworkSettings,
}

impl SolanaClient {
    pub(crate) fn new(settings: &NetworkSettings) -> Self {
        Self::with_backoff(settings, ExponentialBackoff::new(3, 10, 1.5))
    }

    pub(crate) fn with_backoff(settings: &NetworkSettings, backoff: ExponentialBackoff) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            tatum: TatumApi::new(settings.tatum_url(), settings.tatum_api_key()),
            http,
            backoff,
            settings: settings.clone(),
        }
    }

    async fn rpc_call_once(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self.http.post(self.settings.rpc_url()).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(ChainError::Provider {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: Value = serde_json::from_str(&text)?;
        if let Some(rpc_err) = parsed.get("error") {
            let message = rpc_err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error");
            return Err(ChainError::Rpc(message.to_string()));
        }

        Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let mut attempt = 0;
        loop {
            match self.rpc_call_once(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if is_rate_limited(&e) && attempt < self.backoff.max_retries() => {
                    attempt += 1;
                    let delay = self.backoff.get_delay(attempt);
                    warn!(method, attempt, delay_secs = delay, "Solana RPC rate limited, backing off");
                    sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Recent transaction signatures touching `address`, newest first,
    /// failed transactions excluded.
    pub(crate) async fn signatures_for_address(
        &self,
        address: &str,
    ) -> Result<Vec<String>, ChainError> {
        let result = self
            .rpc_call(
                "getSignaturesForAddress",
                json!([address, {"limit": SIGNATURE_PAGE_LIMIT}]),
            )
            .await?;

        let entries = result
            .as_array()
            .ok_or_else(|| ChainError::BadResponse("expected signature array".to_string()))?;

        Ok(entries
            .iter()
            .filter(|entry| entry.get("err").map(Value::is_null).unwrap_or(true))
            .filter_map(|entry| entry.get("signature").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Fetch one transaction in `jsonParsed` encoding; `None` when the node
    /// no longer has it.
    pub(crate) async fn transaction(&self, signature: &str) -> Result<Option<Value>, ChainError> {
        let result = self
            .rpc_call(
                "getTransaction",
                json!([signature, {"encoding": "jsonParsed", "maxSupportedTransactionVersion": 0}]),
            )
            .await?;

        Ok(match result {
            Value::Null => None,
            other => Some(other),
        })
    }

    /// Extract SPL transfers of the configured mint from a `jsonParsed`
    /// transaction. The destination is the deposit token account; plain
    /// `transfer` instructions carry no mint, so only `transferChecked`
    /// entries are filtered by it.
    pub(crate) fn spl_transfers(&self, signature: &str, tx: &Value) -> Vec<TokenTransfer> {
        let instructions = tx
            .pointer("/transaction/message/instructions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut transfers = Vec::new();
        for instruction in &instructions {
            if instruction.get("program").and_then(Value::as_str) != Some("spl-token") {
                continue;
            }

            let Some(parsed) = instruction.get("parsed") else {
                continue;
            };
            let kind = parsed.get("type").and_then(Value::as_str).unwrap_or("");
            if kind != "transfer" && kind != "transferChecked" {
                continue;
            }

            let Some(info) = parsed.get("info") else {
                continue;
            };

            if let Some(mint) = info.get("mint").and_then(Value::as_str) {
                if mint != self.settings.token_contract() {
                    continue;
                }
            }

            let Some(destination) = info.get("destination").and_then(Value::as_str) else {
                continue;
            };

            // transferChecked nests the amount under tokenAmount
            let raw_amount = info
                .get("amount")
                .and_then(Value::as_str)
                .or_else(|| {
                    info.pointer("/tokenAmount/amount").and_then(Value::as_str)
                })
                .unwrap_or("0");

            transfers.push(TokenTransfer {
                tx_hash: signature.to_string(),
                to_address: destination.to_string(),
                raw_amount: raw_amount.to_string(),
            });
        }

        transfers
    }
}

#[async_trait]
impl ChainClient for SolanaClient {
    fn network(&self) -> Network {
        Network::Solana
    }

    async fn derive_address(&self, index: u32) -> Result<String, ChainError> {
        if self.settings.xpub().is_empty() {
            return Err(ChainError::MissingConfig("SOLANA_XPUB".to_string()));
        }

        let resp = self
            .tatum
            .get(&format!(
                "/v3/solana/address/{}/{}",
                self.settings.xpub(),
                index
            ))
            .await?;

        resp.get("address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("missing address".to_string()))
    }

    async fn token_balance(&self, address: &str) -> f64 {
        let result = self
            .rpc_call("getTokenAccountBalance", json!([address]))
            .await;

        match result {
            Ok(value) => value
                .pointer("/value/uiAmount")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            Err(e) => {
                warn!(%address, error = %e, "SPL balance lookup failed, treating as zero");
                0.0
            }
        }
    }

    async fn native_balance(&self, address: &str) -> f64 {
        let result = self.rpc_call("getBalance", json!([address])).await;

        match result {
            Ok(value) => value
                .pointer("/value")
                .and_then(Value::as_u64)
                .map(|lamports| lamports as f64 / LAMPORTS_PER_SOL)
                .unwrap_or(0.0),
            Err(e) => {
                warn!(%address, error = %e, "SOL balance lookup failed, treating as zero");
                0.0
            }
        }
    }

    async fn send_token(
        &self,
        from_key: &str,
        to: &str,
        amount: f64,
    ) -> Result<String, ChainError> {
        let resp = self
            .tatum
            .post(
                "/v3/solana/spl/transaction",
                json!({
                    "fromPrivateKey": from_key,
                    "to": to,
                    "amount": amount.to_string(),
                    "contractAddress": self.settings.token_contract(),
                    "digits": self.settings.token_decimals(),
                }),
            )
            .await?;

        TatumApi::tx_id(&resp)
    }

    async fn send_native(
        &self,
        from_key: &str,
        to: &str,
        amount: f64,
    ) -> Result<String, ChainError> {
        let resp = self
            .tatum
            .post(
                "/v3/solana/transaction",
                json!({
                    "fromPrivateKey": from_key,
                    "to": to,
                    "amount": amount.to_string(),
                }),
            )
            .await?;

        TatumApi::tx_id(&resp)
    }
}
