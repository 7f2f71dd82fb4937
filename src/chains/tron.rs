use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::chains::error::ChainError;
use crate::chains::tatum::TatumApi;
use crate::chains::{ChainClient, TokenTransfer};
use crate::config::NetworkSettings;
use crate::types::network::Network;
use crate::utils::amounts::raw_to_human;

/// Fee limit in TRX for TRC-20 transfers submitted through Tatum.
const TRC20_FEE_LIMIT: u64 = 100;

/// TRON client: Tatum REST for wallet derivation and sends, Trongrid REST
/// for per-address TRC-20 transfer history.
pub(crate) struct TronClient {
    tatum: TatumApi,
    http: reqwest::Client,
    settings: NetworkSettings,
}

impl TronClient {
    pub(crate) fn new(settings: &NetworkSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            tatum: TatumApi::new(settings.tatum_url(), settings.tatum_api_key()),
            http,
            settings: settings.clone(),
        }
    }

    /// Inbound TRC-20 transfers of the configured token to `address`,
    /// newest first, via the Trongrid account-transactions API.
    pub(crate) async fn trc20_transfers_to(
        &self,
        address: &str,
    ) -> Result<Vec<TokenTransfer>, ChainError> {
        let url = format!(
            "{}/v1/accounts/{}/transactions/trc20?only_to=true&limit=200&contract_address={}",
            self.settings.rpc_url().trim_end_matches('/'),
            address,
            self.settings.token_contract(),
        );

        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ChainError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Value = serde_json::from_str(&body)?;
        let entries = parsed
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| ChainError::BadResponse("missing data array".to_string()))?;

        let mut transfers = Vec::new();
        for entry in entries {
            let Some(tx_hash) = entry.get("transaction_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(to) = entry.get("to").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = entry.get("value").and_then(Value::as_str) else {
                continue;
            };

            transfers.push(TokenTransfer {
                tx_hash: tx_hash.to_string(),
                to_address: to.to_string(),
                raw_amount: value.to_string(),
            });
        }

        Ok(transfers)
    }

    async fn fetch_account(&self, address: &str) -> Result<Value, ChainError> {
        self.tatum.get(&format!("/v3/tron/account/{}", address)).await
    }
}

#[async_trait]
impl ChainClient for TronClient {
    fn network(&self) -> Network {
        Network::Tron
    }

    async fn derive_address(&self, index: u32) -> Result<String, ChainError> {
        if self.settings.xpub().is_empty() {
            return Err(ChainError::MissingConfig("TRON_XPUB".to_string()));
        }

        let resp = self
            .tatum
            .get(&format!(
                "/v3/tron/address/{}/{}",
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
        let account = match self.fetch_account(address).await {
            Ok(account) => account,
            Err(e) => {
                warn!(%address, error = %e, "TRC-20 balance lookup failed, treating as zero");
                return 0.0;
            }
        };

        // trc20 is a list of single-key objects: [{"<contract>": "<raw>"}]
        let raw = account
            .get("trc20")
            .and_then(Value::as_array)
            .and_then(|tokens| {
                tokens.iter().find_map(|token| {
                    token
                        .get(self.settings.token_contract())
                        .and_then(Value::as_str)
                })
            })
            .unwrap_or("0");

        raw_to_human(raw, self.settings.token_decimals())
    }

    async fn native_balance(&self, address: &str) -> f64 {
        let account = match self.fetch_account(address).await {
            Ok(account) => account,
            Err(e) => {
                warn!(%address, error = %e, "TRX balance lookup failed, treating as zero");
                return 0.0;
            }
        };

        // balance is in sun (1 TRX = 1_000_000 sun)
        account
            .get("balance")
            .and_then(Value::as_u64)
            .map(|sun| sun as f64 / 1_000_000.0)
            .unwrap_or(0.0)
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
                "/v3/tron/trc20/transaction",
                json!({
                    "fromPrivateKey": from_key,
                    "to": to,
                    "tokenAddress": self.settings.token_contract(),
                    "amount": amount.to_string(),
                    "feeLimit": TRC20_FEE_LIMIT,
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
                "/v3/tron/transaction",
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

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> NetworkSettings {
        NetworkSettings::new(
            base_url.to_string(),
            "test-key".to_string(),
            base_url.to_string(),
            "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
            6,
            "xpub-test".to_string(),
            1.0,
            10.0,
            1.0,
            1000,
            2000,
        )
    }

    #[tokio::test]
    async fn derives_address_from_xpub() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v3/tron/address/xpub-test/7")
            .match_header("x-api-key", "test-key")
            .with_body(r#"{"address":"TXYZophqo99popqWUX2TNRzMB2S6EDbIh1"}"#)
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));
        let address = client.derive_address(7).await.unwrap();

        assert_eq!(address, "TXYZophqo99popqWUX2TNRzMB2S6EDbIh1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn lists_inbound_trc20_transfers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "GET",
                mockito::Matcher::Regex("/v1/accounts/Taddr/transactions/trc20.*".to_string()),
            )
            .with_body(
                r#"{"data":[
                    {"transaction_id":"deadbeef","to":"Taddr","value":"25000000","token_info":{"decimals":6}},
                    {"transaction_id":"cafebabe","to":"Taddr","value":"1500000","token_info":{"decimals":6}}
                ],"success":true}"#,
            )
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));
        let transfers = client.trc20_transfers_to("Taddr").await.unwrap();

        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].tx_hash, "deadbeef");
        assert_eq!(transfers[0].raw_amount, "25000000");
        assert_eq!(transfers[1].to_address, "Taddr");
    }

    #[tokio::test]
    async fn failed_balance_lookup_reads_as_zero() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/tron/account/Taddr")
            .with_status(500)
            .with_body("upstream exploded")
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));
        assert_eq!(client.token_balance("Taddr").await, 0.0);
        assert_eq!(client.native_balance("Taddr").await, 0.0);
    }

    #[tokio::test]
    async fn sends_return_the_transaction_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v3/tron/trc20/transaction")
            .match_header("x-api-key", "test-key")
            .with_body(r#"{"txId":"trc20tx"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v3/tron/transaction")
            .with_body(r#"{"txId":"trxtx"}"#)
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));
        assert_eq!(
            client.send_token("key", "Tdest", 9.5).await.unwrap(),
            "trc20tx"
        );
        assert_eq!(
            client.send_native("key", "Tdest", 1.0).await.unwrap(),
            "trxtx"
        );
    }

    #[tokio::test]
    async fn token_balance_picks_the_configured_contract() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v3/tron/account/Taddr")
            .with_body(
                r#"{"balance": 3500000, "trc20":[
                    {"TOtherContract11111111111111111111":"999"},
                    {"TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t":"12500000"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = TronClient::new(&settings(&server.url()));
        assert_eq!(client.token_balance("Taddr").await, 12.5);
        assert_eq!(client.native_balance("Taddr").await, 3.5);
    }
}
