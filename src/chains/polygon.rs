use alloy_primitives::{keccak256, Address, Bytes, Log, LogData, B256, U256};
use alloy_sol_types::{sol, SolEvent};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::chains::error::ChainError;
use crate::chains::tatum::TatumApi;
use crate::chains::ChainClient;
use crate::config::NetworkSettings;
use crate::types::network::Network;
use crate::utils::amounts::raw_to_human;

sol! {
    /// Canonical ERC-20 Transfer event
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Transfer event topic selector (keccak256 hash of event signature)
pub(crate) static TRANSFER_EVENT_SIG: Lazy<B256> =
    Lazy::new(|| keccak256(Transfer::SIGNATURE.as_bytes()));

/// Represents a subset of an Ethereum log entry returned by `eth_getLogs`.
///
/// Only includes fields relevant to decoding ERC-20 `Transfer` events; e.g.
/// `logIndex`, `transactionIndex`, `removed` and `blockHash` are deliberately
/// omitted as the deposit flow does not use them.
#[derive(Debug, Deserialize, Clone)]
pub(crate) struct LogEntry {
    /// The emitting contract address (should match the configured token)
    #[serde(deserialize_with = "from_hex_address")]
    pub(crate) address: Address,

    /// ABI-encoded event data (the transfer value)
    #[serde(deserialize_with = "from_hex_bytes")]
    pub(crate) data: Bytes,

    /// Indexed event parameters; first topic must match [`TRANSFER_EVENT_SIG`]
    #[serde(deserialize_with = "from_hex_b256_vec")]
    pub(crate) topics: Vec<B256>,

    /// Block number containing the log (used for cursor progress)
    #[serde(rename = "blockNumber", deserialize_with = "from_hex_u64")]
    pub(crate) block_number: u64,

    /// Transaction hash the log was emitted in
    #[serde(rename = "transactionHash", deserialize_with = "from_hex_b256")]
    pub(crate) transaction_hash: B256,
}

fn from_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str: String = Deserialize::deserialize(deserializer)?;
    u64::from_str_radix(hex_str.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn from_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| serde::de::Error::custom(format!("invalid hex: {e}")))?;
    Address::try_from(bytes.as_slice())
        .map_err(|e| serde::de::Error::custom(format!("invalid address: {e}")))
}

fn from_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| serde::de::Error::custom(format!("invalid hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(serde::de::Error::custom("expected 32 bytes"));
    }
    Ok(B256::from_slice(&bytes))
}

fn from_hex_bytes<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str: String = Deserialize::deserialize(deserializer)?;
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| serde::de::Error::custom(format!("invalid hex: {e}")))?;
    Ok(Bytes::from(bytes))
}

fn from_hex_b256_vec<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_vec: Vec<String> = Deserialize::deserialize(deserializer)?;
    hex_vec
        .into_iter()
        .map(|s| from_hex_b256(serde::de::IntoDeserializer::into_deserializer(s)))
        .collect()
}

/// A decoded ERC-20 transfer extracted from a [`LogEntry`].
#[derive(Debug, Clone)]
pub(crate) struct DecodedTransfer {
    /// Transaction hash the transfer happened in
    pub(crate) tx_hash: B256,
    /// Destination, decoded from the last indexed topic
    pub(crate) to: Address,
    /// Raw token amount
    pub(crate) value: U256,
    /// Block number the log appeared in
    pub(crate) block_number: u64,
}

impl DecodedTransfer {
    /// Lowercase 0x-prefixed destination, the form deposit addresses are
    /// stored in.
    pub(crate) fn to_address(&self) -> String {
        format!("{:#x}", self.to)
    }
}

/// Decode a `Transfer` log entry; rejects logs whose topic0 differs.
pub(crate) fn decode_transfer(log: &LogEntry) -> Result<DecodedTransfer, ChainError> {
    let log_data = LogData::new(log.topics.clone(), log.data.clone())
        .ok_or_else(|| ChainError::BadResponse("invalid log topics".to_string()))?;

    let event_log = Log {
        address: log.address,
        data: log_data,
    };

    let event = Transfer::decode_log(&event_log, true)
        .map_err(|e| ChainError::BadResponse(format!("failed to decode Transfer log: {e}")))?;

    Ok(DecodedTransfer {
        tx_hash: log.transaction_hash,
        to: event.to,
        value: event.value,
        block_number: log.block_number,
    })
}

/// Polygon client: Tatum REST for wallet derivation and sends, raw JSON-RPC
/// for head/log queries used by the deposit scanner.
pub(crate) struct PolygonClient {
    tatum: TatumApi,
    http: reqwest::Client,
    settings: NetworkSettings,
}

impl PolygonClient {
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

    /// Issue one raw JSON-RPC call.
    ///
    /// Errors keep the provider's wording intact: the scanner classifies
    /// retryability by substring, and providers phrase their range and
    /// rate limits inconsistently.
    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
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

    /// Current chain head via `eth_blockNumber`.
    pub(crate) async fn head_block(&self) -> Result<u64, ChainError> {
        let result = self.rpc_call("eth_blockNumber", json!([])).await?;
        let head = result
            .as_str()
            .ok_or_else(|| ChainError::BadResponse("expected block number string".to_string()))?;

        u64::from_str_radix(head.trim_start_matches("0x"), 16)
            .map_err(|e| ChainError::BadResponse(format!("bad block number '{head}': {e}")))
    }

    /// Fetch Transfer logs of the configured token for a block range.
    pub(crate) async fn transfer_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, ChainError> {
        let params = json!([{
            "fromBlock": format!("{:#x}", from_block),
            "toBlock": format!("{:#x}", to_block),
            "address": self.settings.token_contract(),
            "topics": [format!("{:#x}", *TRANSFER_EVENT_SIG)]
        }]);

        let result = self.rpc_call("eth_getLogs", params).await?;
        let logs: Vec<LogEntry> = serde_json::from_value(result)?;
        Ok(logs)
    }

    /// Logs of a single mined transaction, for targeted deposit recovery.
    pub(crate) async fn receipt_logs(&self, tx_hash: &str) -> Result<Vec<LogEntry>, ChainError> {
        #[derive(Deserialize)]
        struct Receipt {
            logs: Vec<LogEntry>,
        }

        let result = self
            .rpc_call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        let receipt: Option<Receipt> = serde_json::from_value(result)?;
        Ok(receipt.map(|r| r.logs).unwrap_or_default())
    }
}

#[async_trait]
impl ChainClient for PolygonClient {
    fn network(&self) -> Network {
        Network::Polygon
    }

    async fn derive_address(&self, index: u32) -> Result<String, ChainError> {
        if self.settings.xpub().is_empty() {
            return Err(ChainError::MissingConfig("POLYGON_XPUB".to_string()));
        }

        let resp = self
            .tatum
            .get(&format!(
                "/v3/polygon/address/{}/{}",
                self.settings.xpub(),
                index
            ))
            .await?;

        resp.get("address")
            .and_then(Value::as_str)
            .map(|a| a.to_lowercase())
            .ok_or_else(|| ChainError::BadResponse("missing address".to_string()))
    }

    async fn token_balance(&self, address: &str) -> f64 {
        let resp = self
            .tatum
            .get(&format!(
                "/v3/blockchain/token/balance/MATIC/{}/{}",
                self.settings.token_contract(),
                address
            ))
            .await;

        match resp {
            Ok(value) => {
                let raw = value.get("balance").and_then(Value::as_str).unwrap_or("0");
                raw_to_human(raw, self.settings.token_decimals())
            }
            Err(e) => {
                warn!(%address, error = %e, "ERC-20 balance lookup failed, treating as zero");
                0.0
            }
        }
    }

    async fn native_balance(&self, address: &str) -> f64 {
        let resp = self
            .tatum
            .get(&format!("/v3/polygon/account/balance/{}", address))
            .await;

        match resp {
            Ok(value) => value
                .get("balance")
                .and_then(Value::as_str)
                .and_then(|b| b.parse::<f64>().ok())
                .unwrap_or(0.0),
            Err(e) => {
                warn!(%address, error = %e, "MATIC balance lookup failed, treating as zero");
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
                "/v3/blockchain/token/transaction",
                json!({
                    "chain": "MATIC",
                    "fromPrivateKey": from_key,
                    "to": to,
                    "contractAddress": self.settings.token_contract(),
                    "amount": amount.to_string(),
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
                "/v3/polygon/transaction",
                json!({
                    "fromPrivateKey": from_key,
                    "to": to,
                    "amount": amount.to_string(),
                    "currency": "MATIC",
                }),
            )
            .await?;

        TatumApi::tx_id(&resp)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hex_literal::hex;

    pub(crate) fn settings(base_url: &str) -> NetworkSettings {
        NetworkSettings::new(
            base_url.to_string(),
            "test-key".to_string(),
            base_url.to_string(),
            "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359".to_string(),
            6,
            "xpub-test".to_string(),
            1.0,
            10.0,
            0.5,
            1000,
            2000,
        )
    }

    /// Raw log entry JSON the way Polygon RPC renders it.
    pub(crate) fn transfer_log_json(to: &str, value: u128, block: u64, tx: &str) -> Value {
        let mut to_word = [0u8; 32];
        let to_bytes = hex::decode(to.trim_start_matches("0x")).unwrap();
        to_word[12..].copy_from_slice(&to_bytes);

        json!({
            "address": "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359",
            "topics": [
                format!("{:#x}", *TRANSFER_EVENT_SIG),
                "0x0000000000000000000000001111111111111111111111111111111111111111",
                format!("0x{}", hex::encode(to_word)),
            ],
            "data": format!("0x{:064x}", value),
            "blockNumber": format!("{:#x}", block),
            "transactionHash": tx,
        })
    }

    #[test]
    fn transfer_topic_matches_the_canonical_selector() {
        let expected = B256::from(hex!(
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        ));
        assert_eq!(*TRANSFER_EVENT_SIG, expected);
    }

    #[test]
    fn decodes_destination_and_value() {
        let raw = transfer_log_json(
            "0x2222222222222222222222222222222222222222",
            1_500_000,
            100,
            "0x00000000000000000000000000000000000000000000000000000000deadbeef",
        );
        let entry: LogEntry = serde_json::from_value(raw).unwrap();
        let decoded = decode_transfer(&entry).unwrap();

        assert_eq!(
            decoded.to_address(),
            "0x2222222222222222222222222222222222222222"
        );
        assert_eq!(decoded.value, U256::from(1_500_000u64));
        assert_eq!(decoded.block_number, 100);
    }

    #[tokio::test]
    async fn fetches_transfer_logs_over_json_rpc() {
        let mut server = mockito::Server::new_async().await;
        let log = transfer_log_json(
            "0x2222222222222222222222222222222222222222",
            1_500_000,
            64,
            "0x00000000000000000000000000000000000000000000000000000000deadbeef",
        );
        server
            .mock("POST", "/")
            .with_body(json!({"jsonrpc": "2.0", "id": 1, "result": [log]}).to_string())
            .create_async()
            .await;

        let client = PolygonClient::new(&settings(&server.url()));
        let logs = client.transfer_logs(1, 64).await.unwrap();

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 64);
    }

    #[tokio::test]
    async fn surfaces_rpc_error_wording() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {"code": -32005, "message": "query returned more than 10000 results"}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = PolygonClient::new(&settings(&server.url()));
        let err = client.transfer_logs(1, 100_000).await.unwrap_err();

        assert!(err.to_string().contains("more than 10000 results"));
    }
}
