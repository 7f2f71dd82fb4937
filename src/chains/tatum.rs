use serde_json::Value;
use std::time::Duration;

use crate::chains::error::ChainError;

/// Thin authenticated wrapper over the Tatum REST API.
///
/// Shared by every chain client for wallet derivation, balances and sends;
/// the API key travels in the `x-api-key` header and is never logged.
#[derive(Debug, Clone)]
pub(crate) struct TatumApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TatumApi {
    pub(crate) fn new(base_url: &str, api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub(crate) async fn get(&self, path: &str) -> Result<Value, ChainError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .send()
            .await?;

        Self::into_json(resp).await
    }

    pub(crate) async fn post(&self, path: &str, payload: Value) -> Result<Value, ChainError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        Self::into_json(resp).await
    }

    async fn into_json(resp: reqwest::Response) -> Result<Value, ChainError> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(ChainError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Extract the transaction id from a Tatum send response.
    pub(crate) fn tx_id(resp: &Value) -> Result<String, ChainError> {
        resp.get("txId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("missing txId".to_string()))
    }
}
