// HTTP adapter for the ledger gateway sidecar, which wraps the network SDK
// and is only reachable on the loopback interface.

use super::{LedgerClient, TokenBurn, TokenCreate, TokenMint, TokenTransfer};
use crate::errors::{IssuanceError, LedgerOperation, Result};
use crate::models::LedgerReceipt;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MintBody<'a> {
    amount: u64,
    supply_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferBody<'a> {
    from_account_id: &'a str,
    from_private_key: &'a str,
    to_account_id: &'a str,
    amount: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BurnBody<'a> {
    amount: u64,
    supply_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenBody<'a> {
    name: &'a str,
    symbol: &'a str,
    decimals: u32,
    initial_supply: u64,
    treasury_account_id: &'a str,
    treasury_private_key: &'a str,
    supply_key: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenResponse {
    token_id: String,
}

pub struct GatewayLedgerClient {
    base_url: String,
    client: Client,
}

impl GatewayLedgerClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| IssuanceError::Config(format!("ledger gateway client: {}", e)))?;

        Ok(GatewayLedgerClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post<B, R>(&self, operation: LedgerOperation, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Ledger gateway {} request failed: {}", operation, e);
                IssuanceError::ledger(operation, format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(IssuanceError::ledger(
                operation,
                format!("gateway returned {}: {}", status, error_text),
            ));
        }

        response.json::<R>().await.map_err(|e| {
            IssuanceError::ledger(operation, format!("unreadable gateway response: {}", e))
        })
    }
}

#[async_trait]
impl LedgerClient for GatewayLedgerClient {
    async fn create_token(&self, request: TokenCreate) -> Result<String> {
        let body = CreateTokenBody {
            name: &request.name,
            symbol: &request.symbol,
            decimals: request.decimals,
            initial_supply: 0,
            treasury_account_id: &request.treasury_account,
            treasury_private_key: request.treasury_key.expose(),
            supply_key: request.supply_key.expose(),
        };

        let created: CreateTokenResponse = self
            .post(LedgerOperation::CreateToken, "/tokens", &body)
            .await?;

        info!("Created token {} ({})", created.token_id, request.symbol);
        Ok(created.token_id)
    }

    async fn mint(&self, request: TokenMint) -> Result<LedgerReceipt> {
        let body = MintBody {
            amount: request.amount,
            supply_key: request.supply_key.expose(),
        };
        let path = format!("/tokens/{}/mint", request.token_id);

        let receipt: LedgerReceipt = self.post(LedgerOperation::Mint, &path, &body).await?;
        info!("Mint receipt: {}", receipt.status);
        Ok(receipt)
    }

    async fn transfer(&self, request: TokenTransfer) -> Result<LedgerReceipt> {
        let body = TransferBody {
            from_account_id: &request.from_account,
            from_private_key: request.from_key.expose(),
            to_account_id: &request.to_account,
            amount: request.amount,
        };
        let path = format!("/tokens/{}/transfer", request.token_id);

        let receipt: LedgerReceipt = self.post(LedgerOperation::Transfer, &path, &body).await?;
        info!("Transfer receipt: {}", receipt.status);
        Ok(receipt)
    }

    async fn burn(&self, request: TokenBurn) -> Result<LedgerReceipt> {
        let body = BurnBody {
            amount: request.amount,
            supply_key: request.supply_key.expose(),
        };
        let path = format!("/tokens/{}/burn", request.token_id);

        let receipt: LedgerReceipt = self.post(LedgerOperation::Burn, &path, &body).await?;
        info!("Burn receipt: {}", receipt.status);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = GatewayLedgerClient::new("http://127.0.0.1:5600/".to_string(), 5).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:5600");
    }

    #[test]
    fn test_transfer_body_wire_names() {
        let body = TransferBody {
            from_account_id: "0.0.3",
            from_private_key: "302e",
            to_account_id: "0.0.4821",
            amount: 1234,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["fromAccountId"], "0.0.3");
        assert_eq!(value["toAccountId"], "0.0.4821");
        assert_eq!(value["amount"], 1234);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_a_ledger_failure() {
        // Port 9 (discard) is never served in test environments
        let client = GatewayLedgerClient::new("http://127.0.0.1:9".to_string(), 1).unwrap();
        let err = client
            .mint(TokenMint {
                token_id: "0.0.5005".to_string(),
                amount: 100,
                supply_key: crate::config::SecretKey::new("302e"),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IssuanceError::LedgerOperationFailed {
                operation: LedgerOperation::Mint,
                ..
            }
        ));
    }
}
