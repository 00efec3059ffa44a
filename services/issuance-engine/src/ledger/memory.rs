use super::{LedgerClient, TokenBurn, TokenCreate, TokenMint, TokenTransfer};
use crate::errors::{IssuanceError, LedgerOperation, Result};
use crate::models::{LedgerReceipt, RECEIPT_SUCCESS};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Injected outcome for the next call of an operation
#[derive(Debug, Clone)]
pub enum LedgerFault {
    /// Transport-level failure, no receipt
    Error(String),
    /// Receipt returned with a non-success status
    Status(String),
}

#[derive(Debug, Default)]
struct TokenState {
    treasury: String,
    total_supply: u64,
    balances: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    tokens: HashMap<String, TokenState>,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<&'static str, LedgerFault>,
    next_entity: u64,
    next_tx: u64,
}

/// In-process token ledger used for local runs and tests
pub struct MemoryLedger {
    operator: String,
    latency: Duration,
    state: Arc<RwLock<LedgerState>>,
}

fn op_key(operation: LedgerOperation) -> &'static str {
    match operation {
        LedgerOperation::CreateToken => "create_token",
        LedgerOperation::Mint => "mint",
        LedgerOperation::Transfer => "transfer",
        LedgerOperation::Burn => "burn",
    }
}

impl MemoryLedger {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            latency: Duration::ZERO,
            state: Arc::new(RwLock::new(LedgerState {
                next_entity: 5000,
                ..Default::default()
            })),
        }
    }

    /// Simulated consensus latency applied to every operation
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Registers an existing token whose treasury is `treasury`
    pub async fn register_token(&self, token_id: &str, treasury: &str) {
        self.state.write().await.tokens.insert(
            token_id.to_string(),
            TokenState {
                treasury: treasury.to_string(),
                ..Default::default()
            },
        );
    }

    pub async fn fail_next(&self, operation: LedgerOperation, fault: LedgerFault) {
        self.state.write().await.faults.insert(op_key(operation), fault);
    }

    pub async fn calls(&self, operation: LedgerOperation) -> usize {
        self.state
            .read()
            .await
            .calls
            .get(op_key(operation))
            .copied()
            .unwrap_or(0)
    }

    pub async fn balance(&self, token_id: &str, account: &str) -> u64 {
        let state = self.state.read().await;
        state
            .tokens
            .get(token_id)
            .and_then(|token| token.balances.get(account).copied())
            .unwrap_or(0)
    }

    pub async fn total_supply(&self, token_id: &str) -> u64 {
        let state = self.state.read().await;
        state.tokens.get(token_id).map(|t| t.total_supply).unwrap_or(0)
    }

    /// Counts the call and returns the injected fault, if any
    async fn begin(&self, operation: LedgerOperation) -> Option<LedgerFault> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.write().await;
        *state.calls.entry(op_key(operation)).or_insert(0) += 1;
        state.faults.remove(op_key(operation))
    }

    fn receipt(&self, state: &mut LedgerState, status: &str, supply: Option<u64>) -> LedgerReceipt {
        state.next_tx += 1;
        let now = Utc::now();
        LedgerReceipt {
            status: status.to_string(),
            transaction_id: format!("{}@{}.{:09}", self.operator, now.timestamp(), state.next_tx),
            consensus_timestamp: Some(format!(
                "{}.{:09}",
                now.timestamp(),
                now.timestamp_subsec_nanos()
            )),
            new_total_supply: supply,
        }
    }

    async fn faulted(&self, operation: LedgerOperation, fault: LedgerFault) -> Result<LedgerReceipt> {
        warn!("Memory ledger: injected {} fault {:?}", operation, fault);
        match fault {
            LedgerFault::Error(reason) => Err(IssuanceError::ledger(operation, reason)),
            LedgerFault::Status(status) => {
                let mut state = self.state.write().await;
                Ok(self.receipt(&mut state, &status, None))
            }
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn create_token(&self, request: TokenCreate) -> Result<String> {
        if let Some(fault) = self.begin(LedgerOperation::CreateToken).await {
            let reason = match fault {
                LedgerFault::Error(reason) | LedgerFault::Status(reason) => reason,
            };
            return Err(IssuanceError::ledger(LedgerOperation::CreateToken, reason));
        }

        let mut state = self.state.write().await;
        state.next_entity += 1;
        let token_id = format!("0.0.{}", state.next_entity);
        state.tokens.insert(
            token_id.clone(),
            TokenState {
                treasury: request.treasury_account.clone(),
                ..Default::default()
            },
        );

        info!("Memory ledger: created token {} ({})", token_id, request.symbol);
        Ok(token_id)
    }

    async fn mint(&self, request: TokenMint) -> Result<LedgerReceipt> {
        if let Some(fault) = self.begin(LedgerOperation::Mint).await {
            return self.faulted(LedgerOperation::Mint, fault).await;
        }

        let mut state = self.state.write().await;
        let (status, supply) = match state.tokens.get_mut(&request.token_id) {
            None => ("INVALID_TOKEN_ID", None),
            Some(token) => {
                let treasury = token.treasury.clone();
                let held = token.balances.get(&treasury).copied().unwrap_or(0);
                match (
                    token.total_supply.checked_add(request.amount),
                    held.checked_add(request.amount),
                ) {
                    (Some(supply), Some(balance)) => {
                        token.total_supply = supply;
                        token.balances.insert(treasury, balance);
                        (RECEIPT_SUCCESS, Some(supply))
                    }
                    _ => ("TOKEN_MAX_SUPPLY_REACHED", None),
                }
            }
        };

        Ok(self.receipt(&mut state, status, supply))
    }

    async fn transfer(&self, request: TokenTransfer) -> Result<LedgerReceipt> {
        if let Some(fault) = self.begin(LedgerOperation::Transfer).await {
            return self.faulted(LedgerOperation::Transfer, fault).await;
        }

        let mut state = self.state.write().await;
        let status = match state.tokens.get_mut(&request.token_id) {
            None => "INVALID_TOKEN_ID",
            Some(token) => {
                let available = token.balances.get(&request.from_account).copied().unwrap_or(0);
                let received = token.balances.get(&request.to_account).copied().unwrap_or(0);
                if available < request.amount {
                    "INSUFFICIENT_TOKEN_BALANCE"
                } else if request.from_account == request.to_account {
                    RECEIPT_SUCCESS
                } else {
                    match received.checked_add(request.amount) {
                        None => "AMOUNT_EXCEEDS_TOKEN_MAX_SUPPLY",
                        Some(balance) => {
                            token
                                .balances
                                .insert(request.from_account.clone(), available - request.amount);
                            token.balances.insert(request.to_account.clone(), balance);
                            RECEIPT_SUCCESS
                        }
                    }
                }
            }
        };

        Ok(self.receipt(&mut state, status, None))
    }

    async fn burn(&self, request: TokenBurn) -> Result<LedgerReceipt> {
        if let Some(fault) = self.begin(LedgerOperation::Burn).await {
            return self.faulted(LedgerOperation::Burn, fault).await;
        }

        let mut state = self.state.write().await;
        let (status, supply) = match state.tokens.get_mut(&request.token_id) {
            None => ("INVALID_TOKEN_ID", None),
            Some(token) => {
                let treasury = token.treasury.clone();
                let available = token.balances.get(&treasury).copied().unwrap_or(0);
                if available < request.amount {
                    ("INVALID_TOKEN_BURN_AMOUNT", None)
                } else {
                    token.balances.insert(treasury, available - request.amount);
                    token.total_supply -= request.amount;
                    (RECEIPT_SUCCESS, Some(token.total_supply))
                }
            }
        };

        Ok(self.receipt(&mut state, status, supply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretKey;

    const TOKEN: &str = "0.0.5005";
    const TREASURY: &str = "0.0.3";

    async fn ledger() -> MemoryLedger {
        let ledger = MemoryLedger::new("0.0.2");
        ledger.register_token(TOKEN, TREASURY).await;
        ledger
    }

    fn mint(amount: u64) -> TokenMint {
        TokenMint {
            token_id: TOKEN.to_string(),
            amount,
            supply_key: SecretKey::new("supply"),
        }
    }

    fn transfer(to: &str, amount: u64) -> TokenTransfer {
        TokenTransfer {
            token_id: TOKEN.to_string(),
            from_account: TREASURY.to_string(),
            from_key: SecretKey::new("treasury"),
            to_account: to.to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_mint_then_transfer_moves_balance() {
        let ledger = ledger().await;

        let minted = ledger.mint(mint(1234)).await.unwrap();
        assert!(minted.is_success());
        assert_eq!(minted.new_total_supply, Some(1234));

        let moved = ledger.transfer(transfer("0.0.4821", 1234)).await.unwrap();
        assert!(moved.is_success());
        assert_eq!(ledger.balance(TOKEN, "0.0.4821").await, 1234);
        assert_eq!(ledger.balance(TOKEN, TREASURY).await, 0);
    }

    #[tokio::test]
    async fn test_transfer_without_balance_returns_failed_receipt() {
        let ledger = ledger().await;
        let receipt = ledger.transfer(transfer("0.0.4821", 1)).await.unwrap();
        assert_eq!(receipt.status, "INSUFFICIENT_TOKEN_BALANCE");
    }

    #[tokio::test]
    async fn test_burn_reduces_supply() {
        let ledger = ledger().await;
        ledger.mint(mint(900)).await.unwrap();

        let receipt = ledger
            .burn(TokenBurn {
                token_id: TOKEN.to_string(),
                amount: 500,
                supply_key: SecretKey::new("supply"),
            })
            .await
            .unwrap();

        assert!(receipt.is_success());
        assert_eq!(ledger.total_supply(TOKEN).await, 400);
    }

    #[tokio::test]
    async fn test_mint_past_max_supply_is_refused() {
        let ledger = ledger().await;
        assert!(ledger.mint(mint(u64::MAX)).await.unwrap().is_success());

        let receipt = ledger.mint(mint(1)).await.unwrap();
        assert_eq!(receipt.status, "TOKEN_MAX_SUPPLY_REACHED");
        assert!(receipt.new_total_supply.is_none());
        assert_eq!(ledger.total_supply(TOKEN).await, u64::MAX);
        assert_eq!(ledger.balance(TOKEN, TREASURY).await, u64::MAX);
    }

    #[tokio::test]
    async fn test_self_transfer_keeps_balance() {
        let ledger = ledger().await;
        ledger.mint(mint(40)).await.unwrap();

        let receipt = ledger.transfer(transfer(TREASURY, 40)).await.unwrap();
        assert!(receipt.is_success());
        assert_eq!(ledger.balance(TOKEN, TREASURY).await, 40);
    }

    #[tokio::test]
    async fn test_injected_fault_applies_once() {
        let ledger = ledger().await;
        ledger
            .fail_next(LedgerOperation::Mint, LedgerFault::Error("PLATFORM_NOT_ACTIVE".into()))
            .await;

        assert!(ledger.mint(mint(10)).await.is_err());
        assert!(ledger.mint(mint(10)).await.unwrap().is_success());
        assert_eq!(ledger.calls(LedgerOperation::Mint).await, 2);
    }

    #[tokio::test]
    async fn test_created_token_is_usable() {
        let ledger = MemoryLedger::new("0.0.2");
        let token_id = ledger
            .create_token(TokenCreate {
                name: "Afristable Nigerian Naira".to_string(),
                symbol: "aNGN".to_string(),
                decimals: 2,
                treasury_account: TREASURY.to_string(),
                treasury_key: SecretKey::new("treasury"),
                supply_key: SecretKey::new("supply"),
            })
            .await
            .unwrap();

        let receipt = ledger
            .mint(TokenMint {
                token_id: token_id.clone(),
                amount: 50,
                supply_key: SecretKey::new("supply"),
            })
            .await
            .unwrap();
        assert!(receipt.is_success());
        assert_eq!(ledger.balance(&token_id, TREASURY).await, 50);
    }
}
