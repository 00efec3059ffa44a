//! Token ledger client.
//!
//! Every call blocks until the network returns a receipt or a terminal failure;
//! retries and timeouts belong to the implementation, never to the caller.

pub mod gateway;
pub mod memory;

use crate::config::SecretKey;
use crate::errors::Result;
use crate::models::LedgerReceipt;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

pub use gateway::GatewayLedgerClient;
pub use memory::MemoryLedger;

/// Mint `amount` units into the token treasury, signed by the supply key
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMint {
    pub token_id: String,
    pub amount: u64,
    pub supply_key: SecretKey,
}

/// Move `amount` units between accounts, signed by the sender
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub token_id: String,
    pub from_account: String,
    pub from_key: SecretKey,
    pub to_account: String,
    pub amount: u64,
}

/// Burn `amount` units from the token treasury, signed by the supply key
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBurn {
    pub token_id: String,
    pub amount: u64,
    pub supply_key: SecretKey,
}

/// Fungible token with an unbounded supply controlled by `supply_key`
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCreate {
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
    pub treasury_account: String,
    pub treasury_key: SecretKey,
    pub supply_key: SecretKey,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn create_token(&self, request: TokenCreate) -> Result<String>;
    async fn mint(&self, request: TokenMint) -> Result<LedgerReceipt>;
    async fn transfer(&self, request: TokenTransfer) -> Result<LedgerReceipt>;
    async fn burn(&self, request: TokenBurn) -> Result<LedgerReceipt>;
}
