//! Durable deposit and transaction records.

pub mod memory;
pub mod postgres;

use crate::errors::Result;
use crate::models::{
    Deposit, DepositProgress, DepositResult, LedgerReceipt, NewDeposit, NewRedeem, PipelineStep,
    Redeem, RedeemResult, Tx,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

pub use memory::MemoryStore;
pub use postgres::Database;

/// Result of an insert-if-absent on the deposit key
#[derive(Debug, Clone)]
pub enum DepositClaim {
    /// The caller created the record and owns the pipeline run
    Claimed(Deposit),
    /// A record with this id already existed; nothing was written
    Existing(Deposit),
}

/// Result of an insert-if-absent on the redeem key
#[derive(Debug, Clone)]
pub enum RedeemClaim {
    Claimed(Redeem),
    Existing(Redeem),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Atomically inserts a PENDING deposit unless one with the same id exists
    async fn claim_deposit(&self, deposit: NewDeposit) -> Result<DepositClaim>;

    /// Atomically moves a FAILED deposit back to PENDING. With `stale_before`
    /// set, a PENDING deposit last updated at or before that instant is taken
    /// over as well. `None` when nothing qualified.
    async fn reclaim_deposit(
        &self,
        deposit_id: &str,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>>;

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<Deposit>>;

    async fn record_deposit_progress(&self, deposit_id: &str, progress: DepositProgress) -> Result<()>;

    async fn fail_deposit(
        &self,
        deposit_id: &str,
        step: PipelineStep,
        reason: String,
        progress: DepositProgress,
    ) -> Result<()>;

    async fn complete_deposit(&self, deposit_id: &str, result: DepositResult) -> Result<()>;

    /// Atomically inserts a PENDING redeem unless one with the same id exists
    async fn claim_redeem(&self, redeem: NewRedeem) -> Result<RedeemClaim>;

    async fn fail_redeem(
        &self,
        redeem_id: &str,
        step: PipelineStep,
        reason: String,
        burn_receipt: Option<LedgerReceipt>,
    ) -> Result<()>;

    async fn complete_redeem(&self, redeem_id: &str, result: RedeemResult) -> Result<()>;

    /// Inserts a Tx; a second insert for the same `(type, reference)` is a no-op
    async fn insert_tx(&self, tx: Tx) -> Result<()>;

    /// Txs whose audit message has not been appended yet, oldest first
    async fn list_unlogged_txs(&self, limit: i64) -> Result<Vec<Tx>>;

    async fn mark_tx_logged(&self, tx_id: Uuid, seq: u64) -> Result<()>;
}
