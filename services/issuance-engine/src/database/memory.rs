use super::{DepositClaim, RedeemClaim, TransactionStore};
use crate::errors::{IssuanceError, Result};
use crate::models::{
    Deposit, DepositProgress, DepositResult, DepositStatus, LedgerReceipt, NewDeposit,
    NewRedeem, PipelineStage, PipelineStep, Redeem, RedeemResult, RedeemStatus, Tx,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    deposits: HashMap<String, Deposit>,
    redeems: HashMap<String, Redeem>,
    txs: Vec<Tx>,
    fail_writes: bool,
    /// Writes still allowed before the store starts failing
    writes_left: Option<usize>,
    writes: usize,
}

impl StoreState {
    fn check_writable(&mut self) -> Result<()> {
        if self.writes_left == Some(0) {
            self.fail_writes = true;
        }
        if self.fail_writes {
            return Err(IssuanceError::PersistenceFailed(
                "simulated store outage".to_string(),
            ));
        }
        if let Some(left) = self.writes_left.as_mut() {
            *left -= 1;
        }
        self.writes += 1;
        Ok(())
    }

    fn deposit_mut(&mut self, deposit_id: &str) -> Result<&mut Deposit> {
        self.deposits
            .get_mut(deposit_id)
            .ok_or_else(|| IssuanceError::DepositNotFound(deposit_id.to_string()))
    }

    fn redeem_mut(&mut self, redeem_id: &str) -> Result<&mut Redeem> {
        self.redeems
            .get_mut(redeem_id)
            .ok_or_else(|| IssuanceError::Internal(format!("redeem {} not found", redeem_id)))
    }
}

fn apply_progress(deposit: &mut Deposit, progress: DepositProgress) {
    deposit.stage = progress.stage;
    if progress.mint_receipt.is_some() {
        deposit.mint_receipt = progress.mint_receipt;
    }
    if progress.transfer_receipt.is_some() {
        deposit.transfer_receipt = progress.transfer_receipt;
    }
    if progress.hcs.is_some() {
        deposit.hcs = progress.hcs;
    }
    deposit.updated_at = Utc::now();
}

/// Process-local store with the same claim semantics as the Postgres store.
/// One mutex guards every record, so claims are atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write fails with `PersistenceFailed`
    pub async fn fail_writes(&self, fail: bool) {
        let mut state = self.state.lock().await;
        state.fail_writes = fail;
        state.writes_left = None;
    }

    /// Lets `n` more writes through, then fails every write after them
    pub async fn fail_writes_after(&self, n: usize) {
        self.state.lock().await.writes_left = Some(n);
    }

    pub async fn txs(&self) -> Vec<Tx> {
        self.state.lock().await.txs.clone()
    }

    /// Number of successful writes, claims included
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn deposits(&self) -> Vec<Deposit> {
        self.state.lock().await.deposits.values().cloned().collect()
    }

    pub async fn get_redeem(&self, redeem_id: &str) -> Option<Redeem> {
        self.state.lock().await.redeems.get(redeem_id).cloned()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn claim_deposit(&self, deposit: NewDeposit) -> Result<DepositClaim> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.deposits.get(&deposit.deposit_id) {
            return Ok(DepositClaim::Existing(existing.clone()));
        }

        state.check_writable()?;
        let pending = deposit.into_pending(Utc::now());
        state
            .deposits
            .insert(pending.deposit_id.clone(), pending.clone());

        Ok(DepositClaim::Claimed(pending))
    }

    async fn reclaim_deposit(
        &self,
        deposit_id: &str,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>> {
        let mut state = self.state.lock().await;

        let reclaimable = match state.deposits.get(deposit_id) {
            Some(deposit) => match deposit.status {
                DepositStatus::Failed => true,
                DepositStatus::Pending => stale_before.map_or(false, |cutoff| deposit.updated_at <= cutoff),
                DepositStatus::Completed => false,
            },
            None => false,
        };
        if !reclaimable {
            return Ok(None);
        }

        state.check_writable()?;
        let deposit = state.deposit_mut(deposit_id)?;
        deposit.status = DepositStatus::Pending;
        deposit.failed_step = None;
        deposit.last_error = None;
        deposit.updated_at = Utc::now();

        Ok(Some(deposit.clone()))
    }

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<Deposit>> {
        Ok(self.state.lock().await.deposits.get(deposit_id).cloned())
    }

    async fn record_deposit_progress(&self, deposit_id: &str, progress: DepositProgress) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;
        apply_progress(state.deposit_mut(deposit_id)?, progress);
        Ok(())
    }

    async fn fail_deposit(
        &self,
        deposit_id: &str,
        step: PipelineStep,
        reason: String,
        progress: DepositProgress,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        let deposit = state.deposit_mut(deposit_id)?;
        apply_progress(deposit, progress);
        deposit.status = DepositStatus::Failed;
        deposit.failed_step = Some(step);
        deposit.last_error = Some(reason);
        Ok(())
    }

    async fn complete_deposit(&self, deposit_id: &str, result: DepositResult) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        let deposit = state.deposit_mut(deposit_id)?;
        deposit.status = DepositStatus::Completed;
        deposit.stage = PipelineStage::Persisted;
        deposit.failed_step = None;
        deposit.last_error = None;
        deposit.mint_receipt = Some(result.mint_receipt.clone());
        deposit.transfer_receipt = Some(result.transfer_receipt.clone());
        deposit.hcs = Some(result.hcs.clone());
        deposit.minted_tx = Some(result);
        deposit.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_redeem(&self, redeem: NewRedeem) -> Result<RedeemClaim> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.redeems.get(&redeem.redeem_id) {
            return Ok(RedeemClaim::Existing(existing.clone()));
        }

        state.check_writable()?;
        let pending = redeem.into_pending(Utc::now());
        state
            .redeems
            .insert(pending.redeem_id.clone(), pending.clone());

        Ok(RedeemClaim::Claimed(pending))
    }

    async fn fail_redeem(
        &self,
        redeem_id: &str,
        step: PipelineStep,
        reason: String,
        burn_receipt: Option<LedgerReceipt>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        let redeem = state.redeem_mut(redeem_id)?;
        redeem.status = RedeemStatus::Failed;
        redeem.failed_step = Some(step);
        redeem.last_error = Some(reason);
        if burn_receipt.is_some() {
            redeem.burn_receipt = burn_receipt;
        }
        redeem.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_redeem(&self, redeem_id: &str, result: RedeemResult) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        let redeem = state.redeem_mut(redeem_id)?;
        redeem.status = RedeemStatus::Completed;
        redeem.failed_step = None;
        redeem.last_error = None;
        redeem.burn_receipt = Some(result.burn_receipt.clone());
        redeem.result = Some(result);
        redeem.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_tx(&self, tx: Tx) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        let duplicate = state
            .txs
            .iter()
            .any(|t| t.tx_type == tx.tx_type && t.reference == tx.reference);
        if duplicate {
            warn!(
                tx_type = %tx.tx_type,
                reference = %tx.reference,
                "Tx already recorded for reference, insert skipped"
            );
        } else {
            state.txs.push(tx);
        }
        Ok(())
    }

    async fn list_unlogged_txs(&self, limit: i64) -> Result<Vec<Tx>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        let mut unlogged: Vec<Tx> = state
            .txs
            .iter()
            .filter(|t| t.hcs_seq.is_none())
            .cloned()
            .collect();
        unlogged.sort_by_key(|t| t.created_at);
        unlogged.truncate(limit);
        Ok(unlogged)
    }

    async fn mark_tx_logged(&self, tx_id: Uuid, seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_writable()?;

        if let Some(tx) = state
            .txs
            .iter_mut()
            .find(|t| t.id == tx_id && t.hcs_seq.is_none())
        {
            tx.hcs_seq = Some(seq);
        }
        Ok(())
    }
}
