//! Issuance pipelines.
//!
//! A deposit runs `mint -> transfer -> audit log -> Tx -> COMPLETED`, strictly in
//! that order. The deposit row is claimed before the first ledger call and every
//! committed step is checkpointed on it, so a redelivered callback never reaches
//! the ledger twice and a failed run can be resumed from its last receipt.
//! Nothing is rolled back: a failure records how far the run got and stops.
//!
//! A redeem claims its redeem id the same way before burning, so a repeated
//! request replays the stored result instead of burning again.

use crate::amount::{body_error, AmountNormalizer, FiatAmount};
use crate::audit_log::{audit_timestamp, identity_hash, AuditLog};
use crate::config::PipelineConfig;
use crate::database::{DepositClaim, RedeemClaim, TransactionStore};
use crate::errors::{IssuanceError, LedgerOperation, Result};
use crate::ledger::{LedgerClient, TokenBurn, TokenCreate, TokenMint, TokenTransfer};
use crate::metrics::{
    AUDIT_SUBMISSIONS, LEDGER_OPERATIONS, PIPELINE_DURATION, PIPELINE_RUNS, WEBHOOK_REJECTIONS,
};
use crate::models::{
    AuditAck, AuditEvent, CreateTokenRequest, Deposit, DepositCallback, DepositOutcome,
    DepositProgress, DepositResult, DepositStatus, LedgerReceipt, NewDeposit, NewRedeem,
    PayoutStatus, PipelineStage, PipelineStep, Redeem, RedeemOutcome, RedeemRequest,
    RedeemResult, RedeemStatus, ResumeRequest, TransferRequest, TransferResult, Tx, TxType,
};
use crate::payout::{PayoutGateway, PayoutRequest, UnimplementedPayout};
use crate::security_middleware::WebhookVerifier;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Result of an audit re-log pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelogReport {
    pub relogged: usize,
    pub pending: usize,
}

/// Maps a store error to `PersistenceFailed` so callers see one failure kind
fn persistence(err: IssuanceError) -> IssuanceError {
    match err {
        IssuanceError::PersistenceFailed(_) => err,
        other => IssuanceError::PersistenceFailed(other.to_string()),
    }
}

/// Error raised at a pipeline step, before it is recorded on the deposit
type StepError = (PipelineStep, IssuanceError);

pub struct IssuanceOrchestrator {
    config: PipelineConfig,
    normalizer: AmountNormalizer,
    verifier: WebhookVerifier,
    ledger: Arc<dyn LedgerClient>,
    audit: Arc<dyn AuditLog>,
    store: Arc<dyn TransactionStore>,
    payout: Arc<dyn PayoutGateway>,
    /// Age after which a PENDING deposit may be taken over by a forced resume
    stale_claim_after: chrono::Duration,
}

impl IssuanceOrchestrator {
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<dyn LedgerClient>,
        audit: Arc<dyn AuditLog>,
        store: Arc<dyn TransactionStore>,
    ) -> Result<Self> {
        let normalizer = AmountNormalizer::new(config.token_decimals)?;
        let verifier = WebhookVerifier::new(config.webhook_secret.expose());
        let stale_claim_after =
            chrono::Duration::from_std(std::time::Duration::from_secs(config.stale_claim_secs))
                .map_err(|e| IssuanceError::Config(format!("stale claim window: {}", e)))?;

        Ok(Self {
            stale_claim_after,
            config,
            normalizer,
            verifier,
            ledger,
            audit,
            store,
            payout: Arc::new(UnimplementedPayout),
        })
    }

    pub fn with_payout(mut self, payout: Arc<dyn PayoutGateway>) -> Self {
        self.payout = payout;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Authenticates a raw PSP callback body and runs the deposit pipeline.
    /// Nothing is parsed, stored or submitted before the signature checks out.
    pub async fn handle_deposit_callback(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<DepositOutcome> {
        if let Err(err) = self.verifier.verify(body, signature) {
            WEBHOOK_REJECTIONS.with_label_values(&["signature"]).inc();
            return Err(err);
        }

        let callback: DepositCallback = serde_json::from_slice(body).map_err(|e| {
            WEBHOOK_REJECTIONS.with_label_values(&["malformed"]).inc();
            body_error(format!("malformed deposit callback: {}", e))
        })?;

        self.process_deposit(callback).await
    }

    /// Runs the deposit pipeline for an authenticated callback
    pub async fn process_deposit(&self, callback: DepositCallback) -> Result<DepositOutcome> {
        callback.validate()?;
        self.ensure_currency(&callback.fiat_currency)?;
        let amount_smallest = self.normalize(callback.amount_float)?;

        info!(
            "Deposit {} received: {} {} -> {} units for {}",
            callback.deposit_id,
            callback.amount_float,
            callback.fiat_currency,
            amount_smallest,
            callback.user_account_id
        );

        let claim = self
            .store
            .claim_deposit(NewDeposit {
                deposit_id: callback.deposit_id.clone(),
                user_account_id: callback.user_account_id.clone(),
                amount_float: callback.amount_float.value(),
                amount_smallest,
                fiat_currency: callback.fiat_currency.to_uppercase(),
            })
            .await
            .map_err(persistence)?;

        match claim {
            DepositClaim::Claimed(deposit) => {
                self.run_deposit(deposit).await.map(DepositOutcome::Completed)
            }
            DepositClaim::Existing(existing) => self.redelivered(existing, amount_smallest),
        }
    }

    /// Answers a callback for a deposit this service has already seen
    fn redelivered(&self, existing: Deposit, amount_smallest: u64) -> Result<DepositOutcome> {
        if existing.amount_smallest != amount_smallest {
            warn!(
                "Redelivery of deposit {} carries {} units, stored record has {}; keeping the stored amount",
                existing.deposit_id, amount_smallest, existing.amount_smallest
            );
        }

        match existing.status {
            DepositStatus::Completed => {
                let result = existing.minted_tx.ok_or_else(|| {
                    IssuanceError::Internal(format!(
                        "completed deposit {} has no stored result",
                        existing.deposit_id
                    ))
                })?;
                info!("Deposit {} already completed; replaying stored result", existing.deposit_id);
                PIPELINE_RUNS.with_label_values(&["deposit", "replayed"]).inc();
                Ok(DepositOutcome::Replayed(result))
            }
            DepositStatus::Pending => {
                info!("Deposit {} is already being processed", existing.deposit_id);
                PIPELINE_RUNS.with_label_values(&["deposit", "in_progress"]).inc();
                Ok(DepositOutcome::InProgress {
                    deposit_id: existing.deposit_id,
                })
            }
            DepositStatus::Failed => {
                let step = existing.failed_step.unwrap_or(PipelineStep::Mint);
                warn!(
                    "Deposit {} previously failed at {}; awaiting operator resume",
                    existing.deposit_id, step
                );
                Err(IssuanceError::DepositFailed {
                    deposit_id: existing.deposit_id,
                    step,
                })
            }
        }
    }

    /// Operator reconciliation: reclaims a deposit and continues from its last
    /// recorded step. Steps with a stored receipt are never repeated.
    ///
    /// A FAILED deposit is reclaimed directly. A PENDING one is only taken over
    /// with `force` once its claim is older than the stale-claim window. Receipts
    /// the operator confirmed on the ledger are recorded before the run continues.
    /// Without a mint receipt the mint is only submitted again on `confirm_remint`.
    pub async fn resume_deposit(
        &self,
        deposit_id: &str,
        request: ResumeRequest,
    ) -> Result<DepositResult> {
        let snapshot = self.get_deposit(deposit_id).await?;
        match snapshot.status {
            DepositStatus::Completed => {
                return Err(IssuanceError::InvalidState(format!(
                    "deposit {} is already COMPLETED",
                    deposit_id
                )))
            }
            DepositStatus::Pending if !request.force => {
                return Err(IssuanceError::InvalidState(format!(
                    "deposit {} is PENDING; set force to take over a stale claim",
                    deposit_id
                )))
            }
            _ => {}
        }
        check_supplied_receipts(&snapshot, &request)?;

        if snapshot.mint_receipt.is_none() && request.mint_receipt.is_none() && !request.confirm_remint {
            return Err(IssuanceError::InvalidState(format!(
                "deposit {} has no recorded mint receipt; supply mintReceipt from the ledger or set confirmRemint",
                deposit_id
            )));
        }

        let stale_before = request.force.then(|| Utc::now() - self.stale_claim_after);
        let mut deposit = self
            .store
            .reclaim_deposit(deposit_id, stale_before)
            .await
            .map_err(persistence)?
            .ok_or_else(|| {
                IssuanceError::InvalidState(format!(
                    "deposit {} could not be reclaimed; its claim is still live or it changed state",
                    deposit_id
                ))
            })?;

        if adopt_receipts(&mut deposit, request.mint_receipt, request.transfer_receipt) {
            info!(
                deposit_id,
                stage = %deposit.stage,
                mint_receipt = ?deposit.mint_receipt,
                transfer_receipt = ?deposit.transfer_receipt,
                "Recording operator-confirmed ledger receipts"
            );
            let progress = deposit.progress();
            if let Err((step, err)) = self.checkpoint(deposit_id, &progress).await {
                return Err(self.abort_deposit(&deposit, step, &progress, err).await);
            }
        }

        if deposit.mint_receipt.is_none() {
            warn!(
                "Resuming deposit {} with no recorded mint receipt; operator confirmed a new mint",
                deposit_id
            );
        } else {
            info!("Resuming deposit {} from stage {}", deposit_id, deposit.stage);
        }

        self.run_deposit(deposit).await
    }

    pub async fn get_deposit(&self, deposit_id: &str) -> Result<Deposit> {
        self.store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| IssuanceError::DepositNotFound(deposit_id.to_string()))
    }

    async fn run_deposit(&self, deposit: Deposit) -> Result<DepositResult> {
        let started = Instant::now();
        let mut progress = deposit.progress();

        let outcome = self.advance_deposit(&deposit, &mut progress).await;
        PIPELINE_DURATION
            .with_label_values(&["deposit"])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                PIPELINE_RUNS.with_label_values(&["deposit", "completed"]).inc();
                info!(
                    "Deposit {} completed: {} units delivered to {}, audit seq {}",
                    deposit.deposit_id,
                    deposit.amount_smallest,
                    deposit.user_account_id,
                    result.hcs.seq
                );
                Ok(result)
            }
            Err((step, err)) => Err(self.abort_deposit(&deposit, step, &progress, err).await),
        }
    }

    async fn advance_deposit(
        &self,
        deposit: &Deposit,
        progress: &mut DepositProgress,
    ) -> std::result::Result<DepositResult, StepError> {
        let id = deposit.deposit_id.as_str();

        let mint_receipt = match progress.mint_receipt.clone() {
            Some(receipt) => receipt,
            None => {
                let receipt = self
                    .mint(deposit.amount_smallest)
                    .await
                    .map_err(|e| (PipelineStep::Mint, e))?;
                info!("Deposit {}: minted {} units ({})", id, deposit.amount_smallest, receipt.transaction_id);

                progress.mint_receipt = Some(receipt.clone());
                progress.stage = PipelineStage::Minted;
                self.checkpoint(id, progress).await?;
                receipt
            }
        };

        let transfer_receipt = match progress.transfer_receipt.clone() {
            Some(receipt) => receipt,
            None => {
                let receipt = self
                    .transfer(&deposit.user_account_id, deposit.amount_smallest)
                    .await
                    .map_err(|e| (PipelineStep::Transfer, e))?;
                info!(
                    "Deposit {}: transferred {} units to {} ({})",
                    id, deposit.amount_smallest, deposit.user_account_id, receipt.transaction_id
                );

                progress.transfer_receipt = Some(receipt.clone());
                progress.stage = PipelineStage::Transferred;
                self.checkpoint(id, progress).await?;
                receipt
            }
        };

        let (hcs, audit_payload) = match progress.hcs.clone() {
            // Logged by an earlier run; the exact message lives on the audit topic.
            Some(ack) => (ack, None),
            None => {
                let event = AuditEvent::Mint {
                    deposit_hash: identity_hash(id),
                    token_id: self.config.token_id.clone(),
                    amount_smallest: deposit.amount_smallest,
                    timestamp: audit_timestamp(),
                };
                let payload = serde_json::to_string(&event)
                    .map_err(|e| (PipelineStep::Log, IssuanceError::from(e)))?;
                let ack = self.submit_payload(&payload).await.map_err(|e| (PipelineStep::Log, e))?;
                info!("Deposit {}: MINT event logged at seq {}", id, ack.seq);

                progress.hcs = Some(ack.clone());
                progress.stage = PipelineStage::Logged;
                self.checkpoint(id, progress).await?;
                (ack, Some(payload))
            }
        };

        let tx = Tx {
            id: Uuid::new_v4(),
            tx_type: TxType::Mint,
            reference: id.to_string(),
            token_id: self.config.token_id.clone(),
            amount_smallest: deposit.amount_smallest,
            from: self.config.treasury_account.clone(),
            to: deposit.user_account_id.clone(),
            hedera_receipt: json!({ "mint": mint_receipt, "transfer": transfer_receipt }),
            hcs_seq: Some(hcs.seq),
            audit_payload,
            created_at: Utc::now(),
        };
        self.store
            .insert_tx(tx)
            .await
            .map_err(|e| (PipelineStep::Persist, persistence(e)))?;

        let result = DepositResult {
            mint_receipt,
            transfer_receipt,
            hcs,
        };
        self.store
            .complete_deposit(id, result.clone())
            .await
            .map_err(|e| (PipelineStep::Persist, persistence(e)))?;

        Ok(result)
    }

    async fn checkpoint(
        &self,
        deposit_id: &str,
        progress: &DepositProgress,
    ) -> std::result::Result<(), StepError> {
        self.store
            .record_deposit_progress(deposit_id, progress.clone())
            .await
            .map_err(|e| (PipelineStep::Persist, persistence(e)))
    }

    /// Records the halted run on the deposit and returns the error to surface
    async fn abort_deposit(
        &self,
        deposit: &Deposit,
        step: PipelineStep,
        progress: &DepositProgress,
        err: IssuanceError,
    ) -> IssuanceError {
        PIPELINE_RUNS.with_label_values(&["deposit", "failed"]).inc();
        error!(
            deposit_id = %deposit.deposit_id,
            step = %step,
            stage = %progress.stage,
            amount_smallest = deposit.amount_smallest,
            mint_receipt = ?progress.mint_receipt,
            transfer_receipt = ?progress.transfer_receipt,
            hcs = ?progress.hcs,
            error = %err,
            "Deposit pipeline halted"
        );

        if let Err(store_err) = self
            .store
            .fail_deposit(&deposit.deposit_id, step, err.to_string(), progress.clone())
            .await
        {
            error!(
                deposit_id = %deposit.deposit_id,
                step = %step,
                mint_receipt = ?progress.mint_receipt,
                transfer_receipt = ?progress.transfer_receipt,
                hcs = ?progress.hcs,
                error = %store_err,
                "Could not record deposit failure; record stays PENDING and needs manual reconciliation"
            );
        }

        err
    }

    /// Burns redeemed tokens from the treasury, logs the BURN event, records the
    /// Tx and hands the fiat leg to the payout gateway. The redeem id is claimed
    /// before the burn; a repeat of a completed redeem replays its result.
    pub async fn process_redeem(&self, request: RedeemRequest) -> Result<RedeemOutcome> {
        request.validate()?;
        let amount_smallest = self.normalize(request.amount_float)?;
        let redeem_id = request
            .redeem_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started = Instant::now();

        info!(
            "Redeem {} received: {} -> {} units for {}",
            redeem_id, request.amount_float, amount_smallest, request.user_account_id
        );

        let claim = self
            .store
            .claim_redeem(NewRedeem {
                redeem_id: redeem_id.clone(),
                user_account_id: request.user_account_id.clone(),
                amount_smallest,
            })
            .await
            .map_err(persistence)?;
        if let RedeemClaim::Existing(existing) = claim {
            return repeated_redeem(existing, &request.user_account_id, amount_smallest);
        }

        let burn_receipt = match self.burn(amount_smallest).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.halt("redeem", &redeem_id, PipelineStep::Burn, None, &e);
                self.record_redeem_failure(&redeem_id, PipelineStep::Burn, &e, None)
                    .await;
                return Err(e);
            }
        };
        info!("Redeem {}: burned {} units ({})", redeem_id, amount_smallest, burn_receipt.transaction_id);

        let event = AuditEvent::Burn {
            user_hash: identity_hash(&request.user_account_id),
            token_id: self.config.token_id.clone(),
            amount_smallest,
            payout_details: request.payout_details.clone(),
            timestamp: audit_timestamp(),
        };
        let tx = self.pending_tx(
            TxType::Burn,
            &redeem_id,
            amount_smallest,
            &request.user_account_id,
            &self.config.treasury_account,
            json!({ "burn": burn_receipt }),
        );
        let hcs = match self
            .log_and_record("redeem", &redeem_id, &burn_receipt, &event, tx)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                let step = match e {
                    IssuanceError::AuditLogFailed(_) => PipelineStep::Log,
                    _ => PipelineStep::Persist,
                };
                self.record_redeem_failure(&redeem_id, step, &e, Some(&burn_receipt))
                    .await;
                return Err(e);
            }
        };

        let payout = match self
            .payout
            .initiate_payout(PayoutRequest {
                redeem_id: redeem_id.clone(),
                user_account_id: request.user_account_id.clone(),
                amount_smallest,
                fiat_currency: self.config.fiat_currency.clone(),
                payout_details: request.payout_details,
            })
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!("Redeem {}: payout could not be initiated: {}", redeem_id, e);
                PayoutStatus::Failed
            }
        };

        let result = RedeemResult {
            redeem_id,
            burn_receipt,
            hcs,
            payout,
        };
        if let Err(e) = self
            .store
            .complete_redeem(&result.redeem_id, result.clone())
            .await
        {
            error!(
                redeem_id = %result.redeem_id,
                burn_receipt = ?result.burn_receipt,
                hcs = ?result.hcs,
                error = %e,
                "Redeem finished but its record stays PENDING; repeats of this redeem id are refused"
            );
        }

        PIPELINE_DURATION
            .with_label_values(&["redeem"])
            .observe(started.elapsed().as_secs_f64());
        PIPELINE_RUNS.with_label_values(&["redeem", "completed"]).inc();

        Ok(RedeemOutcome::Completed(result))
    }

    async fn record_redeem_failure(
        &self,
        redeem_id: &str,
        step: PipelineStep,
        err: &IssuanceError,
        burn_receipt: Option<&LedgerReceipt>,
    ) {
        if let Err(store_err) = self
            .store
            .fail_redeem(redeem_id, step, err.to_string(), burn_receipt.cloned())
            .await
        {
            error!(
                redeem_id,
                step = %step,
                burn_receipt = ?burn_receipt,
                error = %store_err,
                "Could not record redeem failure; record stays PENDING"
            );
        }
    }

    /// Treasury-to-account transfer without a preceding mint
    pub async fn process_transfer(&self, request: TransferRequest) -> Result<TransferResult> {
        request.validate()?;
        let amount_smallest = self.normalize(request.amount_float)?;
        let transfer_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        info!(
            "Transfer {} received: {} units to {}",
            transfer_id, amount_smallest, request.to_account_id
        );

        let transfer_receipt = self
            .transfer(&request.to_account_id, amount_smallest)
            .await
            .map_err(|e| {
                self.halt("transfer", &transfer_id, PipelineStep::Transfer, None, &e);
                e
            })?;

        let event = AuditEvent::Transfer {
            account_hash: identity_hash(&request.to_account_id),
            token_id: self.config.token_id.clone(),
            amount_smallest,
            timestamp: audit_timestamp(),
        };
        let tx = self.pending_tx(
            TxType::Transfer,
            &transfer_id,
            amount_smallest,
            &self.config.treasury_account,
            &request.to_account_id,
            json!({ "transfer": transfer_receipt }),
        );
        let hcs = self
            .log_and_record("transfer", &transfer_id, &transfer_receipt, &event, tx)
            .await?;

        PIPELINE_DURATION
            .with_label_values(&["transfer"])
            .observe(started.elapsed().as_secs_f64());
        PIPELINE_RUNS.with_label_values(&["transfer", "completed"]).inc();

        Ok(TransferResult {
            transfer_receipt,
            hcs,
        })
    }

    fn pending_tx(
        &self,
        tx_type: TxType,
        reference: &str,
        amount_smallest: u64,
        from: &str,
        to: &str,
        hedera_receipt: serde_json::Value,
    ) -> Tx {
        Tx {
            id: Uuid::new_v4(),
            tx_type,
            reference: reference.to_string(),
            token_id: self.config.token_id.clone(),
            amount_smallest,
            from: from.to_string(),
            to: to.to_string(),
            hedera_receipt,
            hcs_seq: None,
            audit_payload: None,
            created_at: Utc::now(),
        }
    }

    /// Appends the audit event for a committed ledger action and records its Tx.
    ///
    /// When the append fails the Tx is still written, without a sequence and
    /// with the exact payload, so `relog_pending_audits` can resubmit it.
    async fn log_and_record(
        &self,
        flow: &str,
        reference: &str,
        receipt: &LedgerReceipt,
        event: &AuditEvent,
        mut tx: Tx,
    ) -> Result<AuditAck> {
        let payload = serde_json::to_string(event)?;
        tx.audit_payload = Some(payload.clone());

        let ack = match self.submit_payload(&payload).await {
            Ok(ack) => ack,
            Err(err) => {
                self.halt(flow, reference, PipelineStep::Log, Some(receipt), &err);
                if let Err(store_err) = self.store.insert_tx(tx).await {
                    error!(
                        flow,
                        reference,
                        receipt = ?receipt,
                        error = %store_err,
                        "Unlogged Tx could not be stored; ledger action is recorded only in this log"
                    );
                }
                return Err(err);
            }
        };
        info!("{} {}: {} event logged at seq {}", flow, reference, event_name(event), ack.seq);

        tx.hcs_seq = Some(ack.seq);
        if let Err(err) = self.store.insert_tx(tx).await {
            let err = persistence(err);
            self.halt(flow, reference, PipelineStep::Persist, Some(receipt), &err);
            error!(flow, reference, hcs = ?ack, "Audit event was logged but its Tx was not stored");
            return Err(err);
        }

        Ok(ack)
    }

    fn halt(
        &self,
        flow: &str,
        reference: &str,
        step: PipelineStep,
        receipt: Option<&LedgerReceipt>,
        err: &IssuanceError,
    ) {
        PIPELINE_RUNS.with_label_values(&[flow, "failed"]).inc();
        error!(
            flow,
            reference,
            step = %step,
            receipt = ?receipt,
            error = %err,
            "Pipeline halted"
        );
    }

    /// Resubmits the stored audit payload of every Tx that has no log sequence,
    /// byte for byte. Stops at the first failed append so messages keep their
    /// original order.
    pub async fn relog_pending_audits(&self, limit: i64) -> Result<RelogReport> {
        let pending = self.store.list_unlogged_txs(limit).await?;
        let total = pending.len();
        let mut relogged = 0;

        for tx in pending {
            let Some(payload) = tx.audit_payload.as_deref() else {
                error!(
                    tx_id = %tx.id,
                    tx_type = %tx.tx_type,
                    reference = %tx.reference,
                    "Unlogged Tx has no stored audit payload, stopping"
                );
                break;
            };
            match self
                .audit
                .submit(self.config.audit_topic_id.clone(), payload.as_bytes().to_vec())
                .await
            {
                Ok(ack) => {
                    AUDIT_SUBMISSIONS.with_label_values(&["relogged"]).inc();
                    self.store
                        .mark_tx_logged(tx.id, ack.seq)
                        .await
                        .map_err(persistence)?;
                    info!("Re-logged {} Tx {} at seq {}", tx.tx_type, tx.reference, ack.seq);
                    relogged += 1;
                }
                Err(e) => {
                    AUDIT_SUBMISSIONS.with_label_values(&["failed"]).inc();
                    warn!("Re-log of {} Tx {} failed, stopping: {}", tx.tx_type, tx.reference, e);
                    break;
                }
            }
        }

        Ok(RelogReport {
            relogged,
            pending: total - relogged,
        })
    }

    pub async fn create_topic(&self, memo: &str) -> Result<String> {
        let topic_id = self.audit.create_topic(memo.to_string()).await?;
        info!("Created audit topic {}", topic_id);
        Ok(topic_id)
    }

    /// Creates the fiat-backed token with the configured decimals, treasury and supply key
    pub async fn create_token(&self, request: CreateTokenRequest) -> Result<String> {
        request.validate()?;

        let token_id = self
            .ledger
            .create_token(TokenCreate {
                name: request.name,
                symbol: request.symbol,
                decimals: self.normalizer.decimals(),
                treasury_account: self.config.treasury_account.clone(),
                treasury_key: self.config.treasury_key.clone(),
                supply_key: self.config.supply_key.clone(),
            })
            .await?;

        info!("Created token {}", token_id);
        Ok(token_id)
    }

    fn ensure_currency(&self, currency: &str) -> Result<()> {
        if currency.eq_ignore_ascii_case(&self.config.fiat_currency) {
            Ok(())
        } else {
            Err(IssuanceError::UnsupportedCurrency(format!(
                "{} (token is backed by {})",
                currency, self.config.fiat_currency
            )))
        }
    }

    fn normalize(&self, amount: FiatAmount) -> Result<u64> {
        let units = self.normalizer.to_smallest_unit(amount)?;
        if units == 0 {
            return Err(IssuanceError::InvalidAmount(
                "amount must be greater than zero".to_string(),
            ));
        }
        Ok(units)
    }

    async fn submit_payload(&self, payload: &str) -> Result<AuditAck> {
        match self
            .audit
            .submit(self.config.audit_topic_id.clone(), payload.as_bytes().to_vec())
            .await
        {
            Ok(ack) => {
                AUDIT_SUBMISSIONS.with_label_values(&["ok"]).inc();
                Ok(ack)
            }
            Err(e) => {
                AUDIT_SUBMISSIONS.with_label_values(&["failed"]).inc();
                Err(match e {
                    IssuanceError::AuditLogFailed(_) => e,
                    other => IssuanceError::AuditLogFailed(other.to_string()),
                })
            }
        }
    }

    async fn mint(&self, amount: u64) -> Result<LedgerReceipt> {
        let result = self
            .ledger
            .mint(TokenMint {
                token_id: self.config.token_id.clone(),
                amount,
                supply_key: self.config.supply_key.clone(),
            })
            .await;
        committed(LedgerOperation::Mint, result)
    }

    async fn transfer(&self, to_account: &str, amount: u64) -> Result<LedgerReceipt> {
        let result = self
            .ledger
            .transfer(TokenTransfer {
                token_id: self.config.token_id.clone(),
                from_account: self.config.treasury_account.clone(),
                from_key: self.config.treasury_key.clone(),
                to_account: to_account.to_string(),
                amount,
            })
            .await;
        committed(LedgerOperation::Transfer, result)
    }

    async fn burn(&self, amount: u64) -> Result<LedgerReceipt> {
        let result = self
            .ledger
            .burn(TokenBurn {
                token_id: self.config.token_id.clone(),
                amount,
                supply_key: self.config.supply_key.clone(),
            })
            .await;
        committed(LedgerOperation::Burn, result)
    }
}

/// Rejects operator-supplied receipts that are unsuccessful, already recorded
/// or out of pipeline order
fn check_supplied_receipts(deposit: &Deposit, request: &ResumeRequest) -> Result<()> {
    for (name, supplied, stored) in [
        ("mintReceipt", &request.mint_receipt, &deposit.mint_receipt),
        ("transferReceipt", &request.transfer_receipt, &deposit.transfer_receipt),
    ] {
        if let Some(receipt) = supplied {
            if !receipt.is_success() {
                return Err(IssuanceError::Validation(format!(
                    "{} reports status {}, only committed receipts can be recorded",
                    name, receipt.status
                )));
            }
            if stored.is_some() {
                return Err(IssuanceError::Validation(format!(
                    "deposit {} already has a recorded {}",
                    deposit.deposit_id, name
                )));
            }
        }
    }

    let mint_known = deposit.mint_receipt.is_some() || request.mint_receipt.is_some();
    if request.transfer_receipt.is_some() && !mint_known {
        return Err(IssuanceError::Validation(
            "transferReceipt requires a recorded or supplied mintReceipt".to_string(),
        ));
    }
    Ok(())
}

/// Fills receipts the deposit has no record of. Returns whether anything changed.
fn adopt_receipts(
    deposit: &mut Deposit,
    mint_receipt: Option<LedgerReceipt>,
    transfer_receipt: Option<LedgerReceipt>,
) -> bool {
    let mut adopted = false;
    if deposit.mint_receipt.is_none() {
        if let Some(receipt) = mint_receipt {
            deposit.mint_receipt = Some(receipt);
            deposit.stage = deposit.stage.max(PipelineStage::Minted);
            adopted = true;
        }
    }
    if deposit.transfer_receipt.is_none() {
        if let Some(receipt) = transfer_receipt {
            deposit.transfer_receipt = Some(receipt);
            deposit.stage = deposit.stage.max(PipelineStage::Transferred);
            adopted = true;
        }
    }
    adopted
}

/// Answers a redeem whose id was already claimed
fn repeated_redeem(existing: Redeem, user_account_id: &str, amount_smallest: u64) -> Result<RedeemOutcome> {
    if existing.user_account_id != user_account_id || existing.amount_smallest != amount_smallest {
        return Err(IssuanceError::InvalidState(format!(
            "redeem {} was already used for a different account or amount",
            existing.redeem_id
        )));
    }

    match existing.status {
        RedeemStatus::Completed => {
            let result = existing.result.ok_or_else(|| {
                IssuanceError::Internal(format!(
                    "completed redeem {} has no stored result",
                    existing.redeem_id
                ))
            })?;
            info!("Redeem {} already completed; replaying stored result", existing.redeem_id);
            PIPELINE_RUNS.with_label_values(&["redeem", "replayed"]).inc();
            Ok(RedeemOutcome::Replayed(result))
        }
        RedeemStatus::Pending => Err(IssuanceError::InvalidState(format!(
            "redeem {} is already being processed",
            existing.redeem_id
        ))),
        RedeemStatus::Failed => {
            let step = existing.failed_step.unwrap_or(PipelineStep::Burn);
            warn!(
                redeem_id = %existing.redeem_id,
                step = %step,
                burn_receipt = ?existing.burn_receipt,
                "Repeat of a failed redeem refused"
            );
            Err(IssuanceError::InvalidState(format!(
                "redeem {} failed at {}; reconcile it and submit a new redeemId",
                existing.redeem_id, step
            )))
        }
    }
}

/// Accepts a ledger result only when its receipt reports success
fn committed(operation: LedgerOperation, result: Result<LedgerReceipt>) -> Result<LedgerReceipt> {
    let op = operation.to_string();

    match result {
        Ok(receipt) if receipt.is_success() => {
            LEDGER_OPERATIONS
                .with_label_values(&[op.as_str(), receipt.status.as_str()])
                .inc();
            Ok(receipt)
        }
        Ok(receipt) => {
            LEDGER_OPERATIONS
                .with_label_values(&[op.as_str(), receipt.status.as_str()])
                .inc();
            Err(IssuanceError::LedgerOperationFailed {
                operation,
                reason: format!("receipt status {}", receipt.status),
                receipt: Some(Box::new(receipt)),
            })
        }
        Err(IssuanceError::LedgerOperationFailed {
            operation: failed,
            reason,
            receipt,
        }) => {
            LEDGER_OPERATIONS.with_label_values(&[op.as_str(), "error"]).inc();
            Err(IssuanceError::LedgerOperationFailed {
                operation: failed,
                reason,
                receipt,
            })
        }
        Err(other) => {
            LEDGER_OPERATIONS.with_label_values(&[op.as_str(), "error"]).inc();
            Err(IssuanceError::ledger(operation, other.to_string()))
        }
    }
}

fn event_name(event: &AuditEvent) -> &'static str {
    match event {
        AuditEvent::Mint { .. } => "MINT",
        AuditEvent::Burn { .. } => "BURN",
        AuditEvent::Transfer { .. } => "TRANSFER",
    }
}
