use crate::amount::FiatAmount;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Ledger receipt status for a committed operation.
pub const RECEIPT_SUCCESS: &str = "SUCCESS";

/// Deposit lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    Pending,
    Completed,
    Failed,
}

/// Redeem lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedeemStatus {
    Pending,
    Completed,
    Failed,
}

/// Furthest committed point of a deposit pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Received,
    Minted,
    Transferred,
    Logged,
    Persisted,
}

/// Step at which a pipeline halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStep {
    Mint,
    Transfer,
    Burn,
    Log,
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Mint,
    Transfer,
    Burn,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(DepositStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

text_enum!(RedeemStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

text_enum!(PipelineStage {
    Received => "RECEIVED",
    Minted => "MINTED",
    Transferred => "TRANSFERRED",
    Logged => "LOGGED",
    Persisted => "PERSISTED",
});

text_enum!(PipelineStep {
    Mint => "MINT",
    Transfer => "TRANSFER",
    Burn => "BURN",
    Log => "LOG",
    Persist => "PERSIST",
});

text_enum!(TxType {
    Mint => "MINT",
    Transfer => "TRANSFER",
    Burn => "BURN",
});

/// Confirmation record returned by the ledger network for a submitted operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub status: String,
    pub transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_total_supply: Option<u64>,
}

impl LedgerReceipt {
    pub fn is_success(&self) -> bool {
        self.status == RECEIPT_SUCCESS
    }
}

/// Sequence number assigned by the audit topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAck {
    pub topic_id: String,
    pub seq: u64,
}

/// One fiat-in event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub deposit_id: String,
    pub user_account_id: String,
    pub amount_float: Decimal,
    pub amount_smallest: u64,
    pub fiat_currency: String,
    pub status: DepositStatus,
    pub stage: PipelineStage,
    pub failed_step: Option<PipelineStep>,
    pub mint_receipt: Option<LedgerReceipt>,
    pub transfer_receipt: Option<LedgerReceipt>,
    pub hcs: Option<AuditAck>,
    pub minted_tx: Option<DepositResult>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn progress(&self) -> DepositProgress {
        DepositProgress {
            stage: self.stage,
            mint_receipt: self.mint_receipt.clone(),
            transfer_receipt: self.transfer_receipt.clone(),
            hcs: self.hcs.clone(),
        }
    }
}

/// Deposit fields known before any external call
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeposit {
    pub deposit_id: String,
    pub user_account_id: String,
    pub amount_float: Decimal,
    pub amount_smallest: u64,
    pub fiat_currency: String,
}

impl NewDeposit {
    pub fn into_pending(self, now: DateTime<Utc>) -> Deposit {
        Deposit {
            deposit_id: self.deposit_id,
            user_account_id: self.user_account_id,
            amount_float: self.amount_float,
            amount_smallest: self.amount_smallest,
            fiat_currency: self.fiat_currency,
            status: DepositStatus::Pending,
            stage: PipelineStage::Received,
            failed_step: None,
            mint_receipt: None,
            transfer_receipt: None,
            hcs: None,
            minted_tx: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Receipts and stage accumulated by a deposit pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct DepositProgress {
    pub stage: PipelineStage,
    pub mint_receipt: Option<LedgerReceipt>,
    pub transfer_receipt: Option<LedgerReceipt>,
    pub hcs: Option<AuditAck>,
}

/// Combined result of a completed deposit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResult {
    pub mint_receipt: LedgerReceipt,
    pub transfer_receipt: LedgerReceipt,
    pub hcs: AuditAck,
}

/// Outcome of one deposit callback delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DepositOutcome {
    Completed(DepositResult),
    /// Redelivery of a deposit that already completed; no ledger calls were made
    Replayed(DepositResult),
    /// Another delivery holds the claim on this deposit
    InProgress { deposit_id: String },
}

/// One committed ledger-affecting action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    /// Deposit id, redeem id or transfer id that produced this record
    pub reference: String,
    pub token_id: String,
    pub amount_smallest: u64,
    pub from: String,
    pub to: String,
    pub hedera_receipt: serde_json::Value,
    pub hcs_seq: Option<u64>,
    /// Exact audit message text, resubmitted unchanged when an append failed
    pub audit_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit topic message. Field names are consumed downstream and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    #[serde(rename = "MINT", rename_all = "camelCase")]
    Mint {
        deposit_hash: String,
        token_id: String,
        amount_smallest: u64,
        timestamp: String,
    },
    #[serde(rename = "BURN", rename_all = "camelCase")]
    Burn {
        user_hash: String,
        token_id: String,
        amount_smallest: u64,
        payout_details: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "TRANSFER", rename_all = "camelCase")]
    Transfer {
        account_hash: String,
        token_id: String,
        amount_smallest: u64,
        timestamp: String,
    },
}

/// PSP deposit notification
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DepositCallback {
    #[validate(length(min = 1, max = 128))]
    pub deposit_id: String,
    #[validate(length(min = 1, max = 64))]
    pub user_account_id: String,
    pub amount_float: FiatAmount,
    #[validate(length(min = 3, max = 4))]
    pub fiat_currency: String,
}

/// Fiat payout request backed by a token burn
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    #[validate(length(min = 1, max = 64))]
    pub user_account_id: String,
    pub amount_float: FiatAmount,
    #[serde(default)]
    pub payout_details: serde_json::Value,
    #[serde(default)]
    #[validate(length(min = 1, max = 128))]
    pub redeem_id: Option<String>,
}

/// Treasury-to-account transfer
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    #[validate(length(min = 1, max = 64))]
    pub to_account_id: String,
    pub amount_float: FiatAmount,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateTokenRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1, max = 16))]
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Submitted,
    NotSubmitted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResult {
    pub redeem_id: String,
    pub burn_receipt: LedgerReceipt,
    pub hcs: AuditAck,
    pub payout: PayoutStatus,
}

/// Outcome of one redeem request
#[derive(Debug, Clone, PartialEq)]
pub enum RedeemOutcome {
    Completed(RedeemResult),
    /// Repeat of a redeem id that already completed; nothing was burned
    Replayed(RedeemResult),
}

/// One fiat-out request, keyed by its redeem id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redeem {
    pub redeem_id: String,
    pub user_account_id: String,
    pub amount_smallest: u64,
    pub status: RedeemStatus,
    pub failed_step: Option<PipelineStep>,
    pub burn_receipt: Option<LedgerReceipt>,
    pub result: Option<RedeemResult>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRedeem {
    pub redeem_id: String,
    pub user_account_id: String,
    pub amount_smallest: u64,
}

impl NewRedeem {
    pub fn into_pending(self, now: DateTime<Utc>) -> Redeem {
        Redeem {
            redeem_id: self.redeem_id,
            user_account_id: self.user_account_id,
            amount_smallest: self.amount_smallest,
            status: RedeemStatus::Pending,
            failed_step: None,
            burn_receipt: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Operator options for resuming a deposit
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResumeRequest {
    /// Take over a PENDING claim older than the stale-claim window
    pub force: bool,
    /// Mint receipt confirmed on the ledger but never checkpointed
    pub mint_receipt: Option<LedgerReceipt>,
    /// Transfer receipt confirmed on the ledger but never checkpointed
    pub transfer_receipt: Option<LedgerReceipt>,
    /// Mint again although an earlier mint may have committed
    pub confirm_remint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferResult {
    pub transfer_receipt: LedgerReceipt,
    pub hcs: AuditAck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResponse {
    pub status: &'static str,
    pub mint_receipt: LedgerReceipt,
    pub transfer_receipt: LedgerReceipt,
    pub hcs: AuditAck,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub status: &'static str,
    pub redeem_id: String,
    pub burn_receipt: LedgerReceipt,
    pub hcs: AuditAck,
    pub payout: PayoutStatus,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub status: &'static str,
    pub transfer_receipt: LedgerReceipt,
    pub hcs: AuditAck,
}
