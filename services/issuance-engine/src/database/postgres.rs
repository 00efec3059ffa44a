use super::{DepositClaim, RedeemClaim, TransactionStore};
use crate::errors::{IssuanceError, Result};
use crate::models::{
    AuditAck, Deposit, DepositProgress, DepositResult, DepositStatus, LedgerReceipt, NewDeposit,
    NewRedeem, PipelineStage, PipelineStep, Redeem, RedeemResult, RedeemStatus, Tx, TxType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, Pool, Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

pub struct Database {
    pool: Pool<Postgres>,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the schema; every statement is idempotent
    pub async fn run_migrations(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        info!("Database schema is up to date");
        Ok(())
    }
}

fn to_db_units(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| IssuanceError::PersistenceFailed(format!("{} exceeds BIGINT", value)))
}

fn from_db_units(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| IssuanceError::Internal(format!("negative units {}", value)))
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(IssuanceError::Internal)
}

fn failed_step(row: &PgRow) -> Result<Option<PipelineStep>> {
    let failed_step: Option<String> = row.try_get("failed_step")?;
    failed_step
        .map(|s| s.parse::<PipelineStep>())
        .transpose()
        .map_err(IssuanceError::Internal)
}

fn deposit_from_row(row: &PgRow) -> Result<Deposit> {
    let failed_step = failed_step(row)?;

    let mint_receipt: Option<Json<LedgerReceipt>> = row.try_get("mint_receipt")?;
    let transfer_receipt: Option<Json<LedgerReceipt>> = row.try_get("transfer_receipt")?;
    let hcs: Option<Json<AuditAck>> = row.try_get("hcs")?;
    let minted_tx: Option<Json<DepositResult>> = row.try_get("minted_tx")?;

    Ok(Deposit {
        deposit_id: row.try_get("deposit_id")?,
        user_account_id: row.try_get("user_account_id")?,
        amount_float: row.try_get("amount_float")?,
        amount_smallest: from_db_units(row.try_get("amount_smallest")?)?,
        fiat_currency: row.try_get("fiat_currency")?,
        status: parse_column::<DepositStatus>(row, "status")?,
        stage: parse_column::<PipelineStage>(row, "stage")?,
        failed_step,
        mint_receipt: mint_receipt.map(|j| j.0),
        transfer_receipt: transfer_receipt.map(|j| j.0),
        hcs: hcs.map(|j| j.0),
        minted_tx: minted_tx.map(|j| j.0),
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn redeem_from_row(row: &PgRow) -> Result<Redeem> {
    let burn_receipt: Option<Json<LedgerReceipt>> = row.try_get("burn_receipt")?;
    let result: Option<Json<RedeemResult>> = row.try_get("result")?;

    Ok(Redeem {
        redeem_id: row.try_get("redeem_id")?,
        user_account_id: row.try_get("user_account_id")?,
        amount_smallest: from_db_units(row.try_get("amount_smallest")?)?,
        status: parse_column::<RedeemStatus>(row, "status")?,
        failed_step: failed_step(row)?,
        burn_receipt: burn_receipt.map(|j| j.0),
        result: result.map(|j| j.0),
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tx_from_row(row: &PgRow) -> Result<Tx> {
    let hcs_seq: Option<i64> = row.try_get("hcs_seq")?;

    Ok(Tx {
        id: row.try_get("id")?,
        tx_type: parse_column::<TxType>(row, "tx_type")?,
        reference: row.try_get("reference")?,
        token_id: row.try_get("token_id")?,
        amount_smallest: from_db_units(row.try_get("amount_smallest")?)?,
        from: row.try_get("from_account")?,
        to: row.try_get("to_account")?,
        hedera_receipt: row.try_get("hedera_receipt")?,
        hcs_seq: hcs_seq.map(from_db_units).transpose()?,
        audit_payload: row.try_get("audit_payload")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl TransactionStore for Database {
    async fn claim_deposit(&self, deposit: NewDeposit) -> Result<DepositClaim> {
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO deposits (
                deposit_id, user_account_id, amount_float, amount_smallest,
                fiat_currency, status, stage, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            ON CONFLICT (deposit_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&deposit.deposit_id)
        .bind(&deposit.user_account_id)
        .bind(deposit.amount_float)
        .bind(to_db_units(deposit.amount_smallest)?)
        .bind(&deposit.fiat_currency)
        .bind(DepositStatus::Pending.as_str())
        .bind(PipelineStage::Received.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(DepositClaim::Claimed(deposit_from_row(&row)?));
        }

        let existing = self.get_deposit(&deposit.deposit_id).await?.ok_or_else(|| {
            IssuanceError::Internal(format!(
                "deposit {} conflicted but could not be read",
                deposit.deposit_id
            ))
        })?;

        Ok(DepositClaim::Existing(existing))
    }

    async fn reclaim_deposit(
        &self,
        deposit_id: &str,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Deposit>> {
        let row = sqlx::query(
            r#"
            UPDATE deposits
            SET status = $2, failed_step = NULL, last_error = NULL, updated_at = $3
            WHERE deposit_id = $1
              AND (status = $4 OR (status = $2 AND $5::timestamptz IS NOT NULL AND updated_at <= $5))
            RETURNING *
            "#,
        )
        .bind(deposit_id)
        .bind(DepositStatus::Pending.as_str())
        .bind(Utc::now())
        .bind(DepositStatus::Failed.as_str())
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(deposit_from_row).transpose()
    }

    async fn get_deposit(&self, deposit_id: &str) -> Result<Option<Deposit>> {
        let row = sqlx::query("SELECT * FROM deposits WHERE deposit_id = $1")
            .bind(deposit_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(deposit_from_row).transpose()
    }

    async fn record_deposit_progress(&self, deposit_id: &str, progress: DepositProgress) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deposits
            SET stage = $2,
                mint_receipt = COALESCE($3, mint_receipt),
                transfer_receipt = COALESCE($4, transfer_receipt),
                hcs = COALESCE($5, hcs),
                updated_at = $6
            WHERE deposit_id = $1
            "#,
        )
        .bind(deposit_id)
        .bind(progress.stage.as_str())
        .bind(progress.mint_receipt.map(Json))
        .bind(progress.transfer_receipt.map(Json))
        .bind(progress.hcs.map(Json))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_deposit(
        &self,
        deposit_id: &str,
        step: PipelineStep,
        reason: String,
        progress: DepositProgress,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deposits
            SET status = $2,
                failed_step = $3,
                last_error = $4,
                stage = $5,
                mint_receipt = COALESCE($6, mint_receipt),
                transfer_receipt = COALESCE($7, transfer_receipt),
                hcs = COALESCE($8, hcs),
                updated_at = $9
            WHERE deposit_id = $1
            "#,
        )
        .bind(deposit_id)
        .bind(DepositStatus::Failed.as_str())
        .bind(step.as_str())
        .bind(reason)
        .bind(progress.stage.as_str())
        .bind(progress.mint_receipt.map(Json))
        .bind(progress.transfer_receipt.map(Json))
        .bind(progress.hcs.map(Json))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_deposit(&self, deposit_id: &str, result: DepositResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deposits
            SET status = $2, stage = $3, failed_step = NULL, last_error = NULL,
                minted_tx = $4, updated_at = $5
            WHERE deposit_id = $1
            "#,
        )
        .bind(deposit_id)
        .bind(DepositStatus::Completed.as_str())
        .bind(PipelineStage::Persisted.as_str())
        .bind(Json(result))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_redeem(&self, redeem: NewRedeem) -> Result<RedeemClaim> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO redeems (
                redeem_id, user_account_id, amount_smallest, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (redeem_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&redeem.redeem_id)
        .bind(&redeem.user_account_id)
        .bind(to_db_units(redeem.amount_smallest)?)
        .bind(RedeemStatus::Pending.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(RedeemClaim::Claimed(redeem_from_row(&row)?));
        }

        let row = sqlx::query("SELECT * FROM redeems WHERE redeem_id = $1")
            .bind(&redeem.redeem_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                IssuanceError::Internal(format!(
                    "redeem {} conflicted but could not be read",
                    redeem.redeem_id
                ))
            })?;

        Ok(RedeemClaim::Existing(redeem_from_row(&row)?))
    }

    async fn fail_redeem(
        &self,
        redeem_id: &str,
        step: PipelineStep,
        reason: String,
        burn_receipt: Option<LedgerReceipt>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE redeems
            SET status = $2, failed_step = $3, last_error = $4,
                burn_receipt = COALESCE($5, burn_receipt), updated_at = $6
            WHERE redeem_id = $1
            "#,
        )
        .bind(redeem_id)
        .bind(RedeemStatus::Failed.as_str())
        .bind(step.as_str())
        .bind(reason)
        .bind(burn_receipt.map(Json))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_redeem(&self, redeem_id: &str, result: RedeemResult) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE redeems
            SET status = $2, failed_step = NULL, last_error = NULL,
                burn_receipt = $3, result = $4, updated_at = $5
            WHERE redeem_id = $1
            "#,
        )
        .bind(redeem_id)
        .bind(RedeemStatus::Completed.as_str())
        .bind(Json(result.burn_receipt.clone()))
        .bind(Json(result))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_tx(&self, tx: Tx) -> Result<()> {
        let hcs_seq = tx.hcs_seq.map(to_db_units).transpose()?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO txs (
                id, tx_type, reference, token_id, amount_smallest, from_account,
                to_account, hedera_receipt, hcs_seq, audit_payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tx_type, reference) DO NOTHING
            "#,
        )
        .bind(tx.id)
        .bind(tx.tx_type.as_str())
        .bind(&tx.reference)
        .bind(&tx.token_id)
        .bind(to_db_units(tx.amount_smallest)?)
        .bind(&tx.from)
        .bind(&tx.to)
        .bind(&tx.hedera_receipt)
        .bind(hcs_seq)
        .bind(&tx.audit_payload)
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            warn!(
                tx_type = %tx.tx_type,
                reference = %tx.reference,
                "Tx already recorded for reference, insert skipped"
            );
        }

        Ok(())
    }

    async fn list_unlogged_txs(&self, limit: i64) -> Result<Vec<Tx>> {
        let rows = sqlx::query(
            "SELECT * FROM txs WHERE hcs_seq IS NULL ORDER BY created_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tx_from_row).collect()
    }

    async fn mark_tx_logged(&self, tx_id: Uuid, seq: u64) -> Result<()> {
        sqlx::query("UPDATE txs SET hcs_seq = $2 WHERE id = $1 AND hcs_seq IS NULL")
            .bind(tx_id)
            .bind(to_db_units(seq)?)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion_bounds() {
        assert_eq!(to_db_units(1234).unwrap(), 1234);
        assert!(to_db_units(u64::MAX).is_err());
        assert!(from_db_units(-1).is_err());
    }

    #[test]
    fn test_schema_declares_idempotency_keys() {
        let deposit_key = SCHEMA
            .lines()
            .find(|line| line.trim_start().starts_with("deposit_id"))
            .unwrap();
        assert!(deposit_key.contains("PRIMARY KEY"));
        assert!(SCHEMA.contains("UNIQUE (tx_type, reference)"));
        let redeem_key = SCHEMA
            .lines()
            .find(|line| line.trim_start().starts_with("redeem_id"))
            .unwrap();
        assert!(redeem_key.contains("PRIMARY KEY"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_claim_is_insert_if_absent() {
        // Requires DATABASE_URL pointing at a scratch Postgres database
        let url = std::env::var("DATABASE_URL").unwrap();
        let db = Database::new(&url, 2).await.unwrap();
        db.run_migrations().await.unwrap();

        let deposit = NewDeposit {
            deposit_id: Uuid::new_v4().to_string(),
            user_account_id: "0.0.4821".to_string(),
            amount_float: rust_decimal::Decimal::new(1234, 2),
            amount_smallest: 1234,
            fiat_currency: "NGN".to_string(),
        };

        assert!(matches!(
            db.claim_deposit(deposit.clone()).await.unwrap(),
            DepositClaim::Claimed(_)
        ));
        assert!(matches!(
            db.claim_deposit(deposit).await.unwrap(),
            DepositClaim::Existing(_)
        ));
    }
}
