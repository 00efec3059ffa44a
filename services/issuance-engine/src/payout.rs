//! Fiat payout seam for redemptions. No payment provider is integrated yet;
//! the default gateway records that a payout is owed and submits nothing.

use crate::errors::Result;
use crate::models::PayoutStatus;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Fiat disbursement owed after a committed burn
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub redeem_id: String,
    pub user_account_id: String,
    pub amount_smallest: u64,
    pub fiat_currency: String,
    pub payout_details: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayoutGateway: Send + Sync {
    async fn initiate_payout(&self, request: PayoutRequest) -> Result<PayoutStatus>;
}

/// Placeholder gateway: logs the owed payout and reports it as not submitted
#[derive(Debug, Default, Clone)]
pub struct UnimplementedPayout;

#[async_trait]
impl PayoutGateway for UnimplementedPayout {
    async fn initiate_payout(&self, request: PayoutRequest) -> Result<PayoutStatus> {
        warn!(
            redeem_id = %request.redeem_id,
            amount_smallest = request.amount_smallest,
            currency = %request.fiat_currency,
            "No payout provider configured; fiat payout must be settled manually"
        );
        Ok(PayoutStatus::NotSubmitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_placeholder_never_submits() {
        let status = UnimplementedPayout
            .initiate_payout(PayoutRequest {
                redeem_id: "redeem-1".to_string(),
                user_account_id: "0.0.4821".to_string(),
                amount_smallest: 500,
                fiat_currency: "NGN".to_string(),
                payout_details: json!({ "bank": "058" }),
            })
            .await
            .unwrap();

        assert_eq!(status, PayoutStatus::NotSubmitted);
    }
}
