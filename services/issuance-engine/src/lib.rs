//! Fiat-backed token issuance service.
//!
//! Turns PSP deposit callbacks into mint + transfer operations on the token
//! ledger, redemptions into burns, and records every committed action on an
//! append-only audit topic and in the transaction store.

pub mod amount;
pub mod audit_log;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod payout;
pub mod security_middleware;

pub use config::{Config, PipelineConfig};
pub use errors::{IssuanceError, Result};
pub use orchestrator::IssuanceOrchestrator;

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name
pub const SERVICE_NAME: &str = "issuance-engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(SERVICE_NAME, "issuance-engine");
    }
}
