//! Append-only audit topic client.

pub mod memory;
pub mod nats;

use crate::errors::Result;
use crate::models::AuditAck;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

#[cfg(test)]
use mockall::automock;

pub use memory::MemoryAuditLog;
pub use nats::NatsAuditLog;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Creates a new topic and returns its identifier
    async fn create_topic(&self, memo: String) -> Result<String>;

    /// Appends one message; sequence numbers increase monotonically per topic
    async fn submit(&self, topic_id: String, payload: Vec<u8>) -> Result<AuditAck>;
}

/// One-way identifier hash for public audit payloads, e.g. `sha256:9f86d0...`
pub fn identity_hash(value: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(value.as_bytes())))
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn audit_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hash_format() {
        assert_eq!(
            identity_hash("test"),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_identity_hash_hides_input() {
        let hash = identity_hash("psp-deposit-42");
        assert!(!hash.contains("psp-deposit-42"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_timestamp_is_utc_millis() {
        let ts = audit_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        // 2024-05-01T10:00:00.000Z
        assert_eq!(ts.len(), 24);
    }
}
