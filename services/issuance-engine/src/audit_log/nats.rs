// Audit topics on NATS JetStream. Each topic is a stream that denies deletes
// and purges; the stream sequence from the publish ack is the topic sequence.

use super::AuditLog;
use crate::errors::{IssuanceError, Result};
use crate::models::AuditAck;
use async_nats::jetstream;
use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

pub struct NatsAuditLog {
    jetstream: jetstream::Context,
    stream_prefix: String,
}

impl NatsAuditLog {
    pub async fn connect(url: &str, stream_prefix: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| IssuanceError::Nats(e.to_string()))?;

        info!("Connected to NATS at {} for audit topics", url);

        Ok(NatsAuditLog {
            jetstream: jetstream::new(client),
            stream_prefix: stream_prefix.to_string(),
        })
    }

    fn stream_name(&self, topic_id: &str) -> String {
        format!(
            "{}_AUDIT_{}",
            self.stream_prefix.to_uppercase(),
            sanitize(topic_id)
        )
    }

    fn subject(&self, topic_id: &str) -> String {
        format!("{}.audit.{}", self.stream_prefix, sanitize(topic_id))
    }
}

/// Stream names and subject tokens cannot contain '.', '*', '>' or whitespace
fn sanitize(topic_id: &str) -> String {
    topic_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl AuditLog for NatsAuditLog {
    async fn create_topic(&self, memo: String) -> Result<String> {
        let topic_id = Uuid::new_v4().simple().to_string();

        self.jetstream
            .create_stream(jetstream::stream::Config {
                name: self.stream_name(&topic_id),
                description: Some(memo),
                subjects: vec![self.subject(&topic_id)],
                deny_delete: true,
                deny_purge: true,
                ..Default::default()
            })
            .await
            .map_err(|e| IssuanceError::AuditLogFailed(format!("create topic: {}", e)))?;

        info!("Created audit topic {}", topic_id);
        Ok(topic_id)
    }

    async fn submit(&self, topic_id: String, payload: Vec<u8>) -> Result<AuditAck> {
        let subject = self.subject(&topic_id);

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                error!("Failed to publish audit message to {}: {}", subject, e);
                IssuanceError::AuditLogFailed(format!("publish: {}", e))
            })?
            .await
            .map_err(|e| {
                error!("Audit message to {} was not acknowledged: {}", subject, e);
                IssuanceError::AuditLogFailed(format!("ack: {}", e))
            })?;

        info!(
            "Appended audit message to topic {} at sequence {}",
            topic_id, ack.sequence
        );

        Ok(AuditAck {
            topic_id,
            seq: ack.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_ledger_style_ids() {
        assert_eq!(sanitize("0.0.7007"), "0_0_7007");
        assert_eq!(sanitize("audit>all*"), "audit_all_");
        assert_eq!(sanitize("2f1c-aa"), "2f1c-aa");
    }

    #[tokio::test]
    #[ignore]
    async fn test_submit_assigns_increasing_sequence() {
        // Requires a JetStream-enabled NATS server on localhost
        let log = NatsAuditLog::connect("nats://127.0.0.1:4222", "issuance-test")
            .await
            .unwrap();
        let topic = log.create_topic("test".to_string()).await.unwrap();

        let first = log.submit(topic.clone(), b"{}".to_vec()).await.unwrap();
        let second = log.submit(topic, b"{}".to_vec()).await.unwrap();
        assert!(second.seq > first.seq);
    }
}
