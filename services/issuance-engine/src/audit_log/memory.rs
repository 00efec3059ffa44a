use super::AuditLog;
use crate::errors::{IssuanceError, Result};
use crate::models::AuditAck;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct TopicState {
    topics: HashMap<String, Vec<Vec<u8>>>,
    failures_remaining: usize,
    next_topic: u64,
}

/// In-process audit topics used for local runs and tests
#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    state: Arc<RwLock<TopicState>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_topic(topic_id: &str) -> Self {
        let log = Self::new();
        log.state
            .write()
            .await
            .topics
            .insert(topic_id.to_string(), Vec::new());
        log
    }

    /// Fails the next `count` submissions
    pub async fn fail_next_submissions(&self, count: usize) {
        self.state.write().await.failures_remaining = count;
    }

    /// Messages of a topic, decoded as JSON, in sequence order
    pub async fn messages(&self, topic_id: &str) -> Vec<serde_json::Value> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|raw| serde_json::from_slice(raw).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn raw_messages(&self, topic_id: &str) -> Vec<Vec<u8>> {
        let state = self.state.read().await;
        state.topics.get(topic_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn create_topic(&self, memo: String) -> Result<String> {
        let mut state = self.state.write().await;
        state.next_topic += 1;
        let topic_id = format!("0.0.{}", 7000 + state.next_topic);
        state.topics.insert(topic_id.clone(), Vec::new());

        info!("Memory audit log: created topic {} ({})", topic_id, memo);
        Ok(topic_id)
    }

    async fn submit(&self, topic_id: String, payload: Vec<u8>) -> Result<AuditAck> {
        let mut state = self.state.write().await;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            warn!("Memory audit log: injected submit failure on {}", topic_id);
            return Err(IssuanceError::AuditLogFailed(
                "simulated topic unavailability".to_string(),
            ));
        }

        let messages = state
            .topics
            .get_mut(&topic_id)
            .ok_or_else(|| IssuanceError::AuditLogFailed(format!("unknown topic {}", topic_id)))?;
        messages.push(payload);
        let seq = messages.len() as u64;

        Ok(AuditAck { topic_id, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_increase_per_topic() {
        let log = MemoryAuditLog::new();
        let a = log.create_topic("a".into()).await.unwrap();
        let b = log.create_topic("b".into()).await.unwrap();

        assert_eq!(log.submit(a.clone(), b"{}".to_vec()).await.unwrap().seq, 1);
        assert_eq!(log.submit(a.clone(), b"{}".to_vec()).await.unwrap().seq, 2);
        assert_eq!(log.submit(b, b"{}".to_vec()).await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_rejected() {
        let log = MemoryAuditLog::new();
        let err = log.submit("0.0.1".into(), b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, IssuanceError::AuditLogFailed(_)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let log = MemoryAuditLog::with_topic("0.0.7007").await;
        log.fail_next_submissions(1).await;

        assert!(log.submit("0.0.7007".into(), b"{}".to_vec()).await.is_err());
        let ack = log.submit("0.0.7007".into(), b"{\"ok\":true}".to_vec()).await.unwrap();
        assert_eq!(ack.seq, 1);
        assert_eq!(log.messages("0.0.7007").await[0]["ok"], true);
    }
}
