use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResetOutcome {
    Applied,
    Rejected { reason: String },
}

/// One counter reset attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ResetAuditRecord {
    pub document_type: String,
    pub warehouse: Option<String>,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub previous_number: Option<u64>,
    pub new_number: u64,
    #[serde(flatten)]
    pub outcome: ResetOutcome,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_reset(&self, record: ResetAuditRecord);

    /// Retained history for a document type, oldest first. Sinks that only
    /// forward records return nothing.
    async fn resets(&self, _document_type: &str) -> Vec<ResetAuditRecord> {
        Vec::new()
    }
}

fn emit(record: &ResetAuditRecord) {
    match &record.outcome {
        ResetOutcome::Applied => tracing::warn!(
            target: "audit",
            document_type = %record.document_type,
            warehouse = ?record.warehouse,
            actor = %record.actor,
            previous_number = ?record.previous_number,
            new_number = record.new_number,
            "counter reset applied"
        ),
        ResetOutcome::Rejected { reason } => tracing::warn!(
            target: "audit",
            document_type = %record.document_type,
            warehouse = ?record.warehouse,
            actor = %record.actor,
            new_number = record.new_number,
            reason = %reason,
            "counter reset rejected"
        ),
    }
}

/// Writes audit records to the log only.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_reset(&self, record: ResetAuditRecord) {
        emit(&record);
    }
}

/// Logs and keeps records in process memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<ResetAuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_reset(&self, record: ResetAuditRecord) {
        emit(&record);
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    async fn resets(&self, document_type: &str) -> Vec<ResetAuditRecord> {
        let records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records
            .iter()
            .filter(|record| record.document_type == document_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(document_type: &str, outcome: ResetOutcome) -> ResetAuditRecord {
        ResetAuditRecord {
            document_type: document_type.to_string(),
            warehouse: None,
            actor: "admin".to_string(),
            at: Utc::now(),
            previous_number: Some(3),
            new_number: 1,
            outcome,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_filters_by_type() {
        let sink = MemoryAuditSink::new();
        sink.record_reset(record("paragon", ResetOutcome::Applied)).await;
        sink.record_reset(record("faktura", ResetOutcome::Applied)).await;
        sink.record_reset(record(
            "paragon",
            ResetOutcome::Rejected {
                reason: "not confirmed".into(),
            },
        ))
        .await;

        let history = sink.resets("paragon").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, ResetOutcome::Applied);
        assert!(matches!(history[1].outcome, ResetOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_tracing_sink_retains_nothing() {
        let sink = TracingAuditSink;
        sink.record_reset(record("paragon", ResetOutcome::Applied)).await;
        assert!(sink.resets("paragon").await.is_empty());
    }

    #[test]
    fn test_outcome_is_flattened_into_record() {
        let json = serde_json::to_value(record("paragon", ResetOutcome::Applied)).unwrap();
        assert_eq!(json["status"], "applied");
        assert_eq!(json["previous_number"], 3);
    }
}
