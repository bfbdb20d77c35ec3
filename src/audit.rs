// src/audit.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, LedgerAdapter, Source};

/// One write that exhausted its retry budget. Rows live in the private
/// audit schema and are only ever read by operators, out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub id: Uuid,
    pub idempotency_key: Uuid,
    pub source: Source,
    pub destination: Uuid,
    pub amount: i64,
    pub error: String,
    pub retries: i32,
    pub failed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedAttempt {
    pub fn new(
        idempotency_key: Uuid,
        source: Source,
        destination: Uuid,
        amount: i64,
        error: &EngineError,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            idempotency_key,
            source,
            destination,
            amount,
            error: error.to_string(),
            retries: retries as i32,
            failed_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Best-effort writer for the audit table.
///
/// Runs strictly after the main transaction has ended, so nothing written
/// here can influence whether the user-visible request succeeds. Its own
/// failures are logged and swallowed: the caller gets the original error
/// no matter what happens in this path.
pub struct AuditSink {
    adapter: Arc<dyn LedgerAdapter>,
}

impl AuditSink {
    pub fn new(adapter: Arc<dyn LedgerAdapter>) -> Self {
        Self { adapter }
    }

    pub async fn record(&self, attempt: FailedAttempt) {
        metrics::counter!("centime_failed_attempts_total").increment(1);
        if let Err(err) = self.adapter.record_failure(&attempt).await {
            tracing::warn!(
                %err,
                idempotency_key = %attempt.idempotency_key,
                "audit write dropped"
            );
        }
    }
}
