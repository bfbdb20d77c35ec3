// src/lib.rs
pub mod adapters;
pub mod audit;
pub mod config;
pub mod entry;
pub mod error;
pub mod executor;
pub mod retry;

pub use audit::{AuditSink, FailedAttempt};
pub use config::EngineConfig;
pub use entry::{LedgerEntry, Source, User};
pub use error::EngineError;
pub use executor::Executor;
pub use retry::{Coordinator, RetryError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The outcome of one serializable append attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The entry committed; the caller owns the returned record.
    Committed(LedgerEntry),
    /// Another writer holding the same idempotency key committed first.
    /// The attempt rolled back without side effects; re-probe for the
    /// stored entry.
    Duplicate,
}

/// Storage seam for the engine.
///
/// Implementations own the durability story; the [`Executor`] and
/// [`Coordinator`] own idempotency, retry, and audit. `transfer_once` and
/// `deposit_once` run exactly one serializable unit of work: lock the
/// involved users in ascending-id order, derive, check, append, commit.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    // === WRITE PATH ===

    async fn transfer_once(
        &self,
        key: Uuid,
        source: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError>;

    async fn deposit_once(
        &self,
        key: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError>;

    // === READ PATH ===

    /// Point lookup by idempotency key, outside any transaction.
    async fn find_by_idempotency(&self, key: Uuid) -> Result<Option<LedgerEntry>, EngineError>;

    /// Derived balance: incoming minus outgoing over the prefix
    /// `created_at <= at` (the whole log when `at` is `None`). Zero for
    /// unknown users and empty prefixes.
    async fn balance(&self, user: Uuid, at: Option<DateTime<Utc>>) -> Result<i64, EngineError>;

    /// Every entry where the user is source or destination, newest first.
    async fn history(&self, user: Uuid) -> Result<Vec<LedgerEntry>, EngineError>;

    // === COLLABORATOR SURFACE ===

    async fn create_user(&self, email: &str) -> Result<User, EngineError>;
    async fn find_user(&self, id: Uuid) -> Result<Option<User>, EngineError>;

    // === AUDIT ===

    /// Append one exhausted-write record to the audit table. Callers go
    /// through [`AuditSink`], which swallows errors from here.
    async fn record_failure(&self, attempt: &FailedAttempt) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_maps_to_nullable_column() {
        let id = Uuid::now_v7();
        assert_eq!(Source::User(id).user_id(), Some(id));
        assert_eq!(Source::Deposit.user_id(), None);
        assert_eq!(Source::from(Some(id)), Source::User(id));
        assert_eq!(Source::from(None), Source::Deposit);
        assert!(Source::Deposit.is_deposit());
        assert!(!Source::User(id).is_deposit());
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(EngineError::Conflict("clash".to_string()).is_retryable());
        assert!(!EngineError::InsufficientFunds.is_retryable());
        assert!(!EngineError::Validation("bad".to_string()).is_retryable());
        assert!(!EngineError::Canceled.is_retryable());
        assert!(!EngineError::Storage("down".to_string()).is_retryable());
    }

    #[test]
    fn config_defaults_match_reference_sizing() {
        let config = EngineConfig::default();
        assert_eq!(config.pool_min, 10);
        assert_eq!(config.pool_max, 100);
        assert_eq!(config.retry_budget, 10);
        assert_eq!(config.initial_backoff.as_millis(), 10);
        assert_eq!(config.unit_scale, 2);
    }

    #[test]
    fn unit_scale_converts_between_minor_and_display() {
        let config = EngineConfig::default();
        assert_eq!(config.to_minor(100.50), 10_050);
        assert_eq!(config.to_display(10_050), 100.50);
    }
}
