// src/executor.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    AttemptOutcome, AuditSink, Coordinator, EngineConfig, EngineError, FailedAttempt,
    LedgerAdapter, LedgerEntry, RetryError, Source,
};

/// Stateless operation orchestrator over a [`LedgerAdapter`].
///
/// Owns the idempotency contract, the non-negativity rule for transfers,
/// and the audit-on-final-failure protocol; the adapter owns durability and
/// the per-attempt serializable unit of work. All operations are callable
/// concurrently from unbounded tasks; each holds at most one connection at
/// a time.
pub struct Executor {
    adapter: Arc<dyn LedgerAdapter>,
    coordinator: Coordinator,
    audit: AuditSink,
}

impl Executor {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, config: &EngineConfig) -> Self {
        Self {
            coordinator: Coordinator::new(config.retry_budget, config.initial_backoff),
            audit: AuditSink::new(Arc::clone(&adapter)),
            adapter,
        }
    }

    pub fn adapter(&self) -> &dyn LedgerAdapter {
        self.adapter.as_ref()
    }

    /// Move `amount` units from `source` to `destination`, at most once per
    /// `key`.
    ///
    /// Replays (same key, any payload) return the stored entry without
    /// re-executing side effects; the unique constraint on the key is the
    /// arbiter of "seen before". A transfer that would overdraw the source
    /// returns [`EngineError::InsufficientFunds`] and mutates nothing.
    pub async fn create_transfer(
        &self,
        cancel: &CancellationToken,
        key: Uuid,
        source: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<LedgerEntry, EngineError> {
        if amount <= 0 {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }
        if source == destination {
            return Err(EngineError::Validation(
                "source and destination must differ".to_string(),
            ));
        }

        let result = self
            .coordinator
            .run(cancel, || {
                self.attempt_transfer(key, source, destination, amount)
            })
            .await;

        match result {
            Ok(entry) => Ok(entry),
            Err(retry) => {
                self.fail_write(key, Source::User(source), destination, amount, retry)
                    .await
            }
        }
    }

    /// Inject `amount` new units into `destination`'s balance, at most once
    /// per `key`. No balance derivation and no overdraft check; the
    /// destination must exist or the store rejects the append.
    pub async fn create_deposit(
        &self,
        cancel: &CancellationToken,
        key: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<LedgerEntry, EngineError> {
        if amount <= 0 {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }

        let result = self
            .coordinator
            .run(cancel, || self.attempt_deposit(key, destination, amount))
            .await;

        match result {
            Ok(entry) => Ok(entry),
            Err(retry) => {
                self.fail_write(key, Source::Deposit, destination, amount, retry)
                    .await
            }
        }
    }

    /// Current derived balance. Zero for unknown users; no locks taken.
    pub async fn balance_now(
        &self,
        cancel: &CancellationToken,
        user: Uuid,
    ) -> Result<i64, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            result = self.adapter.balance(user, None) => result,
        }
    }

    /// Derived balance over the inclusive prefix `created_at <= at`. A
    /// future `at` returns the current balance; an `at` before the user's
    /// first entry returns zero.
    pub async fn balance_at(
        &self,
        cancel: &CancellationToken,
        user: Uuid,
        at: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            result = self.adapter.balance(user, Some(at)) => result,
        }
    }

    /// Every entry where the user is source or destination, newest first.
    pub async fn list_history(
        &self,
        cancel: &CancellationToken,
        user: Uuid,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Canceled),
            result = self.adapter.history(user) => result,
        }
    }

    /// One full pass of the transfer protocol: probe, then a serializable
    /// lock/derive/append attempt, then the loser branch if a concurrent
    /// winner took the key between probe and append.
    async fn attempt_transfer(
        &self,
        key: Uuid,
        source: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<LedgerEntry, EngineError> {
        // Probe first: a previous attempt may have committed before the
        // store reported its conflict back to us.
        if let Some(existing) = self.adapter.find_by_idempotency(key).await? {
            return Ok(existing);
        }

        match self
            .adapter
            .transfer_once(key, source, destination, amount)
            .await?
        {
            AttemptOutcome::Committed(entry) => Ok(entry),
            AttemptOutcome::Duplicate => self.replay(key).await,
        }
    }

    async fn attempt_deposit(
        &self,
        key: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<LedgerEntry, EngineError> {
        if let Some(existing) = self.adapter.find_by_idempotency(key).await? {
            return Ok(existing);
        }

        match self.adapter.deposit_once(key, destination, amount).await? {
            AttemptOutcome::Committed(entry) => Ok(entry),
            AttemptOutcome::Duplicate => self.replay(key).await,
        }
    }

    /// Idempotent-loser branch: a concurrent winner owns the key, so the
    /// stored entry is authoritative regardless of this request's payload.
    async fn replay(&self, key: Uuid) -> Result<LedgerEntry, EngineError> {
        self.adapter.find_by_idempotency(key).await?.ok_or_else(|| {
            // The unique index said the winner committed, but it is not
            // visible to us yet; re-run from the probe.
            EngineError::Conflict("entry for idempotency key not yet visible".to_string())
        })
    }

    /// Terminal write failure: audit conflicts and storage faults, pass
    /// business outcomes and caller aborts through untouched.
    async fn fail_write(
        &self,
        key: Uuid,
        source: Source,
        destination: Uuid,
        amount: i64,
        retry: RetryError,
    ) -> Result<LedgerEntry, EngineError> {
        match &retry.error {
            EngineError::InsufficientFunds => {
                metrics::counter!("centime_insufficient_funds_total").increment(1);
            }
            EngineError::Canceled | EngineError::Validation(_) => {}
            EngineError::Conflict(_) | EngineError::Storage(_) => {
                tracing::error!(
                    idempotency_key = %key,
                    attempts = retry.attempts,
                    error = %retry.error,
                    "write abandoned after retry budget"
                );
                let attempt = FailedAttempt::new(
                    key,
                    source,
                    destination,
                    amount,
                    &retry.error,
                    retry.attempts.saturating_sub(1),
                );
                self.audit.record(attempt).await;
            }
        }
        Err(retry.error)
    }
}
