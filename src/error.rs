// src/error.rs
use std::fmt;

/// PostgreSQL SQLSTATE codes the engine reacts to.
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
mod sqlstate {
    // Class 40 - Transaction Rollback
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    // Class 23 - Integrity Constraint Violation
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
}

#[derive(Debug)]
pub enum EngineError {
    /// Derived source balance is below the requested amount. A business
    /// outcome, not a fault: never retried, never audited.
    InsufficientFunds,
    /// The store reported a serialization failure or picked this
    /// transaction as a deadlock victim. Safe to re-run from the
    /// idempotency probe.
    Conflict(String),
    /// The store rejected a value (foreign key, check, unique constraint).
    /// The outer adapter validates first, so this surfaces collaborator
    /// bugs.
    Validation(String),
    /// The caller's cancellation token fired.
    Canceled,
    /// Anything else: connectivity, unexpected store errors.
    Storage(String),
}

impl EngineError {
    /// Conflicts are the single retryable class; everything else is
    /// terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds => write!(f, "Insufficient funds"),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::Validation(msg) => write!(f, "Validation failure: {}", msg),
            Self::Canceled => write!(f, "Operation canceled"),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                return match code.as_ref() {
                    sqlstate::SERIALIZATION_FAILURE | sqlstate::DEADLOCK_DETECTED => {
                        tracing::debug!(
                            sqlstate = code.as_ref(),
                            message = db.message(),
                            "retryable conflict reported by store"
                        );
                        EngineError::Conflict(db.message().to_string())
                    }
                    sqlstate::NOT_NULL_VIOLATION
                    | sqlstate::FOREIGN_KEY_VIOLATION
                    | sqlstate::UNIQUE_VIOLATION
                    | sqlstate::CHECK_VIOLATION => {
                        EngineError::Validation(db.message().to_string())
                    }
                    _ => EngineError::Storage(db.message().to_string()),
                };
            }
        }
        EngineError::Storage(err.to_string())
    }
}
