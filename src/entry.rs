// src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the value in a ledger entry comes from.
///
/// `Deposit` injects new value into the system; `User` moves existing value
/// out of that user's balance. The storage layer maps this to a nullable
/// `source_user_id` column, but nothing above the adapters handles a raw
/// nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Deposit,
    User(Uuid),
}

impl Source {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Source::Deposit => None,
            Source::User(id) => Some(*id),
        }
    }

    pub fn is_deposit(&self) -> bool {
        matches!(self, Source::Deposit)
    }
}

impl From<Option<Uuid>> for Source {
    fn from(id: Option<Uuid>) -> Self {
        match id {
            None => Source::Deposit,
            Some(id) => Source::User(id),
        }
    }
}

/// One immutable record of value movement.
///
/// Entries are never updated or deleted once committed; every balance in
/// the system is a sum over them. `created_at` is assigned by the store at
/// insertion with a nondecreasing clock, and derivation treats
/// `created_at <= t` as an inclusive prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub idempotency_key: Uuid,
    pub source: Source,
    pub destination: Uuid,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A participant with an implicit single account.
///
/// The row exists as a lockable anchor for the write protocol; it carries
/// no balance and no version column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
