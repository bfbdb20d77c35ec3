// src/adapters/memory.rs
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    AttemptOutcome, EngineError, FailedAttempt, LedgerAdapter, LedgerEntry, Source, User,
};

#[derive(Default)]
struct MemoryStore {
    users: HashMap<Uuid, User>,
    entries: Vec<LedgerEntry>,
    by_key: HashMap<Uuid, usize>,
    failures: Vec<FailedAttempt>,
    last_stamp: Option<DateTime<Utc>>,
}

impl MemoryStore {
    // Nondecreasing insertion clock: a timestamp never moves backwards even
    // if the wall clock does, so prefix sums stay well-defined.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now < last {
                now = last;
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn balance(&self, user: Uuid, at: Option<DateTime<Utc>>) -> i64 {
        self.entries
            .iter()
            .filter(|entry| at.map_or(true, |t| entry.created_at <= t))
            .map(|entry| {
                let mut delta = 0i64;
                if entry.destination == user {
                    delta += entry.amount;
                }
                if entry.source == Source::User(user) {
                    delta -= entry.amount;
                }
                delta
            })
            .sum()
    }

    fn append(&mut self, key: Uuid, source: Source, destination: Uuid, amount: i64) -> AttemptOutcome {
        if self.by_key.contains_key(&key) {
            return AttemptOutcome::Duplicate;
        }

        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            idempotency_key: key,
            source,
            destination,
            amount,
            created_at: self.stamp(),
        };
        self.by_key.insert(key, self.entries.len());
        self.entries.push(entry.clone());
        AttemptOutcome::Committed(entry)
    }
}

/// In-process implementation of the storage seam.
///
/// The store mutex is held for the whole of each unit of work; this is
/// the equivalent of BEGIN / SELECT FOR UPDATE / COMMIT. No other
/// task can interleave with an in-flight write, so the serializable
/// contract holds trivially and no conflict is ever reported.
pub struct MemoryAdapter {
    store: Mutex<MemoryStore>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(MemoryStore::default()),
        }
    }

    /// Audit rows captured so far. Test-double surface; the real sink's
    /// consumers read the audit table out-of-band.
    pub fn recorded_failures(&self) -> Vec<FailedAttempt> {
        self.store.lock().unwrap().failures.clone()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MemoryAdapter {
    async fn transfer_once(
        &self,
        key: Uuid,
        source: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError> {
        let mut store = self.store.lock().unwrap();

        // An unknown source derives to zero and fails here, matching the
        // relational adapter's no-op lock plus balance check.
        if store.balance(source, None) < amount {
            return Err(EngineError::InsufficientFunds);
        }
        if !store.users.contains_key(&destination) {
            return Err(EngineError::Validation(format!(
                "unknown destination user {}",
                destination
            )));
        }

        Ok(store.append(key, Source::User(source), destination, amount))
    }

    async fn deposit_once(
        &self,
        key: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError> {
        let mut store = self.store.lock().unwrap();

        if !store.users.contains_key(&destination) {
            return Err(EngineError::Validation(format!(
                "unknown destination user {}",
                destination
            )));
        }

        Ok(store.append(key, Source::Deposit, destination, amount))
    }

    async fn find_by_idempotency(&self, key: Uuid) -> Result<Option<LedgerEntry>, EngineError> {
        let store = self.store.lock().unwrap();
        Ok(store.by_key.get(&key).map(|&i| store.entries[i].clone()))
    }

    async fn balance(&self, user: Uuid, at: Option<DateTime<Utc>>) -> Result<i64, EngineError> {
        Ok(self.store.lock().unwrap().balance(user, at))
    }

    async fn history(&self, user: Uuid) -> Result<Vec<LedgerEntry>, EngineError> {
        let store = self.store.lock().unwrap();
        // Entries are appended in nondecreasing created_at order, so the
        // reversed scan is newest-first.
        Ok(store
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.destination == user || entry.source == Source::User(user))
            .cloned()
            .collect())
    }

    async fn create_user(&self, email: &str) -> Result<User, EngineError> {
        let mut store = self.store.lock().unwrap();

        if store.users.values().any(|user| user.email == email) {
            return Err(EngineError::Validation(format!(
                "email already registered: {}",
                email
            )));
        }

        let user = User {
            id: Uuid::now_v7(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        store.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, EngineError> {
        Ok(self.store.lock().unwrap().users.get(&id).cloned())
    }

    async fn record_failure(&self, attempt: &FailedAttempt) -> Result<(), EngineError> {
        self.store.lock().unwrap().failures.push(attempt.clone());
        Ok(())
    }
}
