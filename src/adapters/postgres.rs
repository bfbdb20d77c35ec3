// src/adapters/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::{
    AttemptOutcome, EngineConfig, EngineError, FailedAttempt, LedgerAdapter, LedgerEntry, Source,
    User,
};

/// Carrier for `transactions` rows; converts into the public entry type so
/// the nullable `source_user_id` column never escapes this module.
#[derive(sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    idempotency_key: Uuid,
    source_user_id: Option<Uuid>,
    destination_user_id: Uuid,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl From<EntryRow> for LedgerEntry {
    fn from(row: EntryRow) -> Self {
        LedgerEntry {
            id: row.id,
            idempotency_key: row.idempotency_key,
            source: Source::from(row.source_user_id),
            destination: row.destination_user_id,
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            created_at: row.created_at,
        }
    }
}

const ENTRY_COLUMNS: &str =
    "id, idempotency_key, source_user_id, destination_user_id, amount, created_at";

/// PostgreSQL implementation of the storage seam.
///
/// The ledger is one append-only `transactions` table; `users` rows are
/// per-account lock anchors; balances are derived on demand, never stored.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool sized per the config and wrap it.
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .connect(&config.database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Tear down the pool. Call once at shutdown; in-flight operations
    /// finish first.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the operational tables, their indexes, and the private audit
    /// schema. Idempotent; run it at every startup.
    pub async fn init_schema(&self) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                idempotency_key UUID NOT NULL UNIQUE,
                source_user_id UUID REFERENCES users(id),
                destination_user_id UUID NOT NULL REFERENCES users(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CHECK (source_user_id IS NULL OR source_user_id <> destination_user_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Derivation and per-user history scans are both served by the
        // (user, created_at) pair; the composite index covers contended
        // source->destination aggregations without touching the heap.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_source_created
            ON transactions(source_user_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_destination_created
            ON transactions(destination_user_id, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_source_destination
            ON transactions(source_user_id, destination_user_id, created_at, amount)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Audit rows live outside the public namespace so operational
        // queries never see them. No foreign keys: an audit write must not
        // fail because the operational rows it describes are odd.
        sqlx::query("CREATE SCHEMA IF NOT EXISTS audit")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit.failed_transactions (
                id UUID PRIMARY KEY,
                idempotency_key UUID NOT NULL,
                source_user_id UUID,
                destination_user_id UUID NOT NULL,
                amount BIGINT NOT NULL,
                error TEXT NOT NULL,
                retries INT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                resolved_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_failed_transactions_failed_at
            ON audit.failed_transactions(failed_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

// Single statement, single snapshot: summing incoming and outgoing in two
// separate queries could straddle a concurrent commit and report a prefix
// that never existed.
const BALANCE_SQL: &str = r#"
SELECT COALESCE((SELECT SUM(amount) FROM transactions WHERE destination_user_id = $1), 0)::BIGINT
     - COALESCE((SELECT SUM(amount) FROM transactions WHERE source_user_id = $1), 0)::BIGINT
"#;

const BALANCE_AT_SQL: &str = r#"
SELECT COALESCE((SELECT SUM(amount) FROM transactions
                 WHERE destination_user_id = $1 AND created_at <= $2), 0)::BIGINT
     - COALESCE((SELECT SUM(amount) FROM transactions
                 WHERE source_user_id = $1 AND created_at <= $2), 0)::BIGINT
"#;

async fn derive_balance<'e, E>(
    executor: E,
    user: Uuid,
    at: Option<DateTime<Utc>>,
) -> Result<i64, EngineError>
where
    E: sqlx::PgExecutor<'e>,
{
    let balance: i64 = match at {
        None => {
            sqlx::query_scalar(BALANCE_SQL)
                .bind(user)
                .fetch_one(executor)
                .await?
        }
        Some(t) => {
            sqlx::query_scalar(BALANCE_AT_SQL)
                .bind(user)
                .bind(t)
                .fetch_one(executor)
                .await?
        }
    };
    Ok(balance)
}

#[async_trait]
impl LedgerAdapter for PostgresAdapter {
    async fn transfer_once(
        &self,
        key: Uuid,
        source: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Exclusive locks on both anchors, ascending id order. The order is
        // the sole deadlock-prevention mechanism. A missing row is a no-op:
        // the balance check below settles the outcome.
        let mut anchors = [source, destination];
        anchors.sort();
        for user in anchors {
            sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(user)
                .fetch_optional(&mut *tx)
                .await?;
        }

        let balance = derive_balance(&mut *tx, source, None).await?;
        if balance < amount {
            tx.rollback().await.ok();
            return Err(EngineError::InsufficientFunds);
        }

        let row = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            INSERT INTO transactions (id, idempotency_key, source_user_id, destination_user_id, amount)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(key)
        .bind(source)
        .bind(destination)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                Ok(AttemptOutcome::Committed(row.into()))
            }
            None => {
                // A concurrent winner owns this key; nothing to keep here.
                tx.rollback().await.ok();
                Ok(AttemptOutcome::Duplicate)
            }
        }
    }

    async fn deposit_once(
        &self,
        key: Uuid,
        destination: Uuid,
        amount: i64,
    ) -> Result<AttemptOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Value enters from outside the system, so only the destination
        // anchor is locked and no balance is derived.
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(destination)
            .fetch_optional(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            INSERT INTO transactions (id, idempotency_key, source_user_id, destination_user_id, amount)
            VALUES ($1, $2, NULL, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(key)
        .bind(destination)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) => {
                tx.commit().await?;
                Ok(AttemptOutcome::Committed(row.into()))
            }
            None => {
                tx.rollback().await.ok();
                Ok(AttemptOutcome::Duplicate)
            }
        }
    }

    async fn find_by_idempotency(&self, key: Uuid) -> Result<Option<LedgerEntry>, EngineError> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LedgerEntry::from))
    }

    async fn balance(&self, user: Uuid, at: Option<DateTime<Utc>>) -> Result<i64, EngineError> {
        derive_balance(&self.pool, user, at).await
    }

    async fn history(&self, user: Uuid) -> Result<Vec<LedgerEntry>, EngineError> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM transactions
            WHERE source_user_id = $1 OR destination_user_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn create_user(&self, email: &str) -> Result<User, EngineError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, email)
            VALUES ($1, $2)
            RETURNING id, email, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>, EngineError> {
        let row =
            sqlx::query_as::<_, UserRow>("SELECT id, email, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(User::from))
    }

    async fn record_failure(&self, attempt: &FailedAttempt) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO audit.failed_transactions
                (id, idempotency_key, source_user_id, destination_user_id,
                 amount, error, retries, failed_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.idempotency_key)
        .bind(attempt.source.user_id())
        .bind(attempt.destination)
        .bind(attempt.amount)
        .bind(&attempt.error)
        .bind(attempt.retries)
        .bind(attempt.failed_at)
        .bind(attempt.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
