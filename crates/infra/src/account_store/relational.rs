//! Relational account store over a pooled `sqlx` `AnyPool`.
//!
//! The same SQL runs against SQLite and PostgreSQL; the driver is chosen by the URL
//! scheme (`sqlite://...`, `postgres://...`). There is no cache: every call is one
//! round trip (or one transaction) against the database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | StoreError | Scenario |
//! |------------|------|------------|----------|
//! | PoolTimedOut | N/A | `Timeout` | No connection within `acquire_timeout` |
//! | PoolClosed | N/A | `Closed` | Used after `close()` |
//! | Database | SQLite `5`/`6`/`261`/`517` | `Timeout` | Busy timeout elapsed on a locked database |
//! | Database | Postgres `55P03`/`57014`/`40001` | `Timeout` | Lock wait, statement timeout, serialization failure |
//! | Database (other) | Any other | `Database` | Constraint or driver failure |
//! | Other | N/A | `Database` | Network errors, connection failures, etc. |
//!
//! On PostgreSQL every pooled connection also sets `lock_timeout` to the pool's
//! `acquire_timeout`, so a transfer blocked on a row lock fails as `Timeout` instead
//! of waiting indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Executor, Row};
use tracing::instrument;

use coinvault_core::{AccountId, Balance, BalanceEntry, DomainError, checked_total};

use super::r#trait::{AccountStore, StoreError};

const POSTGRES_BACKEND: &str = "PostgreSQL";

const CREATE_ACCOUNTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        balance BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
"#;

/// Connection pool settings for [`RelationalStore::connect`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Account store backed by a relational database.
///
/// ## Atomicity
///
/// - `add_balance` / `remove_balance` are a single upsert statement with `RETURNING`
/// - `perform_transfer` is a transaction: a guarded debit
///   (`UPDATE ... WHERE balance >= total`) followed by the credit upsert. A guard
///   that matches no row rolls the transaction back and reports `false`.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: AnyPool,
}

impl RelationalStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `url`. The schema is created by `initialize()`.
    pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let lock_timeout_ms = settings.acquire_timeout.as_millis().max(1);
        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if conn.backend_name() == POSTGRES_BACKEND {
                        let statement = format!("SET lock_timeout = {lock_timeout_ms}");
                        conn.execute(statement.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

fn decode_balance(operation: &str, row: &AnyRow) -> Result<Balance, StoreError> {
    row.try_get::<i64, _>("balance")
        .map_err(|e| map_sqlx_error(operation, e))
}

fn decode_entry(row: &AnyRow) -> Result<BalanceEntry, StoreError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| map_sqlx_error("top_balances", e))?;
    let balance = decode_balance("top_balances", row)?;
    Ok(BalanceEntry::new(id.parse::<AccountId>()?, balance))
}

#[async_trait]
impl AccountStore for RelationalStore {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    #[instrument(skip(self), err)]
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_ACCOUNTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("initialize", e))?;

        tracing::info!(connections = self.pool.size(), "relational account store ready");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        tracing::info!("relational account store closed");
        Ok(())
    }

    #[instrument(skip(self), fields(account = %id), err, level = "debug")]
    async fn get_balance(&self, id: AccountId) -> Result<Balance, StoreError> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE id = $1")
            .bind(id.to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_balance", e))?;

        match row {
            Some(row) => decode_balance("get_balance", &row),
            None => Ok(0),
        }
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn set_balance(&self, id: AccountId, balance: Balance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, balance) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET balance = excluded.balance, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(id.to_key())
        .bind(balance)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_balance", e))?;

        Ok(())
    }

    async fn has_account(&self, id: AccountId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT id FROM accounts WHERE id = $1")
            .bind(id.to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("has_account", e))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn create_account(
        &self,
        id: AccountId,
        starting_balance: Balance,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO accounts (id, balance) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(id.to_key())
        .bind(starting_balance)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn add_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        // The WHERE on the conflict arm refuses an increment that would leave i64.
        let ceiling = i64::MAX.saturating_sub(delta.max(0));
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, balance) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET balance = accounts.balance + excluded.balance, updated_at = CURRENT_TIMESTAMP
            WHERE accounts.balance <= $3
            RETURNING balance
            "#,
        )
        .bind(id.to_key())
        .bind(delta)
        .bind(ceiling)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_balance", e))?;

        match row {
            Some(row) => decode_balance("add_balance", &row),
            None => Err(DomainError::overflow(format!("balance of {id} + {delta}")).into()),
        }
    }

    #[instrument(skip(self), fields(account = %id), err)]
    async fn remove_balance(&self, id: AccountId, delta: Balance) -> Result<Balance, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, balance) VALUES ($1, 0)
            ON CONFLICT (id) DO UPDATE
            SET balance = CASE WHEN accounts.balance <= $2 THEN 0 ELSE accounts.balance - $2 END,
                updated_at = CURRENT_TIMESTAMP
            RETURNING balance
            "#,
        )
        .bind(id.to_key())
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_balance", e))?;

        decode_balance("remove_balance", &row)
    }

    #[instrument(skip(self), fields(from = %from, to = %to), err)]
    async fn perform_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Balance,
        fee: Balance,
    ) -> Result<bool, StoreError> {
        let total = checked_total(amount, fee)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("perform_transfer", e))?;

        let debited = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - $1, updated_at = CURRENT_TIMESTAMP
            WHERE id = $2 AND balance >= $3
            "#,
        )
        .bind(total)
        .bind(from.to_key())
        .bind(total)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("perform_transfer", e))?;

        if debited.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("perform_transfer", e))?;
            return Ok(false);
        }

        let ceiling = i64::MAX.saturating_sub(amount);
        let credited = sqlx::query(
            r#"
            INSERT INTO accounts (id, balance) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
            SET balance = accounts.balance + excluded.balance, updated_at = CURRENT_TIMESTAMP
            WHERE accounts.balance <= $3
            RETURNING balance
            "#,
        )
        .bind(to.to_key())
        .bind(amount)
        .bind(ceiling)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("perform_transfer", e))?;

        if credited.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("perform_transfer", e))?;
            return Err(DomainError::overflow(format!("balance of {to} + {amount}")).into());
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("perform_transfer", e))?;

        Ok(true)
    }

    #[instrument(skip(self), err, level = "debug")]
    async fn top_balances(&self, limit: u32, offset: u32) -> Result<Vec<BalanceEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, balance FROM accounts
            ORDER BY balance DESC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("top_balances", e))?;

        rows.iter().map(decode_entry).collect()
    }

    async fn account_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM accounts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_count", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("account_count", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // SQLite busy/locked (plus extended codes)
                Some("5" | "6" | "261" | "517") => StoreError::Timeout(msg),
                // Postgres lock_not_available, query_canceled, serialization_failure
                Some("55P03" | "57014" | "40001") => StoreError::Timeout(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Timeout(format!("connection pool acquire timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => StoreError::Closed,
        sqlx::Error::RowNotFound => {
            StoreError::Database(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
