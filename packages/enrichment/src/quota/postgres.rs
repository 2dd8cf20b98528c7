//! PostgreSQL quota ledger.
//!
//! Each operation runs in one transaction holding `SELECT ... FOR UPDATE` on
//! the account row, so concurrent batches for the same account serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info};

use super::{QuotaAccount, QuotaLedger, Reservation};
use crate::error::{QuotaError, QuotaResult};
use crate::types::account::{AccountContext, AccountId};

#[derive(Debug, FromRow)]
struct AccountRow {
    quota_limit: i64,
    quota_used: i64,
    quota_reserved: i64,
    window_start: DateTime<Utc>,
}

impl From<AccountRow> for QuotaAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            used: row.quota_used.max(0) as u64,
            limit: row.quota_limit.max(0) as u64,
            reserved: row.quota_reserved.max(0) as u64,
            window_start: row.window_start,
        }
    }
}

fn storage(e: sqlx::Error) -> QuotaError {
    QuotaError::Storage(e.to_string())
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Quota ledger backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresQuotaLedger {
    pool: PgPool,
}

impl PostgresQuotaLedger {
    /// Connect and apply migrations.
    pub async fn new(database_url: &str) -> QuotaResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage)?;

        Self::from_pool(pool).await
    }

    /// Reuse an existing pool. Applies migrations.
    pub async fn from_pool(pool: PgPool) -> QuotaResult<Self> {
        let ledger = Self { pool };
        ledger.run_migrations().await?;
        Ok(ledger)
    }

    async fn run_migrations(&self) -> QuotaResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS enrichment_migrations (
                name TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        let migrations = [(
            "001_quota_ledger",
            include_str!("../../migrations/001_quota_ledger.sql"),
        )];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM enrichment_migrations WHERE name = $1")
                    .bind(name)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage)?;

            if applied.is_none() {
                sqlx::raw_sql(sql).execute(&self.pool).await.map_err(|e| {
                    QuotaError::Storage(format!("migration {} failed: {}", name, e))
                })?;

                sqlx::query("INSERT INTO enrichment_migrations (name) VALUES ($1)")
                    .bind(name)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
                info!(migration = name, "Applied migration");
            }
        }

        Ok(())
    }

    /// Create the account row if it does not exist yet.
    pub async fn register(&self, context: &AccountContext) -> QuotaResult<()> {
        sqlx::query(
            "INSERT INTO quota_accounts (account_id, quota_limit, quota_used, window_start)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(context.account_id.0)
        .bind(to_db(context.quota_limit))
        .bind(to_db(context.quota_used))
        .bind(context.window_start)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn lock_account(
        tx: &mut Transaction<'_, Postgres>,
        account_id: AccountId,
    ) -> QuotaResult<QuotaAccount> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT quota_limit, quota_used, quota_reserved, window_start
             FROM quota_accounts WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?;

        row.map(QuotaAccount::from)
            .ok_or(QuotaError::AccountNotFound(account_id))
    }

    async fn store_account(
        tx: &mut Transaction<'_, Postgres>,
        account_id: AccountId,
        account: &QuotaAccount,
    ) -> QuotaResult<()> {
        sqlx::query(
            "UPDATE quota_accounts
             SET quota_used = $2, quota_reserved = $3, window_start = $4
             WHERE account_id = $1",
        )
        .bind(account_id.0)
        .bind(to_db(account.used))
        .bind(to_db(account.reserved))
        .bind(account.window_start)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
        Ok(())
    }

    /// Remove a reservation row, returning its held row count.
    async fn take_reservation(
        tx: &mut Transaction<'_, Postgres>,
        reservation: &Reservation,
    ) -> QuotaResult<u64> {
        let held: Option<(i64,)> = sqlx::query_as(
            "DELETE FROM quota_reservations WHERE id = $1 AND account_id = $2 RETURNING row_count",
        )
        .bind(reservation.id)
        .bind(reservation.account_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage)?;

        held.map(|(rows,)| rows.max(0) as u64)
            .ok_or(QuotaError::AlreadySettled)
    }
}

#[async_trait]
impl QuotaLedger for PostgresQuotaLedger {
    async fn account(&self, account_id: AccountId) -> QuotaResult<QuotaAccount> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut account = Self::lock_account(&mut tx, account_id).await?;
        if account.refresh_window(Utc::now()) {
            Self::store_account(&mut tx, account_id, &account).await?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(account)
    }

    async fn reserve(&self, account_id: AccountId, rows: u64) -> QuotaResult<Reservation> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut account = Self::lock_account(&mut tx, account_id).await?;
        account.refresh_window(Utc::now());

        let remaining = account.remaining();
        if rows > remaining {
            // Dropping the transaction rolls it back
            return Err(QuotaError::QuotaExceeded {
                requested: rows,
                remaining,
            });
        }

        let reservation = Reservation::new(account_id, rows);
        sqlx::query(
            "INSERT INTO quota_reservations (id, account_id, row_count, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(reservation.id)
        .bind(account_id.0)
        .bind(to_db(rows))
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        account.reserved += rows;
        Self::store_account(&mut tx, account_id, &account).await?;
        tx.commit().await.map_err(storage)?;

        debug!(account = %account_id, reservation = %reservation.id, rows, "Quota reserved");
        Ok(reservation)
    }

    async fn commit(&self, reservation: &Reservation, processed: u64) -> QuotaResult<QuotaAccount> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut account = Self::lock_account(&mut tx, reservation.account_id).await?;
        let held = Self::take_reservation(&mut tx, reservation).await?;

        account.refresh_window(Utc::now());
        let billed = processed.min(held);
        account.reserved = account.reserved.saturating_sub(held);
        account.used += billed;

        Self::store_account(&mut tx, reservation.account_id, &account).await?;
        tx.commit().await.map_err(storage)?;

        info!(
            account = %reservation.account_id,
            reservation = %reservation.id,
            billed,
            used = account.used,
            limit = account.limit,
            "Quota committed"
        );
        Ok(account)
    }

    async fn release(&self, reservation: &Reservation) -> QuotaResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let mut account = Self::lock_account(&mut tx, reservation.account_id).await?;
        let held = Self::take_reservation(&mut tx, reservation).await?;

        account.reserved = account.reserved.saturating_sub(held);
        Self::store_account(&mut tx, reservation.account_id, &account).await?;
        tx.commit().await.map_err(storage)?;

        debug!(account = %reservation.account_id, reservation = %reservation.id, held, "Quota released");
        Ok(())
    }
}
