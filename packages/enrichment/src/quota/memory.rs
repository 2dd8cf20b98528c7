//! In-process quota ledger.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::{QuotaAccount, QuotaLedger, Reservation};
use crate::error::{QuotaError, QuotaResult};
use crate::types::account::{AccountContext, AccountId};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct AccountEntry {
    account: QuotaAccount,
    /// Unsettled reservations and their row counts
    outstanding: HashMap<Uuid, u64>,
}

/// Quota ledger held in memory, one async mutex per account.
///
/// State is lost on restart. Suitable for the CLI, tests, and single-node
/// deployments.
pub struct MemoryQuotaLedger {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountEntry>>>>,
    clock: Clock,
}

impl Default for MemoryQuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuotaLedger {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Use `clock` instead of the system time.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Add or replace an account.
    pub async fn insert(&self, account_id: AccountId, account: QuotaAccount) {
        let entry = AccountEntry {
            account,
            outstanding: HashMap::new(),
        };
        self.accounts
            .write()
            .await
            .insert(account_id, Arc::new(Mutex::new(entry)));
    }

    /// Add an account from session context unless it is already known.
    pub async fn register(&self, context: &AccountContext) {
        let mut accounts = self.accounts.write().await;
        accounts.entry(context.account_id).or_insert_with(|| {
            Arc::new(Mutex::new(AccountEntry {
                account: context.quota_account(),
                outstanding: HashMap::new(),
            }))
        });
    }

    async fn entry(&self, account_id: AccountId) -> QuotaResult<Arc<Mutex<AccountEntry>>> {
        self.accounts
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or(QuotaError::AccountNotFound(account_id))
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn account(&self, account_id: AccountId) -> QuotaResult<QuotaAccount> {
        let entry = self.entry(account_id).await?;
        let mut entry = entry.lock().await;
        entry.account.refresh_window((self.clock)());
        Ok(entry.account.clone())
    }

    async fn reserve(&self, account_id: AccountId, rows: u64) -> QuotaResult<Reservation> {
        let entry = self.entry(account_id).await?;
        let mut entry = entry.lock().await;

        if entry.account.refresh_window((self.clock)()) {
            info!(account = %account_id, "Quota window reset");
        }

        let remaining = entry.account.remaining();
        if rows > remaining {
            return Err(QuotaError::QuotaExceeded {
                requested: rows,
                remaining,
            });
        }

        let reservation = Reservation::new(account_id, rows);
        entry.account.reserved += rows;
        entry.outstanding.insert(reservation.id, rows);

        debug!(
            account = %account_id,
            reservation = %reservation.id,
            rows,
            remaining = entry.account.remaining(),
            "Quota reserved"
        );
        Ok(reservation)
    }

    async fn commit(&self, reservation: &Reservation, processed: u64) -> QuotaResult<QuotaAccount> {
        let entry = self.entry(reservation.account_id).await?;
        let mut entry = entry.lock().await;

        let held = entry
            .outstanding
            .remove(&reservation.id)
            .ok_or(QuotaError::AlreadySettled)?;

        entry.account.refresh_window((self.clock)());
        let billed = processed.min(held);
        entry.account.reserved = entry.account.reserved.saturating_sub(held);
        entry.account.used += billed;

        info!(
            account = %reservation.account_id,
            reservation = %reservation.id,
            billed,
            released = held - billed,
            used = entry.account.used,
            limit = entry.account.limit,
            "Quota committed"
        );
        Ok(entry.account.clone())
    }

    async fn release(&self, reservation: &Reservation) -> QuotaResult<()> {
        let entry = self.entry(reservation.account_id).await?;
        let mut entry = entry.lock().await;

        let held = entry
            .outstanding
            .remove(&reservation.id)
            .ok_or(QuotaError::AlreadySettled)?;
        entry.account.reserved = entry.account.reserved.saturating_sub(held);

        debug!(account = %reservation.account_id, reservation = %reservation.id, held, "Quota released");
        Ok(())
    }
}
