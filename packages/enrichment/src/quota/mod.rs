//! Per-account row quota with reserve/commit accounting.
//!
//! A batch reserves its row count before any network activity, then commits
//! the rows it actually processed exactly once. Commit is the only operation
//! that increases `used`; any unbilled part of the reservation is released.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryQuotaLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresQuotaLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuotaResult;
pub use crate::types::account::QuotaAccount;
use crate::types::account::AccountId;

/// Rows held against an account by one in-flight batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub account_id: AccountId,
    pub rows: u64,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(account_id: AccountId, rows: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            rows,
            created_at: Utc::now(),
        }
    }

    /// Rows to bill for `processed` rows; never more than were reserved.
    pub fn billable(&self, processed: u64) -> u64 {
        processed.min(self.rows)
    }
}

/// Storage for account quotas.
///
/// Every method is atomic per account.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Current state of an account, with the 30-day window applied.
    async fn account(&self, account_id: AccountId) -> QuotaResult<QuotaAccount>;

    /// Hold `rows` against the account.
    ///
    /// Fails with `QuotaExceeded` when `rows > limit - used - reserved`.
    async fn reserve(&self, account_id: AccountId, rows: u64) -> QuotaResult<Reservation>;

    /// Bill `processed` rows and settle the reservation.
    ///
    /// A reservation can be settled once; later calls fail with
    /// `AlreadySettled`. Returns the account after billing.
    async fn commit(&self, reservation: &Reservation, processed: u64) -> QuotaResult<QuotaAccount>;

    /// Settle the reservation without billing anything.
    async fn release(&self, reservation: &Reservation) -> QuotaResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billable_capped_at_reservation() {
        let reservation = Reservation::new(AccountId(1), 10);
        assert_eq!(reservation.billable(4), 4);
        assert_eq!(reservation.billable(10), 10);
        assert_eq!(reservation.billable(25), 10);
    }
}
