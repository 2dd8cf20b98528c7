//! Account, tier, and quota types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Quota limit above which an account is treated as premium.
pub const PREMIUM_LIMIT_THRESHOLD: u64 = 20_000;

/// Quota limit above which an account is treated as enterprise.
pub const ENTERPRISE_LIMIT_THRESHOLD: u64 = 50_000;

/// Length of a quota accounting window.
pub fn quota_window() -> Duration {
    Duration::days(30)
}

/// Identifier of a billing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service level controlling parallelism and fetch pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    Basic,
    Premium,
    Enterprise,
}

impl ServiceTier {
    /// Derive a tier from the account's monthly row allowance.
    pub fn from_quota_limit(limit: u64) -> Self {
        if limit > ENTERPRISE_LIMIT_THRESHOLD {
            Self::Enterprise
        } else if limit > PREMIUM_LIMIT_THRESHOLD {
            Self::Premium
        } else {
            Self::Basic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown service tier: {}", other)),
        }
    }
}

/// Account details supplied by the session layer for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountContext {
    pub account_id: AccountId,
    pub quota_limit: u64,
    pub quota_used: u64,
    pub window_start: DateTime<Utc>,
    /// Explicit tier; derived from `quota_limit` when absent
    #[serde(default)]
    pub service_tier: Option<ServiceTier>,
}

impl AccountContext {
    pub fn new(account_id: AccountId, quota_limit: u64) -> Self {
        Self {
            account_id,
            quota_limit,
            quota_used: 0,
            window_start: Utc::now(),
            service_tier: None,
        }
    }

    pub fn with_used(mut self, used: u64) -> Self {
        self.quota_used = used;
        self
    }

    pub fn with_window_start(mut self, window_start: DateTime<Utc>) -> Self {
        self.window_start = window_start;
        self
    }

    pub fn with_tier(mut self, tier: ServiceTier) -> Self {
        self.service_tier = Some(tier);
        self
    }

    /// The effective service tier.
    pub fn tier(&self) -> ServiceTier {
        self.service_tier
            .unwrap_or_else(|| ServiceTier::from_quota_limit(self.quota_limit))
    }

    /// Initial ledger state for this account.
    pub fn quota_account(&self) -> QuotaAccount {
        QuotaAccount {
            used: self.quota_used,
            limit: self.quota_limit,
            reserved: 0,
            window_start: self.window_start,
        }
    }
}

/// Row usage of one account within the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    /// Rows billed in the current window
    pub used: u64,
    /// Rows allowed per window
    pub limit: u64,
    /// Rows held by batches that have reserved but not yet committed
    pub reserved: u64,
    pub window_start: DateTime<Utc>,
}

impl QuotaAccount {
    pub fn new(limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            limit,
            reserved: 0,
            window_start: now,
        }
    }

    /// Start a new window if the current one has elapsed.
    ///
    /// Returns true when `used` was reset.
    pub fn refresh_window(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.window_start > quota_window() {
            self.used = 0;
            self.window_start = now;
            true
        } else {
            false
        }
    }

    /// Rows that may still be reserved.
    pub fn remaining(&self) -> u64 {
        self.limit
            .saturating_sub(self.used)
            .saturating_sub(self.reserved)
    }
}
