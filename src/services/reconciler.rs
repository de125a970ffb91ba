use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::balance_fetcher::BalanceFragments;
use crate::{
    error::AppError,
    models::{AccountAddress, PortfolioSnapshot},
};

/// Portfolio Reconciler - folds fetch results into an immutable snapshot
#[derive(Debug, Default)]
pub struct PortfolioReconciler {
    clock: SnapshotClock,
}

impl PortfolioReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the snapshot stamped with the account's next clock reading.
    pub fn reconcile(&self, account: AccountAddress, fragments: BalanceFragments) -> PortfolioSnapshot {
        let fetched_at = self.clock.stamp(&account);
        self.reconcile_at(account, fragments, fetched_at)
    }

    /// Builds the snapshot with a caller-supplied `fetched_at`, truncated to
    /// milliseconds so it matches the idempotency key exactly.
    pub fn reconcile_at(
        &self,
        account: AccountAddress,
        fragments: BalanceFragments,
        fetched_at: DateTime<Utc>,
    ) -> PortfolioSnapshot {
        if fragments.deadline_elapsed {
            tracing::debug!("Reconciling {} from a fetch cut short by its deadline", account);
        }
        let mut token_balances = BTreeMap::new();
        let mut missing = BTreeMap::new();

        for (symbol, result) in fragments.tokens {
            match result {
                Ok(entry) => {
                    token_balances.insert(symbol, entry);
                }
                Err(AppError::QueryFailed { reason, .. }) => {
                    missing.insert(symbol, reason);
                }
                Err(other) => {
                    missing.insert(symbol, other.to_string());
                }
            }
        }

        PortfolioSnapshot {
            account,
            native_balance: fragments.native,
            partial: !missing.is_empty(),
            token_balances,
            fetched_at: fetched_at.trunc_subsecs(3),
            missing,
        }
    }

    /// Tie-break between two snapshots of the same account: the later
    /// `fetched_at` wins, and on a tie the one that arrived last.
    pub fn newest<'a>(
        current: &'a Arc<PortfolioSnapshot>,
        incoming: &'a Arc<PortfolioSnapshot>,
    ) -> &'a Arc<PortfolioSnapshot> {
        if incoming.fetched_at >= current.fetched_at {
            incoming
        } else {
            current
        }
    }
}

/// Issues millisecond timestamps that strictly increase per account, so two
/// runs finishing in the same millisecond never share an idempotency key.
#[derive(Debug, Default)]
pub struct SnapshotClock {
    last: Mutex<HashMap<AccountAddress, DateTime<Utc>>>,
}

impl SnapshotClock {
    pub fn stamp(&self, account: &AccountAddress) -> DateTime<Utc> {
        self.stamp_at(account, Utc::now())
    }

    pub fn stamp_at(&self, account: &AccountAddress, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(3);
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stamped = match last.get(account) {
            Some(previous) if *previous >= now => *previous + TimeDelta::milliseconds(1),
            _ => now,
        };
        last.insert(*account, stamped);
        stamped
    }
}
