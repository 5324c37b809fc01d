// src/store/mod.rs
//! Ledger persistence contract consumed by the trade engine and the
//! portfolio view.
//!
//! A trade is a read-modify-write on one user's records. Backends make that
//! indivisible with two pieces: [`LedgerStore::lock_user`] serializes trades
//! for a user, and [`LedgerStore::commit_trade`] writes the user, holding and
//! transaction as a single unit. Trades for different users share nothing
//! but the lock table.

mod memory;
mod scylla_store;

pub use memory::MemoryLedger;
pub use scylla_store::ScyllaLedger;

use crate::error::StoreError;
use crate::models::{Holding, TradeOutcome, Transaction, User};
use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the username or email is taken,
    /// leaving nothing behind.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;

    async fn save_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_holding(&self, user_id: &str, symbol: &str)
        -> Result<Option<Holding>, StoreError>;

    async fn upsert_holding(&self, holding: &Holding) -> Result<(), StoreError>;

    async fn delete_holding(&self, user_id: &str, symbol: &str) -> Result<(), StoreError>;

    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    /// Most recent first.
    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError>;

    /// Ordered by symbol.
    async fn list_holdings(&self, user_id: &str) -> Result<Vec<Holding>, StoreError>;

    async fn lock_user(&self, user_id: &str) -> Result<UserGuard, StoreError>;

    /// Applies every write in `commit` or none of them.
    async fn commit_trade(&self, commit: &TradeCommit) -> Result<(), StoreError>;
}

/// What a trade does to a holding.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldingChange {
    Upsert(Holding),
    Delete { user_id: String, symbol: String },
}

/// The complete write set of one trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeCommit {
    pub user: User,
    pub holding: HoldingChange,
    pub transaction: Transaction,
}

impl TradeCommit {
    pub fn into_outcome(self) -> TradeOutcome {
        let holding = match self.holding {
            HoldingChange::Upsert(holding) => Some(holding),
            HoldingChange::Delete { .. } => None,
        };
        TradeOutcome {
            user: self.user,
            holding,
            transaction: self.transaction,
        }
    }
}

/// Per-user async mutexes. An entry lives only while someone holds or waits
/// on it.
#[derive(Default)]
pub struct UserLocks {
    locks: LockTable,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: &str) -> UserGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(user_id.to_string()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        UserGuard {
            guard: Some(guard),
            lock,
            table: self.locks.clone(),
            user_id: user_id.to_string(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held for the duration of one trade; dropping it admits the next trade for
/// the same user.
pub struct UserGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    table: LockTable,
    user_id: String,
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.table.lock();
        // One reference in the table plus ours: nobody is queued behind us.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.user_id);
        }
        // Waiters that timed out leave entries nobody references.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Runs a store future, turning an expired deadline into [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit.as_millis())),
    }
}

/// Re-runs an idempotent read while it keeps failing with a transient fault.
/// Conflicts and corrupt records are returned immediately.
pub async fn retry_reads<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e @ (StoreError::Conflict(_) | StoreError::Corrupt(_))) => return Err(e),
            Err(e) if attempt < attempts => {
                warn!("Store read failed (attempt {}/{}): {}", attempt, attempts, e);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Sorts newest first by `(timestamp, seq)`. Expects `transactions` in
/// insertion order so full ties keep the later insert first.
pub(crate) fn newest_first(transactions: &mut [Transaction]) {
    transactions.reverse();
    transactions.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.seq.cmp(&a.seq))
    });
}
