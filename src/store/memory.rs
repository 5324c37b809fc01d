// src/store/memory.rs
use super::{newest_first, HoldingChange, LedgerStore, TradeCommit, UserGuard, UserLocks};
use crate::error::StoreError;
use crate::models::{Holding, Transaction, User};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Books {
    users: HashMap<String, User>,
    usernames: HashMap<String, String>,
    emails: HashMap<String, String>,
    holdings: HashMap<String, BTreeMap<String, Holding>>,
    transactions: HashMap<String, Vec<Transaction>>,
}

/// In-process ledger. A trade commit is applied under one write lock, so
/// readers never see half of it.
#[derive(Default)]
pub struct MemoryLedger {
    books: RwLock<Books>,
    locks: UserLocks,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.books.read().users.get(user_id).cloned())
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut books = self.books.write();
        if books.usernames.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!(
                "username {} is taken",
                user.username
            )));
        }
        if books.emails.contains_key(&user.email) {
            return Err(StoreError::Conflict(format!("email {} is taken", user.email)));
        }
        if books.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user id {} exists", user.id)));
        }
        books
            .usernames
            .insert(user.username.clone(), user.id.clone());
        books.emails.insert(user.email.clone(), user.id.clone());
        books.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.books
            .write()
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_holding(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<Holding>, StoreError> {
        Ok(self
            .books
            .read()
            .holdings
            .get(user_id)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .cloned())
    }

    async fn upsert_holding(&self, holding: &Holding) -> Result<(), StoreError> {
        self.books.write().apply_holding(HoldingChange::Upsert(holding.clone()));
        Ok(())
    }

    async fn delete_holding(&self, user_id: &str, symbol: &str) -> Result<(), StoreError> {
        self.books.write().apply_holding(HoldingChange::Delete {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        self.books
            .write()
            .transactions
            .entry(transaction.user_id.clone())
            .or_default()
            .push(transaction.clone());
        Ok(())
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError> {
        let mut transactions = self
            .books
            .read()
            .transactions
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        newest_first(&mut transactions);
        Ok(transactions)
    }

    async fn list_holdings(&self, user_id: &str) -> Result<Vec<Holding>, StoreError> {
        Ok(self
            .books
            .read()
            .holdings
            .get(user_id)
            .map(|by_symbol| by_symbol.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn lock_user(&self, user_id: &str) -> Result<UserGuard, StoreError> {
        Ok(self.locks.acquire(user_id).await)
    }

    async fn commit_trade(&self, commit: &TradeCommit) -> Result<(), StoreError> {
        let mut books = self.books.write();
        if !books.users.contains_key(&commit.user.id) {
            return Err(StoreError::Corrupt(format!(
                "commit for unknown user {}",
                commit.user.id
            )));
        }
        books
            .users
            .insert(commit.user.id.clone(), commit.user.clone());
        books.apply_holding(commit.holding.clone());
        books
            .transactions
            .entry(commit.transaction.user_id.clone())
            .or_default()
            .push(commit.transaction.clone());
        Ok(())
    }
}

impl Books {
    fn apply_holding(&mut self, change: HoldingChange) {
        match change {
            HoldingChange::Upsert(holding) => {
                self.holdings
                    .entry(holding.user_id.clone())
                    .or_default()
                    .insert(holding.symbol.clone(), holding);
            }
            HoldingChange::Delete { user_id, symbol } => {
                if let Some(by_symbol) = self.holdings.get_mut(&user_id) {
                    by_symbol.remove(&symbol);
                }
            }
        }
    }
}
