// src/store/scylla_store.rs
use super::{HoldingChange, LedgerStore, TradeCommit, UserGuard, UserLocks};
use crate::error::StoreError;
use crate::models::{Holding, Transaction, User};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info};
use rust_decimal::Decimal;
use scylla::batch::{Batch, BatchType};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::query::Query;
use scylla::{Session, SessionBuilder};
use std::str::FromStr;

const SCHEMA: [&str; 6] = [
    "CREATE KEYSPACE IF NOT EXISTS stock_simulator WITH REPLICATION = {'class': 'SimpleStrategy', 'replication_factor': 1}",
    "CREATE TABLE IF NOT EXISTS stock_simulator.users (user_id TEXT PRIMARY KEY, username TEXT, email TEXT, cash TEXT, created_at BIGINT, version BIGINT)",
    "CREATE TABLE IF NOT EXISTS stock_simulator.users_by_username (username TEXT PRIMARY KEY, user_id TEXT)",
    "CREATE TABLE IF NOT EXISTS stock_simulator.users_by_email (email TEXT PRIMARY KEY, user_id TEXT)",
    "CREATE TABLE IF NOT EXISTS stock_simulator.holdings (user_id TEXT, symbol TEXT, quantity BIGINT, avg_cost TEXT, PRIMARY KEY (user_id, symbol))",
    "CREATE TABLE IF NOT EXISTS stock_simulator.transactions (user_id TEXT, ts BIGINT, seq BIGINT, id TEXT, kind TEXT, symbol TEXT, quantity BIGINT, price TEXT, PRIMARY KEY (user_id, ts, seq)) WITH CLUSTERING ORDER BY (ts DESC, seq DESC)",
];

const INSERT_USER: &str = "INSERT INTO stock_simulator.users (user_id, username, email, cash, created_at, version) VALUES (?, ?, ?, ?, ?, ?)";
const DELETE_USER: &str = "DELETE FROM stock_simulator.users WHERE user_id = ?";
const CLAIM_USERNAME: &str =
    "INSERT INTO stock_simulator.users_by_username (username, user_id) VALUES (?, ?) IF NOT EXISTS";
const RELEASE_USERNAME: &str =
    "DELETE FROM stock_simulator.users_by_username WHERE username = ? IF user_id = ?";
const CLAIM_EMAIL: &str =
    "INSERT INTO stock_simulator.users_by_email (email, user_id) VALUES (?, ?) IF NOT EXISTS";
const RELEASE_EMAIL: &str =
    "DELETE FROM stock_simulator.users_by_email WHERE email = ? IF user_id = ?";
const UPDATE_USER: &str =
    "UPDATE stock_simulator.users SET cash = ?, version = ? WHERE user_id = ?";
const UPSERT_HOLDING: &str =
    "INSERT INTO stock_simulator.holdings (user_id, symbol, quantity, avg_cost) VALUES (?, ?, ?, ?)";
const DELETE_HOLDING: &str =
    "DELETE FROM stock_simulator.holdings WHERE user_id = ? AND symbol = ?";
const INSERT_TRANSACTION: &str = "INSERT INTO stock_simulator.transactions (user_id, ts, seq, id, kind, symbol, quantity, price) VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

/// Ledger kept in ScyllaDB. Every table is partitioned by `user_id`; a trade
/// commit goes out as one logged batch.
pub struct ScyllaLedger {
    session: Session,
    locks: UserLocks,
}

impl ScyllaLedger {
    pub async fn connect(node: &str) -> Result<Self, StoreError> {
        let session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .map_err(backend)?;

        for statement in SCHEMA {
            session.query(statement, &[]).await.map_err(backend)?;
        }

        info!("Successfully connected to ScyllaDB at {}.", node);
        Ok(ScyllaLedger {
            session,
            locks: UserLocks::default(),
        })
    }

    async fn claim(&self, statement: &str, key: &str, user_id: &str) -> Result<bool, StoreError> {
        let result = self
            .session
            .query(statement, (key, user_id))
            .await
            .map_err(backend)?;
        Ok(applied(result.rows))
    }

    /// Best-effort removal of a half-created account. Claims are released
    /// only if they still point at this user.
    async fn unwind_user(&self, user: &User) {
        let releases = [
            (RELEASE_USERNAME, user.username.as_str()),
            (RELEASE_EMAIL, user.email.as_str()),
        ];
        for (statement, key) in releases {
            if let Err(e) = self.session.query(statement, (key, user.id.as_str())).await {
                error!("Failed to release claim {:?} for user {}: {}", key, user.id, e);
            }
        }
        if let Err(e) = self.session.query(DELETE_USER, (user.id.as_str(),)).await {
            error!("Failed to remove half-created user {}: {}", user.id, e);
        }
    }

    async fn rows(&self, query: Query, user_id: &str) -> Result<Vec<Row>, StoreError> {
        let result = self.session.query(query, (user_id,)).await.map_err(backend)?;
        Ok(result.rows.unwrap_or_default())
    }
}

#[async_trait]
impl LedgerStore for ScyllaLedger {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let query = Query::new(
            "SELECT user_id, username, email, cash, created_at, version FROM stock_simulator.users WHERE user_id = ?",
        );
        self.rows(query, user_id)
            .await?
            .first()
            .map(user_from_row)
            .transpose()
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        // A fresh id cannot clash, so the row goes in first and the claims
        // decide whether it stays.
        self.session
            .query(
                INSERT_USER,
                (
                    user.id.as_str(),
                    user.username.as_str(),
                    user.email.as_str(),
                    user.cash.to_string(),
                    user.created_at.timestamp_millis(),
                    user.version,
                ),
            )
            .await
            .map_err(backend)?;

        let outcome = match self.claim(CLAIM_USERNAME, &user.username, &user.id).await {
            Ok(true) => match self.claim(CLAIM_EMAIL, &user.email, &user.id).await {
                Ok(true) => return Ok(()),
                Ok(false) => Err(StoreError::Conflict(format!(
                    "email {} is taken",
                    user.email
                ))),
                Err(e) => Err(e),
            },
            Ok(false) => Err(StoreError::Conflict(format!(
                "username {} is taken",
                user.username
            ))),
            Err(e) => Err(e),
        };
        self.unwind_user(user).await;
        outcome
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.session
            .query(
                UPDATE_USER,
                (user.cash.to_string(), user.version, user.id.as_str()),
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_holding(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<Holding>, StoreError> {
        let query = Query::new(
            "SELECT user_id, symbol, quantity, avg_cost FROM stock_simulator.holdings WHERE user_id = ? AND symbol = ?",
        );
        let result = self
            .session
            .query(query, (user_id, symbol))
            .await
            .map_err(backend)?;
        result
            .rows
            .unwrap_or_default()
            .first()
            .map(holding_from_row)
            .transpose()
    }

    async fn upsert_holding(&self, holding: &Holding) -> Result<(), StoreError> {
        self.session
            .query(UPSERT_HOLDING, holding_values(holding))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_holding(&self, user_id: &str, symbol: &str) -> Result<(), StoreError> {
        self.session
            .query(DELETE_HOLDING, (user_id, symbol))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        self.session
            .query(INSERT_TRANSACTION, transaction_values(transaction))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError> {
        let query = Query::new(
            "SELECT user_id, ts, seq, id, kind, symbol, quantity, price FROM stock_simulator.transactions WHERE user_id = ?",
        );
        let transactions = self
            .rows(query, user_id)
            .await?
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Fetched {} transactions for user: {}",
            transactions.len(),
            user_id
        );
        Ok(transactions)
    }

    async fn list_holdings(&self, user_id: &str) -> Result<Vec<Holding>, StoreError> {
        let query = Query::new(
            "SELECT user_id, symbol, quantity, avg_cost FROM stock_simulator.holdings WHERE user_id = ?",
        );
        self.rows(query, user_id)
            .await?
            .iter()
            .map(holding_from_row)
            .collect()
    }

    async fn lock_user(&self, user_id: &str) -> Result<UserGuard, StoreError> {
        Ok(self.locks.acquire(user_id).await)
    }

    async fn commit_trade(&self, commit: &TradeCommit) -> Result<(), StoreError> {
        let user = &commit.user;
        let user_values = (user.cash.to_string(), user.version, user.id.as_str());
        let tx_values = transaction_values(&commit.transaction);

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(Query::new(UPDATE_USER));
        let outcome = match &commit.holding {
            HoldingChange::Upsert(holding) => {
                batch.append_statement(Query::new(UPSERT_HOLDING));
                batch.append_statement(Query::new(INSERT_TRANSACTION));
                self.session
                    .batch(&batch, (user_values, holding_values(holding), tx_values))
                    .await
            }
            HoldingChange::Delete { user_id, symbol } => {
                batch.append_statement(Query::new(DELETE_HOLDING));
                batch.append_statement(Query::new(INSERT_TRANSACTION));
                self.session
                    .batch(
                        &batch,
                        (user_values, (user_id.as_str(), symbol.as_str()), tx_values),
                    )
                    .await
            }
        };
        outcome.map_err(|e| {
            error!("Trade batch for user {} failed: {}", user.id, e);
            backend(e)
        })?;
        Ok(())
    }
}

/// First column of an LWT response is the `[applied]` flag.
fn applied(rows: Option<Vec<Row>>) -> bool {
    rows.unwrap_or_default()
        .first()
        .map(|row| matches!(row.columns.first(), Some(Some(CqlValue::Boolean(true)))))
        .unwrap_or(false)
}

fn backend(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn holding_values(holding: &Holding) -> (&str, &str, i64, String) {
    (
        holding.user_id.as_str(),
        holding.symbol.as_str(),
        holding.quantity,
        holding.avg_cost.to_string(),
    )
}

#[allow(clippy::type_complexity)]
fn transaction_values(
    tx: &Transaction,
) -> (&str, i64, i64, &str, &'static str, &str, i64, String) {
    (
        tx.user_id.as_str(),
        tx.timestamp.timestamp_millis(),
        tx.seq,
        tx.id.as_str(),
        tx.kind.as_str(),
        tx.symbol.as_str(),
        tx.quantity,
        tx.price.to_string(),
    )
}

fn text(row: &Row, idx: usize) -> Result<String, StoreError> {
    row.columns
        .get(idx)
        .and_then(|col| col.as_ref())
        .and_then(|v| v.as_text())
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(format!("expected text in column {idx}")))
}

fn bigint(row: &Row, idx: usize) -> Result<i64, StoreError> {
    row.columns
        .get(idx)
        .and_then(|col| col.as_ref())
        .and_then(|v| v.as_bigint())
        .ok_or_else(|| StoreError::Corrupt(format!("expected bigint in column {idx}")))
}

fn decimal(row: &Row, idx: usize) -> Result<Decimal, StoreError> {
    let raw = text(row, idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| StoreError::Corrupt(format!("bad decimal {raw:?} in column {idx}: {e}")))
}

fn millis(row: &Row, idx: usize) -> Result<DateTime<Utc>, StoreError> {
    let ms = bigint(row, idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {ms} in column {idx}")))
}

fn user_from_row(row: &Row) -> Result<User, StoreError> {
    Ok(User {
        id: text(row, 0)?,
        username: text(row, 1)?,
        email: text(row, 2)?,
        cash: decimal(row, 3)?,
        created_at: millis(row, 4)?,
        version: bigint(row, 5)?,
    })
}

fn holding_from_row(row: &Row) -> Result<Holding, StoreError> {
    Ok(Holding {
        user_id: text(row, 0)?,
        symbol: text(row, 1)?,
        quantity: bigint(row, 2)?,
        avg_cost: decimal(row, 3)?,
    })
}

fn transaction_from_row(row: &Row) -> Result<Transaction, StoreError> {
    let kind = text(row, 4)?;
    Ok(Transaction {
        user_id: text(row, 0)?,
        timestamp: millis(row, 1)?,
        seq: bigint(row, 2)?,
        id: text(row, 3)?,
        kind: kind.parse().map_err(StoreError::Corrupt)?,
        symbol: text(row, 5)?,
        quantity: bigint(row, 6)?,
        price: decimal(row, 7)?,
    })
}
