// src/portfolio.rs
use crate::error::{StoreError, TradeError};
use crate::models::{Portfolio, User};
use crate::store::{bounded, retry_reads, LedgerStore};
use chrono::Utc;
use log::info;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Read side of the ledger plus account provisioning.
#[derive(Clone)]
pub struct PortfolioService {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
    read_attempts: u32,
    starting_cash: Decimal,
}

impl PortfolioService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        timeout: Duration,
        read_attempts: u32,
        starting_cash: Decimal,
    ) -> Self {
        PortfolioService {
            store,
            timeout,
            read_attempts,
            starting_cash,
        }
    }

    /// Cash, holdings and newest-first history. Takes no user lock, so it may
    /// trail a trade that is still in flight.
    pub async fn get_portfolio(&self, user_id: &str) -> Result<Portfolio, TradeError> {
        let store = self.store.as_ref();
        let user = retry_reads(self.read_attempts, || {
            bounded(self.timeout, store.get_user(user_id))
        })
        .await?
        .ok_or_else(|| TradeError::UserNotFound(user_id.to_string()))?;

        let (holdings, transactions) = retry_reads(self.read_attempts, || async {
            let holdings = bounded(self.timeout, store.list_holdings(user_id)).await?;
            let transactions = bounded(self.timeout, store.list_transactions(user_id)).await?;
            Ok::<_, StoreError>((holdings, transactions))
        })
        .await?;

        Ok(Portfolio {
            user,
            holdings,
            transactions,
        })
    }

    /// Opens an account funded with the configured starting cash.
    pub async fn open_account(&self, username: &str, email: &str) -> Result<User, TradeError> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() {
            return Err(TradeError::InvalidAccount("username is required".into()));
        }
        if !valid_email(email) {
            return Err(TradeError::InvalidAccount(format!(
                "{email:?} is not an email address"
            )));
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            cash: self.starting_cash,
            created_at: Utc::now(),
            version: 0,
        };
        bounded(self.timeout, self.store.create_user(&user)).await?;
        info!("Opened account {} for {}", user.id, user.username);
        Ok(user)
    }
}

fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}
