// src/engine.rs
//! Buy/sell execution against the ledger.
//!
//! Planning is pure: [`plan_buy`] and [`plan_sell`] take the current user and
//! holding and return the full write set of the trade. [`TradeEngine`] wraps
//! them with the per-user lock, the reads and the atomic commit.

use crate::error::{StoreError, TradeError};
use crate::models::{Holding, Order, TradeKind, TradeOutcome, Transaction, User};
use crate::store::{bounded, retry_reads, HoldingChange, LedgerStore, TradeCommit, UserGuard};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Quantity-weighted average cost after buying `bought_qty` at `bought_price`
/// on top of an existing position. `None` when the position cost does not
/// fit in a `Decimal`.
pub fn weighted_avg_cost(
    old_qty: i64,
    old_avg_cost: Decimal,
    bought_qty: i64,
    bought_price: Decimal,
) -> Option<Decimal> {
    let new_qty = Decimal::from(old_qty).checked_add(Decimal::from(bought_qty))?;
    if new_qty.is_zero() {
        return Some(Decimal::ZERO);
    }
    let held = old_avg_cost.checked_mul(Decimal::from(old_qty))?;
    let bought = bought_price.checked_mul(Decimal::from(bought_qty))?;
    held.checked_add(bought)?.checked_div(new_qty)
}

pub fn plan_buy(
    user: &User,
    holding: Option<&Holding>,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<TradeCommit, TradeError> {
    let total_cost = order.notional()?;
    if user.cash < total_cost {
        return Err(TradeError::InsufficientFunds {
            available: user.cash,
            required: total_cost,
        });
    }

    let holding = match holding {
        Some(existing) => {
            let quantity = existing
                .quantity
                .checked_add(order.quantity())
                .ok_or_else(|| TradeError::InvalidOrder("position size overflows".into()))?;
            let avg_cost = weighted_avg_cost(
                existing.quantity,
                existing.avg_cost,
                order.quantity(),
                order.price(),
            )
            .ok_or_else(|| TradeError::InvalidOrder("position cost overflows".into()))?;
            Holding {
                quantity,
                avg_cost,
                ..existing.clone()
            }
        }
        None => Holding {
            user_id: user.id.clone(),
            symbol: order.symbol().to_string(),
            quantity: order.quantity(),
            avg_cost: order.price(),
        },
    };

    let user = User {
        cash: user.cash - total_cost,
        version: user.version + 1,
        ..user.clone()
    };
    let transaction = record(&user, TradeKind::Buy, order, now);
    Ok(TradeCommit {
        user,
        holding: HoldingChange::Upsert(holding),
        transaction,
    })
}

pub fn plan_sell(
    user: &User,
    holding: Option<&Holding>,
    order: &Order,
    now: DateTime<Utc>,
) -> Result<TradeCommit, TradeError> {
    let existing =
        holding.ok_or_else(|| TradeError::NoSuchHolding(order.symbol().to_string()))?;
    if existing.quantity < order.quantity() {
        return Err(TradeError::InsufficientShares {
            symbol: order.symbol().to_string(),
            held: existing.quantity,
            requested: order.quantity(),
        });
    }
    let proceeds = order.notional()?;
    let cash = user
        .cash
        .checked_add(proceeds)
        .ok_or_else(|| TradeError::InvalidOrder("cash balance overflows".into()))?;

    // avg_cost is left as is: a sell realizes P&L but does not move the basis.
    let remaining = existing.quantity - order.quantity();
    let holding = if remaining == 0 {
        HoldingChange::Delete {
            user_id: existing.user_id.clone(),
            symbol: existing.symbol.clone(),
        }
    } else {
        HoldingChange::Upsert(Holding {
            quantity: remaining,
            ..existing.clone()
        })
    };

    let user = User {
        cash,
        version: user.version + 1,
        ..user.clone()
    };
    let transaction = record(&user, TradeKind::Sell, order, now);
    Ok(TradeCommit {
        user,
        holding,
        transaction,
    })
}

fn record(user: &User, kind: TradeKind, order: &Order, now: DateTime<Utc>) -> Transaction {
    Transaction {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        kind,
        symbol: order.symbol().to_string(),
        quantity: order.quantity(),
        price: order.price(),
        timestamp: now,
        seq: user.version,
    }
}

/// Executes trades against an injected [`LedgerStore`].
#[derive(Clone)]
pub struct TradeEngine {
    store: Arc<dyn LedgerStore>,
    timeout: Duration,
    read_attempts: u32,
}

impl TradeEngine {
    pub fn new(store: Arc<dyn LedgerStore>, timeout: Duration, read_attempts: u32) -> Self {
        TradeEngine {
            store,
            timeout,
            read_attempts,
        }
    }

    pub async fn execute_buy(
        &self,
        user_id: &str,
        symbol: &str,
        quantity: i64,
        price: Decimal,
    ) -> Result<TradeOutcome, TradeError> {
        let order = Order::new(symbol, quantity, price)?;
        self.execute(user_id, TradeKind::Buy, &order).await
    }

    pub async fn execute_sell(
        &self,
        user_id: &str,
        symbol: &str,
        quantity: i64,
        price: Decimal,
    ) -> Result<TradeOutcome, TradeError> {
        let order = Order::new(symbol, quantity, price)?;
        self.execute(user_id, TradeKind::Sell, &order).await
    }

    async fn execute(
        &self,
        user_id: &str,
        kind: TradeKind,
        order: &Order,
    ) -> Result<TradeOutcome, TradeError> {
        let store = self.store.as_ref();
        let guard = bounded(self.timeout, store.lock_user(user_id)).await?;

        // Reads under the lock may be retried; nothing has been written yet.
        let (user, holding) = retry_reads(self.read_attempts, || async {
            let user = bounded(self.timeout, store.get_user(user_id)).await?;
            let holding = bounded(self.timeout, store.get_holding(user_id, order.symbol())).await?;
            Ok::<_, StoreError>((user, holding))
        })
        .await?;
        let user = user.ok_or_else(|| TradeError::UserNotFound(user_id.to_string()))?;

        let commit = match kind {
            TradeKind::Buy => plan_buy(&user, holding.as_ref(), order, Utc::now())?,
            TradeKind::Sell => plan_sell(&user, holding.as_ref(), order, Utc::now())?,
        };

        // A commit is never retried: a timed-out batch may still land. The lock
        // stays held until the stored version tells us which way it went.
        if let Err(err) = bounded(self.timeout, store.commit_trade(&commit)).await {
            if matches!(err, StoreError::Timeout(_)) {
                tokio::time::sleep(self.timeout).await;
            }
            match self.landed(user_id, commit.user.version).await {
                Ok(true) => warn!(
                    "Commit for user {} reported \"{}\" but was applied.",
                    user_id, err
                ),
                Ok(false) => return Err(err.into()),
                Err(read_err) => {
                    error!(
                        "Outcome of {} for user {} is unknown ({}); holding the user until it settles.",
                        kind, user_id, read_err
                    );
                    self.settle_in_background(guard, user_id, commit.user.version);
                    return Err(err.into());
                }
            }
        }

        info!(
            "{} {} {} @ {} for user {} (cash now {})",
            kind,
            order.quantity(),
            order.symbol(),
            order.price(),
            user_id,
            commit.user.cash
        );
        Ok(commit.into_outcome())
    }

    /// Whether the user's stored version has reached `version`.
    async fn landed(&self, user_id: &str, version: i64) -> Result<bool, StoreError> {
        let store = self.store.as_ref();
        let user = retry_reads(self.read_attempts, || {
            bounded(self.timeout, store.get_user(user_id))
        })
        .await?;
        Ok(user.map_or(false, |u| u.version >= version))
    }

    fn settle_in_background(&self, guard: UserGuard, user_id: &str, version: i64) {
        let engine = self.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::time::sleep(engine.timeout).await;
                match engine.landed(&user_id, version).await {
                    Ok(landed) => {
                        info!(
                            "Commit for user {} settled (applied: {}); releasing lock.",
                            user_id, landed
                        );
                        break;
                    }
                    Err(e) => warn!("User {} still unsettled: {}", user_id, e),
                }
            }
        });
    }
}
