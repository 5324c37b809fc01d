// src/models.rs
use crate::error::TradeError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A simulated trading account. Carries identity and cash only; credentials
/// live with the external auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub cash: Decimal,
    pub created_at: DateTime<Utc>,
    /// Number of trades committed for this user.
    pub version: i64,
}

/// A user's open position in one symbol. Never stored with quantity 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub avg_cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    Buy,
    Sell,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Buy => "BUY",
            TradeKind::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeKind::Buy),
            "SELL" => Ok(TradeKind::Sell),
            other => Err(format!("unknown trade kind {other:?}")),
        }
    }
}

/// Immutable ledger entry appended by every successful trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: TradeKind,
    pub symbol: String,
    pub quantity: i64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// The user's `version` after this trade; breaks timestamp ties.
    pub seq: i64,
}

/// A validated order. Only obtainable through [`Order::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    symbol: String,
    quantity: i64,
    price: Decimal,
}

impl Order {
    pub fn new(symbol: &str, quantity: i64, price: Decimal) -> Result<Self, TradeError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(TradeError::InvalidOrder("symbol is required".into()));
        }
        if quantity <= 0 {
            return Err(TradeError::InvalidOrder(format!(
                "quantity must be a positive integer, got {quantity}"
            )));
        }
        if price <= Decimal::ZERO {
            return Err(TradeError::InvalidOrder(format!(
                "price must be positive, got {price}"
            )));
        }
        Ok(Order {
            symbol,
            quantity,
            price,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    /// `quantity * price`, failing on decimal overflow.
    pub fn notional(&self) -> Result<Decimal, TradeError> {
        Decimal::from(self.quantity)
            .checked_mul(self.price)
            .ok_or_else(|| TradeError::InvalidOrder("order value overflows".into()))
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Untrusted trade payload as it arrives over HTTP.
#[derive(Debug, Default, Deserialize)]
pub struct OrderRequest {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub quantity: Option<serde_json::Number>,
    #[serde(default)]
    pub price: Option<serde_json::Number>,
}

impl OrderRequest {
    /// Coerce the payload into `(symbol, quantity, price)`; range checks are
    /// left to [`Order::new`].
    pub fn into_parts(self) -> Result<(String, i64, Decimal), TradeError> {
        let symbol = self
            .symbol
            .ok_or_else(|| TradeError::InvalidOrder("symbol is required".into()))?;
        let quantity = self
            .quantity
            .ok_or_else(|| TradeError::InvalidOrder("quantity is required".into()))
            .and_then(|n| whole_number(&n))?;
        let price = self
            .price
            .ok_or_else(|| TradeError::InvalidOrder("price is required".into()))
            .and_then(|n| decimal_number(&n))?;
        Ok((symbol, quantity, price))
    }
}

fn whole_number(n: &serde_json::Number) -> Result<i64, TradeError> {
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        // 2^53: beyond this an f64 no longer represents every integer
        Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => Ok(f as i64),
        _ => Err(TradeError::InvalidOrder(format!(
            "quantity must be a whole number, got {n}"
        ))),
    }
}

fn decimal_number(n: &serde_json::Number) -> Result<Decimal, TradeError> {
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| TradeError::InvalidOrder(format!("price {text} is not a valid decimal")))
}

/// Account opening payload.
#[derive(Debug, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
}

/// State after a successful trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub user: User,
    pub holding: Option<Holding>,
    pub transaction: Transaction,
}

/// Read-only snapshot for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Portfolio {
    pub user: User,
    pub holdings: Vec<Holding>,
    pub transactions: Vec<Transaction>,
}
