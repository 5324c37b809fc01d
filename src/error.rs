// src/error.rs
use rust_decimal::Decimal;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;

/// Failures raised by a ledger backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0} ms")]
    Timeout(u128),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt ledger record: {0}")]
    Corrupt(String),

    #[error("conflicting record: {0}")]
    Conflict(String),
}

/// Every named failure a trade, account or portfolio request can report.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("no holding for symbol {0}")]
    NoSuchHolding(String),

    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("insufficient shares of {symbol}: held {held}, requested {requested}")]
    InsufficientShares {
        symbol: String,
        held: i64,
        requested: i64,
    },

    #[error("invalid account: {0}")]
    InvalidAccount(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("ledger store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for TradeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => TradeError::AccountExists(what),
            other => TradeError::StoreUnavailable(other.to_string()),
        }
    }
}

impl TradeError {
    /// Stable name reported to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            TradeError::InvalidOrder(_) => "InvalidOrder",
            TradeError::UserNotFound(_) => "UserNotFound",
            TradeError::NoSuchHolding(_) => "NoSuchHolding",
            TradeError::InsufficientFunds { .. } => "InsufficientFunds",
            TradeError::InsufficientShares { .. } => "InsufficientShares",
            TradeError::InvalidAccount(_) => "InvalidAccount",
            TradeError::AccountExists(_) => "AccountExists",
            TradeError::StoreUnavailable(_) => "StoreUnavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TradeError::UserNotFound(_) => StatusCode::NOT_FOUND,
            TradeError::AccountExists(_) => StatusCode::CONFLICT,
            TradeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Only transient infrastructure faults may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradeError::StoreUnavailable(_))
    }
}

/// Rejection carried through warp filters until `api::handle_rejection`.
#[derive(Debug)]
pub enum ApiError {
    Trade(TradeError),
    Unauthorized(String),
    QuoteNotFound(String),
    QuoteUnavailable(String),
}

impl From<TradeError> for ApiError {
    fn from(err: TradeError) -> Self {
        ApiError::Trade(err)
    }
}

impl Reject for ApiError {}
