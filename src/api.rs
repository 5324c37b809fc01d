// src/api.rs
use crate::auth::with_user;
use crate::config::Config;
use crate::engine::TradeEngine;
use crate::error::{ApiError, TradeError};
use crate::models::{NewAccount, OrderRequest, TradeKind};
use crate::portfolio::PortfolioService;
use crate::quotes::QuoteSource;
use crate::store::LedgerStore;
use log::{error, info, warn};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Everything the handlers need, cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub engine: TradeEngine,
    pub portfolio: PortfolioService,
    pub quotes: Arc<dyn QuoteSource>,
    pub jwt_secret: Arc<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn LedgerStore>, quotes: Arc<dyn QuoteSource>, config: &Config) -> Self {
        AppState {
            engine: TradeEngine::new(
                store.clone(),
                config.store_timeout,
                config.store_read_attempts,
            ),
            portfolio: PortfolioService::new(
                store,
                config.store_timeout,
                config.store_read_attempts,
                config.starting_cash,
            ),
            quotes,
            jwt_secret: Arc::new(config.jwt_secret.clone()),
        }
    }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let secret = state.jwt_secret.clone();

    let health = warp::path::end().and(warp::get()).map(|| "API Running");

    let open_account = warp::path("accounts")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(open_account_handler);

    let portfolio = warp::path("portfolio")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_user(secret.clone()))
        .and(with_state(state.clone()))
        .and_then(get_portfolio_handler);

    let buy = warp::path!("portfolio" / "buy")
        .and(warp::post())
        .and(with_user(secret.clone()))
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(buy_handler);

    let sell = warp::path!("portfolio" / "sell")
        .and(warp::post())
        .and(with_user(secret.clone()))
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(sell_handler);

    let quote = warp::path!("quote" / String)
        .and(warp::get())
        .and(with_user(secret))
        .and(with_state(state))
        .and_then(quote_handler);

    health
        .or(open_account)
        .or(portfolio)
        .or(buy)
        .or(sell)
        .or(quote)
        .recover(handle_rejection)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// Raw bytes so a malformed payload becomes a named error instead of a
// generic body rejection.
fn json_body() -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

fn reject(err: impl Into<ApiError>) -> Rejection {
    warp::reject::custom(err.into())
}

async fn open_account_handler(state: AppState, body: Bytes) -> Result<impl Reply, Rejection> {
    let account: NewAccount = serde_json::from_slice(&body)
        .map_err(|e| reject(TradeError::InvalidAccount(format!("malformed account: {e}"))))?;
    match state
        .portfolio
        .open_account(&account.username, &account.email)
        .await
    {
        Ok(user) => Ok(warp::reply::with_status(
            warp::reply::json(&user),
            StatusCode::CREATED,
        )),
        Err(e) => {
            log_failure("open account", &e);
            Err(reject(e))
        }
    }
}

async fn get_portfolio_handler(user_id: String, state: AppState) -> Result<impl Reply, Rejection> {
    match state.portfolio.get_portfolio(&user_id).await {
        Ok(portfolio) => {
            info!("Portfolio retrieved for user {}.", user_id);
            Ok(warp::reply::json(&portfolio))
        }
        Err(e) => {
            log_failure("retrieve portfolio", &e);
            Err(reject(e))
        }
    }
}

async fn buy_handler(
    user_id: String,
    state: AppState,
    body: Bytes,
) -> Result<impl Reply, Rejection> {
    trade(TradeKind::Buy, user_id, state, body).await
}

async fn sell_handler(
    user_id: String,
    state: AppState,
    body: Bytes,
) -> Result<impl Reply, Rejection> {
    trade(TradeKind::Sell, user_id, state, body).await
}

async fn trade(
    kind: TradeKind,
    user_id: String,
    state: AppState,
    body: Bytes,
) -> Result<warp::reply::Json, Rejection> {
    let request: OrderRequest = serde_json::from_slice(&body)
        .map_err(|e| reject(TradeError::InvalidOrder(format!("malformed order: {e}"))))?;
    let (symbol, quantity, price) = request.into_parts().map_err(reject)?;

    let result = match kind {
        TradeKind::Buy => {
            state
                .engine
                .execute_buy(&user_id, &symbol, quantity, price)
                .await
        }
        TradeKind::Sell => {
            state
                .engine
                .execute_sell(&user_id, &symbol, quantity, price)
                .await
        }
    };

    match result {
        Ok(outcome) => {
            let msg = match kind {
                TradeKind::Buy => "Stock purchased successfully",
                TradeKind::Sell => "Stock sold successfully",
            };
            Ok(warp::reply::json(&json!({
                "msg": msg,
                "user": outcome.user,
                "holding": outcome.holding,
                "transaction": outcome.transaction,
            })))
        }
        Err(e) => {
            log_failure(&format!("{kind} for user {user_id}"), &e);
            Err(reject(e))
        }
    }
}

async fn quote_handler(symbol: String, _user_id: String, state: AppState) -> Result<impl Reply, Rejection> {
    match state.quotes.quote(&symbol).await {
        Ok(Some(quote)) => Ok(warp::reply::json(&quote)),
        Ok(None) => Err(reject(ApiError::QuoteNotFound(symbol))),
        Err(e) => {
            error!("Quote lookup for {} failed: {}", symbol, e);
            Err(reject(ApiError::QuoteUnavailable(e.to_string())))
        }
    }
}

fn log_failure(action: &str, err: &TradeError) {
    if err.is_retryable() {
        error!("Failed to {}: {}", action, err);
    } else {
        warn!("Rejected {}: {}", action, err);
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, kind, message) = if let Some(api) = err.find::<ApiError>() {
        match api {
            ApiError::Trade(e) => (e.status(), e.kind(), e.to_string()),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "Unauthorized", m.clone()),
            ApiError::QuoteNotFound(symbol) => (
                StatusCode::NOT_FOUND,
                "QuoteNotFound",
                format!("stock symbol {symbol} not found"),
            ),
            ApiError::QuoteUnavailable(m) => {
                (StatusCode::BAD_GATEWAY, "QuoteUnavailable", m.clone())
            }
        }
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "NotFound", "route not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            "method not allowed".to_string(),
        )
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "PayloadTooLarge",
            format!("request body exceeds {MAX_BODY_BYTES} bytes"),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            "LengthRequired",
            "content-length header is required".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal",
            "internal server error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": kind, "message": message })),
        status,
    ))
}
