// src/quotes.rs
use crate::models::normalize_symbol;
use async_trait::async_trait;
use log::{error, info};
use rand::Rng;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

const ALPHAVANTAGE_URL: &str = "https://www.alphavantage.co/query";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub price: Decimal,
}

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("quote provider returned HTTP {0}")]
    Status(u16),

    #[error("quote provider sent an unreadable price {0:?}")]
    BadPrice(String),
}

/// Current price lookup. `Ok(None)` means the symbol is unknown.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, QuoteError>;
}

struct Listing {
    symbol: &'static str,
    name: &'static str,
    sector: &'static str,
    cents: i64,
}

static LISTINGS: [Listing; 9] = [
    Listing { symbol: "AAPL", name: "Apple Inc.", sector: "Technology", cents: 17550 },
    Listing { symbol: "GOOGL", name: "Alphabet Inc.", sector: "Technology", cents: 14020 },
    Listing { symbol: "MSFT", name: "Microsoft Corp.", sector: "Technology", cents: 34075 },
    Listing { symbol: "AMZN", name: "Amazon.com, Inc.", sector: "Consumer Cyclical", cents: 13510 },
    Listing { symbol: "TSLA", name: "Tesla, Inc.", sector: "Consumer Cyclical", cents: 25080 },
    Listing { symbol: "JPM", name: "JPMorgan Chase & Co.", sector: "Financial Services", cents: 15545 },
    Listing { symbol: "V", name: "Visa Inc.", sector: "Financial Services", cents: 24090 },
    Listing { symbol: "SPY", name: "SPDR S&P 500 ETF", sector: "ETF", cents: 45030 },
    Listing { symbol: "QQQ", name: "Invesco QQQ Trust", sector: "ETF", cents: 38060 },
];

/// Fixed listing table with up to ±0.5% jitter per lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockQuotes;

impl MockQuotes {
    /// Reference price before jitter.
    pub fn base_price(symbol: &str) -> Option<Decimal> {
        let symbol = normalize_symbol(symbol);
        LISTINGS
            .iter()
            .find(|l| l.symbol == symbol)
            .map(|l| Decimal::new(l.cents, 2))
    }
}

#[async_trait]
impl QuoteSource for MockQuotes {
    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let symbol = normalize_symbol(symbol);
        let listing = match LISTINGS.iter().find(|l| l.symbol == symbol) {
            Some(listing) => listing,
            None => return Ok(None),
        };
        let jitter_bps: i64 = rand::thread_rng().gen_range(-50..=50);
        let factor = Decimal::ONE + Decimal::new(jitter_bps, 4);
        Ok(Some(Quote {
            symbol,
            name: Some(listing.name.to_string()),
            sector: Some(listing.sector.to_string()),
            price: (Decimal::new(listing.cents, 2) * factor).round_dp(2),
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote", default)]
    quote: Option<GlobalQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol", default)]
    symbol: Option<String>,
    #[serde(rename = "05. price", default)]
    price: Option<String>,
}

/// Live prices from Alpha Vantage's GLOBAL_QUOTE endpoint.
pub struct AlphaVantageQuotes {
    client: Client,
    api_key: String,
}

impl AlphaVantageQuotes {
    pub fn new(client: Client, api_key: String) -> Self {
        AlphaVantageQuotes { client, api_key }
    }
}

#[async_trait]
impl QuoteSource for AlphaVantageQuotes {
    async fn quote(&self, symbol: &str) -> Result<Option<Quote>, QuoteError> {
        let symbol = normalize_symbol(symbol);
        info!("Fetching quote for {} from provider.", symbol);
        let response = self
            .client
            .get(ALPHAVANTAGE_URL)
            .query(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", symbol.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            error!(
                "Failed to fetch quote from provider: HTTP {}",
                response.status()
            );
            return Err(QuoteError::Status(response.status().as_u16()));
        }
        let body = response.json::<GlobalQuoteResponse>().await?;
        global_quote(body)
    }
}

fn global_quote(body: GlobalQuoteResponse) -> Result<Option<Quote>, QuoteError> {
    let quote = match body.quote {
        Some(quote) => quote,
        None => return Ok(None),
    };
    let (symbol, raw_price) = match (quote.symbol, quote.price) {
        (Some(symbol), Some(price)) => (symbol, price),
        _ => return Ok(None),
    };
    let price = Decimal::from_str(raw_price.trim()).map_err(|_| QuoteError::BadPrice(raw_price))?;
    Ok(Some(Quote {
        symbol,
        name: None,
        sector: None,
        price,
    }))
}
