// src/config.rs
use log::warn;
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_JWT_SECRET: &str = "your_secret_key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    Scylla { node: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteBackend {
    Mock,
    AlphaVantage { api_key: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub ledger: LedgerBackend,
    pub quotes: QuoteBackend,
    pub jwt_secret: String,
    pub store_timeout: Duration,
    pub store_read_attempts: u32,
    pub starting_cash: Decimal,
}

impl Config {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind = parse(
            "STOCKSIM_BIND",
            get("STOCKSIM_BIND").unwrap_or_else(|| "127.0.0.1:3030".into()),
        )?;

        let ledger = match get("STOCKSIM_LEDGER").as_deref().unwrap_or("memory") {
            "memory" => LedgerBackend::Memory,
            "scylla" => LedgerBackend::Scylla {
                node: get("SCYLLA_NODE").unwrap_or_else(|| "127.0.0.1:9042".into()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "STOCKSIM_LEDGER",
                    value: other.to_string(),
                    reason: "expected memory or scylla".into(),
                })
            }
        };

        let quotes = match get("QUOTE_SOURCE").as_deref().unwrap_or("mock") {
            "mock" => QuoteBackend::Mock,
            "alphavantage" => QuoteBackend::AlphaVantage {
                api_key: get("ALPHAVANTAGE_API_KEY")
                    .ok_or(ConfigError::Missing("ALPHAVANTAGE_API_KEY"))?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    key: "QUOTE_SOURCE",
                    value: other.to_string(),
                    reason: "expected mock or alphavantage".into(),
                })
            }
        };

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set, using the development secret");
            DEFAULT_JWT_SECRET.to_string()
        });

        let timeout_ms: u64 = parse(
            "STORE_TIMEOUT_MS",
            get("STORE_TIMEOUT_MS").unwrap_or_else(|| "2000".into()),
        )?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "STORE_TIMEOUT_MS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let store_read_attempts: u32 = parse(
            "STORE_READ_ATTEMPTS",
            get("STORE_READ_ATTEMPTS").unwrap_or_else(|| "3".into()),
        )?;

        let starting_cash: Decimal = parse(
            "STARTING_CASH",
            get("STARTING_CASH").unwrap_or_else(|| "1000000".into()),
        )?;
        if starting_cash.is_sign_negative() {
            return Err(ConfigError::Invalid {
                key: "STARTING_CASH",
                value: starting_cash.to_string(),
                reason: "must not be negative".into(),
            });
        }

        Ok(Config {
            bind,
            ledger,
            quotes,
            jwt_secret,
            store_timeout: Duration::from_millis(timeout_ms),
            store_read_attempts: store_read_attempts.max(1),
            starting_cash,
        })
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}
