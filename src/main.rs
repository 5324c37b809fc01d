// src/main.rs
use env_logger::Builder;
use log::{error, info, LevelFilter};
use reqwest::Client;
use std::sync::Arc;
use stock_simulator::api::{self, AppState};
use stock_simulator::config::{Config, LedgerBackend, QuoteBackend};
use stock_simulator::quotes::{AlphaVantageQuotes, MockQuotes, QuoteSource};
use stock_simulator::store::{LedgerStore, MemoryLedger, ScyllaLedger};

#[tokio::main]
async fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let store: Arc<dyn LedgerStore> = match &config.ledger {
        LedgerBackend::Memory => {
            info!("Using in-memory ledger; state is lost on exit.");
            Arc::new(MemoryLedger::new())
        }
        LedgerBackend::Scylla { node } => match ScyllaLedger::connect(node).await {
            Ok(ledger) => Arc::new(ledger),
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                std::process::exit(1);
            }
        },
    };

    let quotes: Arc<dyn QuoteSource> = match &config.quotes {
        QuoteBackend::Mock => Arc::new(MockQuotes),
        QuoteBackend::AlphaVantage { api_key } => {
            Arc::new(AlphaVantageQuotes::new(Client::new(), api_key.clone()))
        }
    };

    info!("Starting the stock simulator...");
    let routes = api::routes(AppState::new(store, quotes, &config));

    info!("Server running on http://{}", config.bind);
    warp::serve(routes).run(config.bind).await;
}
