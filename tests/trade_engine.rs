use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stock_simulator::engine::TradeEngine;
use stock_simulator::error::{StoreError, TradeError};
use stock_simulator::models::{Holding, TradeKind, Transaction, User};
use stock_simulator::portfolio::PortfolioService;
use stock_simulator::store::{LedgerStore, MemoryLedger, TradeCommit, UserGuard};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn ledger_with_user(cash: &str) -> Arc<MemoryLedger> {
    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .create_user(&User {
            id: "u1".into(),
            username: "ada".into(),
            email: "ada@example.com".into(),
            cash: dec(cash),
            created_at: Utc::now(),
            version: 0,
        })
        .await
        .unwrap();
    ledger
}

fn engine(store: Arc<dyn LedgerStore>) -> TradeEngine {
    TradeEngine::new(store, Duration::from_secs(2), 3)
}

async fn cash(ledger: &MemoryLedger) -> Decimal {
    ledger.get_user("u1").await.unwrap().unwrap().cash
}

#[tokio::test]
async fn buys_average_cost_by_quantity() {
    let ledger = ledger_with_user("10000").await;
    let engine = engine(ledger.clone());

    engine.execute_buy("u1", "aapl", 10, dec("100")).await.unwrap();
    let outcome = engine.execute_buy("u1", " AAPL ", 10, dec("200")).await.unwrap();

    let holding = outcome.holding.unwrap();
    assert_eq!(holding.quantity, 20);
    assert_eq!(holding.avg_cost, dec("150.00"));
    assert_eq!(outcome.user.cash, dec("7000"));
    assert_eq!(ledger.get_holding("u1", "AAPL").await.unwrap(), Some(holding));
}

#[tokio::test]
async fn partial_sell_keeps_basis_and_full_sell_removes_holding() {
    let ledger = ledger_with_user("10000").await;
    let engine = engine(ledger.clone());
    engine.execute_buy("u1", "MSFT", 10, dec("300")).await.unwrap();

    let partial = engine.execute_sell("u1", "msft", 4, dec("350")).await.unwrap();
    assert_eq!(partial.holding.as_ref().unwrap().quantity, 6);
    assert_eq!(partial.holding.as_ref().unwrap().avg_cost, dec("300"));
    assert_eq!(partial.user.cash, dec("8400"));

    let full = engine.execute_sell("u1", "MSFT", 6, dec("100")).await.unwrap();
    assert!(full.holding.is_none());
    assert_eq!(full.user.cash, dec("9000"));
    assert!(ledger.get_holding("u1", "MSFT").await.unwrap().is_none());
    assert!(ledger.list_holdings("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_trades_leave_ledger_untouched() {
    let ledger = ledger_with_user("1000").await;
    let engine = engine(ledger.clone());
    engine.execute_buy("u1", "TSLA", 2, dec("250")).await.unwrap();
    let before_holding = ledger.get_holding("u1", "TSLA").await.unwrap();
    let before_history = ledger.list_transactions("u1").await.unwrap();

    let err = engine.execute_buy("u1", "TSLA", 3, dec("250")).await.unwrap_err();
    assert!(matches!(err, TradeError::InsufficientFunds { .. }));

    let err = engine.execute_sell("u1", "TSLA", 3, dec("250")).await.unwrap_err();
    assert!(matches!(err, TradeError::InsufficientShares { held: 2, requested: 3, .. }));

    let err = engine.execute_sell("u1", "AAPL", 1, dec("1")).await.unwrap_err();
    assert!(matches!(err, TradeError::NoSuchHolding(_)));

    let err = engine.execute_buy("u1", "TSLA", 0, dec("1")).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidOrder(_)));

    let err = engine.execute_buy("u1", "TSLA", 1, dec("-1")).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidOrder(_)));

    assert_eq!(cash(&ledger).await, dec("500"));
    assert_eq!(ledger.get_holding("u1", "TSLA").await.unwrap(), before_holding);
    assert_eq!(ledger.list_transactions("u1").await.unwrap(), before_history);
}

#[tokio::test]
async fn unknown_user_cannot_trade() {
    let ledger = ledger_with_user("1000").await;
    let engine = engine(ledger);
    assert!(matches!(
        engine.execute_buy("ghost", "AAPL", 1, dec("1")).await,
        Err(TradeError::UserNotFound(id)) if id == "ghost"
    ));
    assert!(matches!(
        engine.execute_sell("ghost", "AAPL", 1, dec("1")).await,
        Err(TradeError::UserNotFound(_))
    ));
}

#[tokio::test]
async fn every_trade_appends_one_matching_transaction() {
    let ledger = ledger_with_user("100000").await;
    let engine = engine(ledger.clone());

    engine.execute_buy("u1", "aapl", 5, dec("175.5")).await.unwrap();
    engine.execute_buy("u1", "spy", 1, dec("450.30")).await.unwrap();
    let last = engine.execute_sell("u1", "AAPL", 2, dec("180")).await.unwrap();

    let history = ledger.list_transactions("u1").await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0], last.transaction);

    let summary: Vec<_> = history
        .iter()
        .map(|t| (t.kind, t.symbol.as_str(), t.quantity, t.price, t.seq))
        .collect();
    assert_eq!(
        summary,
        vec![
            (TradeKind::Sell, "AAPL", 2, dec("180"), 3),
            (TradeKind::Buy, "SPY", 1, dec("450.30"), 2),
            (TradeKind::Buy, "AAPL", 5, dec("175.5"), 1),
        ]
    );
}

#[tokio::test]
async fn holding_tracks_net_quantity_over_random_sequences() {
    let ledger = ledger_with_user("1000000000").await;
    let engine = engine(ledger.clone());
    let mut rng = StdRng::seed_from_u64(7);
    let mut net = 0i64;

    for _ in 0..300 {
        let quantity = rng.gen_range(1..=20);
        let price = Decimal::new(rng.gen_range(100..=50_000), 2);
        if rng.gen_bool(0.55) {
            engine.execute_buy("u1", "QQQ", quantity, price).await.unwrap();
            net += quantity;
        } else {
            match engine.execute_sell("u1", "QQQ", quantity, price).await {
                Ok(_) => net -= quantity,
                Err(TradeError::InsufficientShares { held, .. }) => assert!(held < quantity),
                Err(TradeError::NoSuchHolding(_)) => assert_eq!(net, 0),
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let holding = ledger.get_holding("u1", "QQQ").await.unwrap();
        match holding {
            Some(h) => {
                assert_eq!(h.quantity, net);
                assert!(h.quantity >= 1);
                assert!(h.avg_cost >= Decimal::ZERO);
            }
            None => assert_eq!(net, 0),
        }
        assert!(cash(&ledger).await >= Decimal::ZERO);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buys_never_overdraw() {
    let ledger = ledger_with_user("1000").await;
    let engine = engine(ledger.clone());

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_buy("u1", "V", 1, dec("100")).await })
        })
        .collect();

    let mut filled = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => filled += 1,
            Err(TradeError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(filled, 10);
    assert_eq!(cash(&ledger).await, Decimal::ZERO);
    let holding = ledger.get_holding("u1", "V").await.unwrap().unwrap();
    assert_eq!(holding.quantity, 10);
    assert_eq!(ledger.list_transactions("u1").await.unwrap().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_buys_and_sells_serialize_per_user() {
    let ledger = ledger_with_user("1000000").await;
    let engine = engine(ledger.clone());
    engine.execute_buy("u1", "JPM", 50, dec("150")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine
                    .execute_buy("u1", "JPM", 3, dec("150"))
                    .await
                    .map(|_| 3i64)
            } else {
                engine
                    .execute_sell("u1", "JPM", 5, dec("150"))
                    .await
                    .map(|_| -5i64)
            }
        }));
    }

    let mut net = 50i64;
    for task in tasks {
        match task.await.unwrap() {
            Ok(delta) => net += delta,
            Err(TradeError::InsufficientShares { .. }) | Err(TradeError::NoSuchHolding(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    let quantity = ledger
        .get_holding("u1", "JPM")
        .await
        .unwrap()
        .map(|h| h.quantity)
        .unwrap_or(0);
    assert_eq!(quantity, net);

    // Every buy and sell was at 150, so cash moved by exactly 150 per share.
    let spent = Decimal::from(net) * dec("150");
    assert_eq!(cash(&ledger).await, dec("1000000") - spent);

    let history = ledger.list_transactions("u1").await.unwrap();
    let mut seqs: Vec<_> = history.iter().map(|t| t.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=history.len() as i64).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_users_trade_independently() {
    let ledger = ledger_with_user("1000").await;
    let portfolio = PortfolioService::new(
        ledger.clone(),
        Duration::from_secs(1),
        1,
        Decimal::from(1000),
    );
    let bob = portfolio.open_account("bob", "bob@example.com").await.unwrap();
    let engine = engine(ledger.clone());

    // Holding ada's lock must not stall bob.
    let _ada = ledger.lock_user("u1").await.unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        engine.execute_buy(&bob.id, "AAPL", 1, dec("10")),
    )
    .await
    .expect("bob's trade blocked on ada's lock")
    .unwrap();
    assert_eq!(outcome.user.cash, dec("990"));
}

/// Wraps a ledger and injects faults.
#[derive(Default)]
struct FaultyLedger {
    inner: MemoryLedger,
    fail_commits: bool,
    failing_reads: AtomicU32,
    stall_reads: bool,
    /// Apply the commit, then never answer.
    late_ack_commits: bool,
    /// Never answer and never apply.
    lost_commits: bool,
    /// A rejected commit also takes reads down until `reads_down` is cleared.
    outage_on_commit: bool,
    reads_down: AtomicBool,
}

impl FaultyLedger {
    async fn seeded(self) -> Self {
        self.inner
            .create_user(&User {
                id: "u1".into(),
                username: "ada".into(),
                email: "ada@example.com".into(),
                cash: dec("1000"),
                created_at: Utc::now(),
                version: 0,
            })
            .await
            .unwrap();
        self
    }

    async fn read_fault(&self) -> Result<(), StoreError> {
        if self.stall_reads {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("no route to host".into()));
        }
        let remaining = self.failing_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_reads.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FaultyLedger {
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        self.read_fault().await?;
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner.create_user(user).await
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.inner.save_user(user).await
    }

    async fn get_holding(
        &self,
        user_id: &str,
        symbol: &str,
    ) -> Result<Option<Holding>, StoreError> {
        self.inner.get_holding(user_id, symbol).await
    }

    async fn upsert_holding(&self, holding: &Holding) -> Result<(), StoreError> {
        self.inner.upsert_holding(holding).await
    }

    async fn delete_holding(&self, user_id: &str, symbol: &str) -> Result<(), StoreError> {
        self.inner.delete_holding(user_id, symbol).await
    }

    async fn append_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        self.inner.append_transaction(transaction).await
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>, StoreError> {
        self.inner.list_transactions(user_id).await
    }

    async fn list_holdings(&self, user_id: &str) -> Result<Vec<Holding>, StoreError> {
        self.inner.list_holdings(user_id).await
    }

    async fn lock_user(&self, user_id: &str) -> Result<UserGuard, StoreError> {
        self.inner.lock_user(user_id).await
    }

    async fn commit_trade(&self, commit: &TradeCommit) -> Result<(), StoreError> {
        if self.outage_on_commit {
            self.reads_down.store(true, Ordering::SeqCst);
            return Err(StoreError::Backend("batch write rejected".into()));
        }
        if self.fail_commits {
            return Err(StoreError::Backend("batch write rejected".into()));
        }
        if self.lost_commits {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.commit_trade(commit).await?;
        if self.late_ack_commits {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn failed_commit_applies_nothing() {
    let store = Arc::new(
        FaultyLedger {
            fail_commits: true,
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let engine = engine(store.clone());

    let err = engine.execute_buy("u1", "AAPL", 1, dec("10")).await.unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));
    assert!(err.is_retryable());

    assert_eq!(store.inner.get_user("u1").await.unwrap().unwrap().cash, dec("1000"));
    assert!(store.inner.get_holding("u1", "AAPL").await.unwrap().is_none());
    assert!(store.inner.list_transactions("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_read_faults_are_retried() {
    let store = Arc::new(
        FaultyLedger {
            failing_reads: AtomicU32::new(2),
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let outcome = engine(store.clone())
        .execute_buy("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap();
    assert_eq!(outcome.user.cash, dec("990"));
    assert_eq!(store.inner.list_transactions("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn persistent_read_faults_surface_store_unavailable() {
    let store = Arc::new(
        FaultyLedger {
            failing_reads: AtomicU32::new(10),
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let err = engine(store)
        .execute_sell("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));
}

#[tokio::test]
async fn stalled_store_times_out() {
    let store = Arc::new(
        FaultyLedger {
            stall_reads: true,
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let engine = TradeEngine::new(store.clone(), Duration::from_millis(50), 1);
    let err = engine
        .execute_buy("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));
    assert!(store.inner.list_transactions("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn lock_wait_is_bounded() {
    let ledger = ledger_with_user("1000").await;
    let engine = TradeEngine::new(ledger.clone(), Duration::from_millis(50), 1);
    let _held = ledger.lock_user("u1").await.unwrap();
    let err = engine
        .execute_buy("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));
}

#[tokio::test]
async fn commit_that_times_out_but_lands_is_reported_applied() {
    let store = Arc::new(
        FaultyLedger {
            late_ack_commits: true,
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let engine = TradeEngine::new(store.clone(), Duration::from_millis(50), 2);

    let first = engine.execute_buy("u1", "AAPL", 1, dec("10")).await.unwrap();
    assert_eq!(first.user.cash, dec("990"));
    assert_eq!(first.user.version, 1);

    // The next trade must start from the applied state.
    let second = engine.execute_buy("u1", "AAPL", 1, dec("10")).await.unwrap();
    assert_eq!(second.user.cash, dec("980"));
    assert_eq!(second.holding.unwrap().quantity, 2);

    let seqs: Vec<_> = store
        .inner
        .list_transactions("u1")
        .await
        .unwrap()
        .iter()
        .map(|t| t.seq)
        .collect();
    assert_eq!(seqs, vec![2, 1]);
}

#[tokio::test]
async fn commit_that_times_out_and_never_lands_fails() {
    let store = Arc::new(
        FaultyLedger {
            lost_commits: true,
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let engine = TradeEngine::new(store.clone(), Duration::from_millis(50), 2);

    let err = engine
        .execute_buy("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));
    assert_eq!(store.inner.get_user("u1").await.unwrap().unwrap().cash, dec("1000"));
    assert!(store.inner.list_transactions("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_commit_outcome_keeps_user_locked_until_settled() {
    let store = Arc::new(
        FaultyLedger {
            outage_on_commit: true,
            ..Default::default()
        }
        .seeded()
        .await,
    );
    let engine = TradeEngine::new(store.clone(), Duration::from_millis(50), 1);

    let err = engine
        .execute_buy("u1", "AAPL", 1, dec("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::StoreUnavailable(_)));

    // Still held while the store cannot say whether the commit landed.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(20), store.lock_user("u1"))
            .await
            .is_err()
    );

    store.reads_down.store(false, Ordering::SeqCst);
    let guard = tokio::time::timeout(Duration::from_secs(1), store.lock_user("u1"))
        .await
        .expect("user never released after store recovered")
        .unwrap();
    drop(guard);
    assert_eq!(store.inner.get_user("u1").await.unwrap().unwrap().cash, dec("1000"));
}
