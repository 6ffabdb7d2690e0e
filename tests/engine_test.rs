use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use tierbot::api::{ExchangeAdapter, ExchangeError, Fill, PaperExchange, PriceQuote};
use tierbot::db::TradeJournal;
use tierbot::engine::{EngineDeps, SchedulerConfig};
use tierbot::execution::{ExitReason, Position};
use tierbot::feed::{snapshot_channel, SnapshotPublisher, SnapshotReader};
use tierbot::persistence::{
    FileSnapshotStore, MemorySnapshotStore, PersistenceError, SnapshotStore,
};
use tierbot::regime::{
    DecisionOracle, FallbackPolicy, GuardedOracle, OracleContext, OracleError, RuleBasedOracle,
};
use tierbot::risk::SafetyStatus;
use tierbot::*;

/// Always goes long with fixed conviction
struct LongOracle;

#[async_trait]
impl DecisionOracle for LongOracle {
    fn name(&self) -> &str {
        "always-long"
    }

    async fn decide(&self, ctx: &OracleContext) -> std::result::Result<TradeSignal, OracleError> {
        Ok(TradeSignal {
            pair: ctx.pair.clone(),
            direction: SignalDirection::Long,
            confidence: 0.8,
            expected_profit_pct: 0.08,
            reasoning: "integration test".to_string(),
            source: SignalSource::Oracle,
        })
    }
}

/// Paper fills, but the REST price endpoint is down
struct NoRestPrices(PaperExchange);

#[async_trait]
impl ExchangeAdapter for NoRestPrices {
    async fn fetch_price(&self, _pair: &str) -> std::result::Result<PriceQuote, ExchangeError> {
        Err(ExchangeError::Network("connection refused".to_string()))
    }

    async fn place_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
    ) -> std::result::Result<Fill, ExchangeError> {
        self.0.place_market_order(pair, side, quantity).await
    }

    async fn fetch_balance(&self) -> std::result::Result<HashMap<String, f64>, ExchangeError> {
        self.0.fetch_balance().await
    }
}

#[derive(Default)]
struct RecordingJournal {
    closes: Mutex<Vec<Position>>,
}

#[async_trait]
impl TradeJournal for RecordingJournal {
    async fn record_close(&self, position: &Position) -> std::result::Result<(), PersistenceError> {
        self.closes.lock().unwrap().push(position.clone());
        Ok(())
    }

    async fn recent_closes(&self, limit: i64) -> std::result::Result<Vec<Position>, PersistenceError> {
        let closes = self.closes.lock().unwrap();
        Ok(closes.iter().rev().take(limit as usize).cloned().collect())
    }

    async fn total_realized_pnl(&self) -> std::result::Result<f64, PersistenceError> {
        let closes = self.closes.lock().unwrap();
        Ok(closes.iter().filter_map(|p| p.realized_pnl).sum())
    }
}

struct Harness {
    engine: TradingEngine,
    publisher: SnapshotPublisher,
    journal: Arc<RecordingJournal>,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
}

fn base_config(pairs: &[&str]) -> EngineConfig {
    let mut config = EngineConfig {
        pairs: pairs.iter().map(|p| p.to_string()).collect(),
        starting_tier: 2, // Balanced
        ..Default::default()
    };
    config.evaluator.trend_filter = false;
    config
}

fn harness(config: EngineConfig, store: Arc<dyn SnapshotStore>, now: DateTime<Utc>) -> Harness {
    harness_with(config, store, now, |reader| {
        Arc::new(PaperExchange::new(reader, 100_000.0, 0.0))
    })
}

fn harness_with(
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    now: DateTime<Utc>,
    exchange: impl FnOnce(SnapshotReader) -> Arc<dyn ExchangeAdapter>,
) -> Harness {
    let (publisher, reader) = snapshot_channel();
    let journal = Arc::new(RecordingJournal::default());

    let deps = EngineDeps {
        exchange: exchange(reader.clone()),
        oracle: GuardedOracle::new(
            Box::new(LongOracle),
            RuleBasedOracle::default(),
            FallbackPolicy::Skip,
            std::time::Duration::from_secs(5),
        ),
        store,
        journal: Some(journal.clone()),
        market: reader,
        feed_health: None,
    };

    Harness {
        engine: TradingEngine::new(config, deps, now).unwrap(),
        publisher,
        journal,
    }
}

fn tick(publisher: &SnapshotPublisher, pair: &str, price: f64, at: DateTime<Utc>) {
    publisher.apply(&Tick {
        pair: pair.to_string(),
        price,
        volume: 1_000.0,
        timestamp: at,
    });
}

#[tokio::test]
async fn test_small_account_sizing_through_engine() {
    let mut config = base_config(&["BTC/USD"]);
    config.initial_capital = 50.0;
    config.evaluator.fee_pct = 0.0005;

    let mut h = harness(config, Arc::new(MemorySnapshotStore::new()), t0());
    tick(&h.publisher, "BTC/USD", 100.0, t0());

    let report = h.engine.run_cycle(t0()).await.unwrap();

    // 50 * 0.04 * 1.08 * 1.2
    assert_eq!(report.opened.len(), 1);
    let position = &h.engine.positions().open_positions()[0];
    assert!((position.size - 2.592).abs() < 1e-9);
    assert!((h.engine.ledger().committed() - 2.592).abs() < 1e-9);
    assert!(position.stop_loss < position.entry_price && position.entry_price < position.take_profit);
}

#[tokio::test]
async fn test_stream_drop_with_three_open_positions() {
    let pairs = ["BTC/USD", "ETH/USD", "SOL/USD", "ADA/USD"];
    let mut h = harness(base_config(&pairs), Arc::new(MemorySnapshotStore::new()), t0());
    for pair in pairs {
        tick(&h.publisher, pair, 100.0, t0());
    }

    // Balanced allows three pairs
    let report = h.engine.run_cycle(t0()).await.unwrap();
    assert_eq!(report.opened.len(), 3);
    assert_eq!(
        report.rejections,
        vec![("ADA/USD".to_string(), "capacity".to_string())]
    );
    let committed = h.engine.ledger().committed();

    // Feed goes quiet: every quote is now stale
    let during_outage = t0() + Duration::minutes(10);
    let report = h.engine.run_cycle(during_outage).await.unwrap();

    // REST fallback still prices every position, and none is near a trigger
    assert!(report.skipped.is_empty());
    assert!(report.exit_failures.is_empty());
    assert!(report.opened.is_empty());
    assert!(report.closed.is_empty());
    assert_eq!(
        report.rejections,
        vec![("ADA/USD".to_string(), "stale_data".to_string())]
    );
    assert_eq!(h.engine.positions().open_count(), 3);
    assert!((h.engine.ledger().committed() - committed).abs() < 1e-9);

    // Reconnected: only the pair through its stop is closed
    let reconnected = during_outage + Duration::minutes(5);
    tick(&h.publisher, "BTC/USD", 90.0, reconnected);
    tick(&h.publisher, "ETH/USD", 100.5, reconnected);
    tick(&h.publisher, "SOL/USD", 99.5, reconnected);

    let report = h.engine.run_cycle(reconnected).await.unwrap();
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].pair, "BTC/USD");
    assert_eq!(report.closed[0].reason, ExitReason::StopLoss);
    assert!(h.engine.positions().has_position("ETH/USD"));
    assert!(h.engine.positions().has_position("SOL/USD"));
}

#[tokio::test]
async fn test_stream_drop_without_rest_fallback_skips_exits() {
    let pairs = ["BTC/USD", "ETH/USD", "SOL/USD"];
    let mut h = harness_with(
        base_config(&pairs),
        Arc::new(MemorySnapshotStore::new()),
        t0(),
        |reader| Arc::new(NoRestPrices(PaperExchange::new(reader, 100_000.0, 0.0))),
    );
    for pair in pairs {
        tick(&h.publisher, pair, 100.0, t0());
    }

    let report = h.engine.run_cycle(t0()).await.unwrap();
    assert_eq!(report.opened.len(), 3);
    let committed = h.engine.ledger().committed();
    let available = h.engine.ledger().available();

    // Stale stream and no REST price: positions are left alone, not closed
    let during_outage = t0() + Duration::minutes(10);
    let report = h.engine.run_cycle(during_outage).await.unwrap();

    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped.iter().all(|(_, why)| why == "no price"));
    assert!(report.closed.is_empty());
    assert!(report.exit_failures.is_empty());
    assert!(!report.liquidated);
    assert_eq!(h.engine.positions().open_count(), 3);
    assert!((h.engine.ledger().committed() - committed).abs() < 1e-9);
    assert!((h.engine.ledger().available() - available).abs() < 1e-9);

    // Stream resumes and normal exit evaluation picks up where it left off
    let reconnected = during_outage + Duration::minutes(5);
    tick(&h.publisher, "BTC/USD", 90.0, reconnected);
    tick(&h.publisher, "ETH/USD", 100.5, reconnected);
    tick(&h.publisher, "SOL/USD", 99.5, reconnected);

    let report = h.engine.run_cycle(reconnected).await.unwrap();
    assert!(report.skipped.is_empty());
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].pair, "BTC/USD");
    assert_eq!(report.closed[0].reason, ExitReason::StopLoss);
}

#[tokio::test]
async fn test_five_losses_pause_admissions() {
    let mut h = harness(base_config(&["BTC/USD"]), Arc::new(MemorySnapshotStore::new()), t0());

    let mut now = t0();
    let mut price = 100.0;
    tick(&h.publisher, "BTC/USD", price, now);
    h.engine.run_cycle(now).await.unwrap();

    let mut last = None;
    for _ in 0..5 {
        now += Duration::minutes(5);
        price *= 0.9;
        tick(&h.publisher, "BTC/USD", price, now);
        last = Some(h.engine.run_cycle(now).await.unwrap());
    }

    let report = last.unwrap();
    assert_eq!(report.closed.len(), 1);
    assert!(report.closed[0].pnl < 0.0);
    assert!(matches!(report.safety, SafetyStatus::Paused { .. }));
    assert_eq!(
        report.rejections,
        vec![("BTC/USD".to_string(), "safety".to_string())]
    );
    assert_eq!(h.engine.positions().performance().consecutive_losses, 5);
    assert_eq!(h.journal.closes.lock().unwrap().len(), 5);

    // Five losses in a row also walk the tier ladder down
    assert!(h.engine.levels().current_index() < 2);
}

#[tokio::test]
async fn test_daily_loss_halts_until_next_day() {
    let mut config = base_config(&["BTC/USD"]);
    config.breakers.max_daily_loss_pct = 0.003;
    let mut h = harness(config, Arc::new(MemorySnapshotStore::new()), t0());

    tick(&h.publisher, "BTC/USD", 100.0, t0());
    h.engine.run_cycle(t0()).await.unwrap();

    let later = t0() + Duration::minutes(30);
    tick(&h.publisher, "BTC/USD", 90.0, later);
    let report = h.engine.run_cycle(later).await.unwrap();

    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.safety, SafetyStatus::DailyLossHalt);
    assert_eq!(
        report.rejections,
        vec![("BTC/USD".to_string(), "safety".to_string())]
    );

    // Late the same day: still halted
    let evening = Utc.with_ymd_and_hms(2025, 3, 3, 23, 30, 0).unwrap();
    tick(&h.publisher, "BTC/USD", 91.0, evening);
    let report = h.engine.run_cycle(evening).await.unwrap();
    assert!(report.opened.is_empty());

    // New UTC day lifts the halt
    let next_day = Utc.with_ymd_and_hms(2025, 3, 4, 0, 5, 0).unwrap();
    tick(&h.publisher, "BTC/USD", 91.0, next_day);
    let report = h.engine.run_cycle(next_day).await.unwrap();
    assert_eq!(report.safety, SafetyStatus::Normal);
    assert_eq!(report.opened.len(), 1);
}

#[tokio::test]
async fn test_snapshot_round_trip_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("engine.json");
    let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(&path));

    let pairs = ["BTC/USD", "ETH/USD"];
    let mut h = harness(base_config(&pairs), store.clone(), t0());
    for pair in pairs {
        tick(&h.publisher, pair, 100.0, t0());
    }
    h.engine.run_cycle(t0()).await.unwrap();
    let before = h.engine.snapshot(t0());

    // Fresh process over the same file
    let (publisher, reader) = snapshot_channel();
    let deps = EngineDeps {
        exchange: Arc::new(PaperExchange::new(reader.clone(), 100_000.0, 0.0)),
        oracle: GuardedOracle::rule_based(Default::default()),
        store: store.clone(),
        journal: None,
        market: reader,
        feed_health: None,
    };
    let restored = TradingEngine::bootstrap(base_config(&pairs), deps, t0())
        .await
        .unwrap();
    drop(publisher);

    let after = restored.snapshot(t0());
    assert_eq!(after.ledger, before.ledger);
    assert_eq!(after.open_positions, before.open_positions);
    assert_eq!(after.tier_index, before.tier_index);
    assert_eq!(after.tier_name, "Balanced");
    assert_eq!(after.safety, before.safety);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_fatal_on_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.json");
    std::fs::write(&path, "{\"version\": 1, \"ledger\": ").unwrap();

    let (_publisher, reader) = snapshot_channel();
    let deps = EngineDeps {
        exchange: Arc::new(PaperExchange::new(reader.clone(), 1_000.0, 0.0)),
        oracle: GuardedOracle::rule_based(Default::default()),
        store: Arc::new(FileSnapshotStore::new(&path)),
        journal: None,
        market: reader,
        feed_health: None,
    };

    let result = TradingEngine::bootstrap(base_config(&["BTC/USD"]), deps, t0()).await;
    match result {
        Err(e) => assert!(e.is_fatal(), "expected fatal, got {}", e),
        Ok(_) => panic!("corrupt snapshot was accepted"),
    }
}

#[tokio::test]
async fn test_emergency_stop_liquidates_through_scheduler() {
    let now = Utc::now();
    let pairs = ["BTC/USD", "ETH/USD"];
    let store = Arc::new(MemorySnapshotStore::new());
    let mut h = harness(base_config(&pairs), store.clone(), now);
    for pair in pairs {
        tick(&h.publisher, pair, 100.0, now);
    }
    h.engine.run_cycle(now).await.unwrap();
    assert_eq!(h.engine.positions().open_count(), 2);

    let scheduler = CycleScheduler::new(SchedulerConfig {
        cycle_interval_secs: 3600,
        wait_chunk_secs: 60,
        liveness_marker: None,
    });
    let (stop_tx, stop_rx) = watch::channel(false);

    let stopper = async {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
    };

    // The stop interrupts the hour-long wait immediately
    let (result, ()) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        async { tokio::join!(scheduler.run(&mut h.engine, stop_rx), stopper) },
    )
    .await
    .unwrap();

    result.unwrap();
    assert_eq!(h.engine.positions().open_count(), 0);
    assert!(h.engine.ledger().committed().abs() < 1e-9);

    let closes = h.journal.closes.lock().unwrap();
    assert_eq!(closes.len(), 2);
    assert!(closes
        .iter()
        .all(|p| p.close_reason == Some(ExitReason::EmergencyStop)));

    let saved = store.load().await.unwrap().unwrap();
    assert!(saved.open_positions.is_empty());
}
