// Trading engine module
pub mod scheduler;

pub use scheduler::{CycleScheduler, SchedulerConfig, WaitOutcome};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::api::{ExchangeAdapter, ExchangeError, Fill};
use crate::config::EngineConfig;
use crate::db::TradeJournal;
use crate::error::EngineError;
use crate::execution::{
    CapitalLedger, Decision, EvaluationContext, ExitReason, ExitSignal, OpportunityEvaluator,
    PositionManager, PositionStatus,
};
use crate::feed::{ConnectionState, SnapshotReader};
use crate::levels::{LevelInputs, LevelManager, PerformanceWindow, TierTransition};
use crate::models::{MarketSnapshot, OrderSide, PairQuote};
use crate::persistence::{EngineSnapshot, SnapshotStore, SNAPSHOT_VERSION};
use crate::regime::{
    GuardedOracle, OracleContext, PriceHistory, RegimeAssessment, RegimeDetector,
};
use crate::risk::{SafetyMonitor, SafetyStatus};

/// How many recent prices the oracle sees
const ORACLE_PRICE_CONTEXT: usize = 50;

/// External collaborators of the engine
pub struct EngineDeps {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub oracle: GuardedOracle,
    pub store: Arc<dyn SnapshotStore>,
    pub journal: Option<Arc<dyn TradeJournal>>,
    pub market: SnapshotReader,
    /// Connection health of the streaming feed, when one is running
    pub feed_health: Option<watch::Receiver<ConnectionState>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub pair: String,
    pub reason: ExitReason,
    pub exit_price: f64,
    pub pnl: f64,
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub tier: String,
    pub transition: TierTransition,
    pub closed: Vec<ClosedTrade>,
    /// Exits whose order failed; those positions are open again
    pub exit_failures: Vec<(Uuid, String)>,
    pub skipped: Vec<(Uuid, String)>,
    pub opened: Vec<Uuid>,
    pub rejections: Vec<(String, String)>,
    pub safety: SafetyStatus,
    pub liquidated: bool,
    pub equity: f64,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>, tier: String, safety: SafetyStatus) -> Self {
        Self {
            started_at,
            tier,
            transition: TierTransition::Hold,
            closed: Vec::new(),
            exit_failures: Vec::new(),
            skipped: Vec::new(),
            opened: Vec::new(),
            rejections: Vec::new(),
            safety,
            liquidated: false,
            equity: 0.0,
        }
    }

    fn reject(&mut self, pair: &str, code: impl Into<String>) {
        self.rejections.push((pair.to_string(), code.into()));
    }
}

/// Outcome of a forced liquidation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationReport {
    pub closed: Vec<ClosedTrade>,
    pub failed: Vec<(Uuid, String)>,
}

/// One control loop's worth of state: ledger, positions, tier ladder and safety
pub struct TradingEngine {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeAdapter>,
    oracle: GuardedOracle,
    store: Arc<dyn SnapshotStore>,
    journal: Option<Arc<dyn TradeJournal>>,
    market: SnapshotReader,
    feed_health: Option<watch::Receiver<ConnectionState>>,
    ledger: Arc<CapitalLedger>,
    positions: PositionManager,
    levels: LevelManager,
    safety: SafetyMonitor,
    evaluator: OpportunityEvaluator,
    detector: RegimeDetector,
    history: PriceHistory,
    exchange_timeout: Duration,
    /// Last successful save carried the emergency flag
    emergency_on_record: AtomicBool,
}

impl TradingEngine {
    /// Fresh engine with all capital free
    pub fn new(config: EngineConfig, deps: EngineDeps, now: DateTime<Utc>) -> crate::Result<Self> {
        config.validate()?;

        let ledger = Arc::new(CapitalLedger::new(
            config.initial_capital,
            config.max_exposure_fraction,
        ));
        let performance =
            PerformanceWindow::new(config.levels.window_trades, config.initial_capital, now);
        let positions = PositionManager::new(ledger.clone(), config.lifecycle.clone(), performance);
        let levels = LevelManager::new(
            config.tiers.clone(),
            config.levels.clone(),
            config.starting_tier,
        )?;
        let safety = SafetyMonitor::new(config.breakers.clone(), config.initial_capital, now);
        let evaluator = OpportunityEvaluator::new(config.evaluator.clone(), config.sizing.clone());
        let detector = RegimeDetector::new(config.regime.clone());
        let history = PriceHistory::new(config.regime.history_points);
        let exchange_timeout = Duration::from_millis(config.exchange.timeout_ms.max(1));

        Ok(Self {
            config,
            exchange: deps.exchange,
            oracle: deps.oracle,
            store: deps.store,
            journal: deps.journal,
            market: deps.market,
            feed_health: deps.feed_health,
            ledger,
            positions,
            levels,
            safety,
            evaluator,
            detector,
            history,
            exchange_timeout,
            emergency_on_record: AtomicBool::new(false),
        })
    }

    /// Resume from the store if it holds a snapshot, otherwise start fresh
    pub async fn bootstrap(
        config: EngineConfig,
        deps: EngineDeps,
        now: DateTime<Utc>,
    ) -> crate::Result<Self> {
        let stored = deps.store.load().await?;
        let mut engine = Self::new(config, deps, now)?;

        match stored {
            Some(snapshot) => engine.restore_from(snapshot)?,
            None => tracing::info!(
                capital = engine.config.initial_capital,
                tier = %engine.levels.current().name,
                "No snapshot found, starting fresh"
            ),
        }

        Ok(engine)
    }

    /// Replace in-memory state with a persisted snapshot
    ///
    /// Any inconsistency between ledger and positions is fatal.
    pub fn restore_from(&mut self, snapshot: EngineSnapshot) -> crate::Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Fatal(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let ledger = Arc::new(CapitalLedger::from_snapshot(snapshot.ledger));
        let positions = PositionManager::restore(
            ledger.clone(),
            self.config.lifecycle.clone(),
            snapshot.performance,
            snapshot.open_positions,
        )
        .map_err(|e| EngineError::Fatal(e.to_string()))?;

        self.levels.restore(snapshot.tier_index, &snapshot.tier_name)?;
        self.emergency_on_record
            .store(snapshot.safety.emergency, Ordering::Relaxed);
        self.safety = SafetyMonitor::from_state(self.config.breakers.clone(), snapshot.safety);
        self.ledger = ledger;
        self.positions = positions;

        tracing::info!(
            saved_at = %snapshot.saved_at,
            tier = %self.levels.current().name,
            available = self.ledger.available(),
            committed = self.ledger.committed(),
            positions = self.positions.open_count(),
            emergency = self.safety.state().emergency,
            "♻️  Engine state restored"
        );

        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            ledger: self.ledger.snapshot(),
            tier_index: self.levels.current_index(),
            tier_name: self.levels.current().name.clone(),
            open_positions: self.positions.open_positions().to_vec(),
            performance: self.positions.performance().clone(),
            safety: self.safety.state().clone(),
        }
    }

    /// Save the current state; failures are logged, not propagated
    async fn persist(&self, now: DateTime<Utc>) -> bool {
        let snapshot = self.snapshot(now);
        match self.store.save(&snapshot).await {
            Ok(()) => {
                self.emergency_on_record
                    .store(snapshot.safety.emergency, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::error!("❌ Failed to persist engine snapshot: {}", e);
                false
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<CapitalLedger> {
        &self.ledger
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn levels(&self) -> &LevelManager {
        &self.levels
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    pub fn history(&self) -> &PriceHistory {
        &self.history
    }

    /// Sample the latest market snapshot into the price history
    pub fn observe_market(&mut self) -> usize {
        let snapshot = self.market.latest();
        self.history.record_snapshot(&snapshot)
    }

    fn fresh_quote<'a>(&self, snapshot: &'a MarketSnapshot, pair: &str, now: DateTime<Utc>) -> Option<&'a PairQuote> {
        snapshot
            .quote(pair)
            .filter(|q| q.is_valid() && q.age_secs(now) <= self.config.max_quote_age_secs)
    }

    fn assess(&self, pair: &str) -> RegimeAssessment {
        self.detector.assess(&self.history.prices(pair))
    }

    /// Market-wide regime over the configured pairs
    pub fn market_regime(&self) -> RegimeAssessment {
        let assessments: Vec<RegimeAssessment> =
            self.config.pairs.iter().map(|p| self.assess(p)).collect();
        RegimeAssessment::aggregate(assessments.iter())
    }

    fn feed_fatal(&self) -> Option<String> {
        self.feed_health
            .as_ref()
            .and_then(|health| health.borrow().fatal.clone())
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        call: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.exchange_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "{} after {:?}",
                what, self.exchange_timeout
            ))),
        }
    }

    /// Prices for exit evaluation: fresh snapshot quotes first, REST fallback per pair
    async fn exit_prices(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> HashMap<String, f64> {
        let mut prices = HashMap::new();

        for position in self.positions.open_positions() {
            if prices.contains_key(&position.pair) {
                continue;
            }

            if let Some(quote) = self.fresh_quote(snapshot, &position.pair, now) {
                prices.insert(position.pair.clone(), quote.price);
                continue;
            }

            match self
                .with_timeout("fetch_price", self.exchange.fetch_price(&position.pair))
                .await
            {
                Ok(quote) => {
                    tracing::debug!(pair = %position.pair, price = quote.price, "Using REST price fallback");
                    prices.insert(position.pair.clone(), quote.price);
                }
                Err(e) => {
                    tracing::warn!(pair = %position.pair, "⚠️  No usable price: {}", e);
                }
            }
        }

        prices
    }

    /// Run one scheduled cycle
    ///
    /// Only fatal conditions are returned as errors; everything else is
    /// contained and reported.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> crate::Result<CycleReport> {
        if let Some(reason) = self.feed_fatal() {
            return Err(EngineError::Fatal(format!("market data feed: {}", reason)));
        }

        let snapshot = self.market.latest();
        self.history.record_snapshot(&snapshot);
        self.safety.tick(now, self.ledger.total());

        let mut report = CycleReport::new(
            now,
            self.levels.current().name.clone(),
            self.safety.status(now),
        );

        tracing::info!(
            tier = %report.tier,
            available = self.ledger.available(),
            committed = self.ledger.committed(),
            positions = self.positions.open_count(),
            "🔄 Cycle start"
        );

        if self.safety.state().emergency {
            self.sync_emergency_reset().await;
            report.safety = self.safety.status(now);
        }

        if self.safety.state().emergency {
            let liquidation = self.liquidate_all(ExitReason::Emergency, now).await;
            // Nothing to liquidate means nothing saved; the halt must still reach the store
            if !self.emergency_on_record.load(Ordering::Relaxed) {
                self.persist(now).await;
            }
            report.closed = liquidation.closed;
            report.exit_failures = liquidation.failed;
            report.liquidated = true;
            report.equity = self.ledger.total();
            report.safety = self.safety.status(now);
            return Ok(report);
        }

        let prices = self.exit_prices(&snapshot, now).await;

        // Tier decision at the cycle boundary; open positions keep their brackets
        let transition = self.evaluate_level(&prices, now);
        if transition != TierTransition::Hold {
            self.persist(now).await;
        }
        report.transition = transition;
        report.tier = self.levels.current().name.clone();

        // Exit pass
        let sweep = self.positions.evaluate_exits(&prices, now, false);
        report.skipped = sweep.skipped;
        for signal in sweep.exits {
            match self.execute_exit(&signal, now).await {
                Ok(closed) => report.closed.push(closed),
                Err(e) => report.exit_failures.push((signal.position_id, e.to_string())),
            }
        }

        // Drawdown check on equity including open positions
        let equity = self.positions.observe_equity(&prices, now);
        let high_water_mark = self.positions.performance().high_water_mark;
        report.equity = equity;
        if self.safety.check_drawdown(equity, high_water_mark).is_some() {
            let liquidation = self.liquidate_all(ExitReason::Emergency, now).await;
            if !self.emergency_on_record.load(Ordering::Relaxed) {
                self.persist(now).await;
            }
            report.closed.extend(liquidation.closed);
            report.exit_failures.extend(liquidation.failed);
            report.liquidated = true;
            report.safety = self.safety.status(now);
            return Ok(report);
        }

        self.admission_pass(&snapshot, now, &mut report).await;

        report.safety = self.safety.status(now);
        report.equity = self.ledger.total() + self.positions.unrealized_pnl(&prices);
        self.persist(now).await;

        tracing::info!(
            tier = %report.tier,
            opened = report.opened.len(),
            closed = report.closed.len(),
            rejected = report.rejections.len(),
            equity = report.equity,
            "✅ Cycle complete"
        );

        Ok(report)
    }

    fn evaluate_level(&mut self, prices: &HashMap<String, f64>, now: DateTime<Utc>) -> TierTransition {
        let regime = self.market_regime();
        let performance = self.positions.performance();
        let equity = self.ledger.total() + self.positions.unrealized_pnl(prices);
        let growth_window = chrono::Duration::hours(self.config.levels.growth_window_hours);

        let inputs = LevelInputs {
            win_rate: performance.win_rate(),
            trades_in_window: performance.recent_trades(),
            consecutive_losses: performance.consecutive_losses,
            consecutive_wins: performance.consecutive_wins,
            daily_loss_pct: self.safety.daily_loss_pct(),
            capital_growth: performance.growth_since(now, growth_window, equity),
            trend: regime.trend,
            volatility: regime.volatility,
        };

        self.levels.evaluate(&inputs)
    }

    async fn admission_pass(&mut self, snapshot: &MarketSnapshot, now: DateTime<Utc>, report: &mut CycleReport) {
        let tier = self.levels.current().clone();
        let pairs = self.config.pairs.clone();

        for pair in &pairs {
            let status = self.safety.status(now);
            if !status.is_normal() {
                tracing::info!(pair = %pair, status = ?status, "⏭️  NO-GO: safety monitor");
                report.reject(pair, "safety");
                continue;
            }

            if self.positions.has_position(pair) {
                continue;
            }

            let Some(quote) = self.fresh_quote(snapshot, pair, now).copied() else {
                tracing::warn!(pair = %pair, "⏭️  NO-GO: missing or stale quote");
                report.reject(pair, "stale_data");
                continue;
            };

            let assessment = self.assess(pair);
            let context = OracleContext {
                pair: pair.clone(),
                price: quote.price,
                volume: quote.volume,
                assessment,
                recent_prices: self.history.recent_prices(pair, ORACLE_PRICE_CONTEXT),
                tier: tier.name.clone(),
            };

            let Some(signal) = self.oracle.decide(&context).await else {
                report.reject(pair, "oracle_unavailable");
                continue;
            };

            let ctx = EvaluationContext {
                tier: &tier,
                safety: status,
                daily_trades: self.safety.state().daily_trades,
                capital: self.ledger.total(),
                entry_price: quote.price,
                trend: assessment.trend,
            };

            let admission = match self.evaluator.evaluate(&signal, &ctx) {
                Decision::Go(admission) => admission,
                Decision::NoGo(reason) => {
                    report.reject(pair, reason.code());
                    continue;
                }
            };

            if let Err(e) = self
                .positions
                .check_capacity(pair, admission.size, tier.max_open_positions)
            {
                tracing::info!(pair = %pair, "⏭️  NO-GO: {}", e);
                report.reject(pair, "capacity");
                continue;
            }

            let reservation = match self.ledger.reserve(admission.size) {
                Ok(reservation) => reservation,
                Err(e) => {
                    tracing::info!(pair = %pair, "⏭️  NO-GO: {}", e);
                    report.reject(pair, "capacity");
                    continue;
                }
            };

            let quantity = admission.size / quote.price;
            let side = admission.direction.entry_side();
            let fill = self
                .with_timeout("place_market_order", self.exchange.place_market_order(pair, side, quantity))
                .await;

            let fill = match fill {
                Ok(fill) => fill,
                Err(e) => {
                    self.ledger.release(reservation);
                    tracing::error!(pair = %pair, "❌ Entry order failed: {}", e);
                    report.reject(pair, "order_failed");
                    continue;
                }
            };

            match self
                .positions
                .open_position(reservation, admission.open_request(), &fill, now)
            {
                Ok(id) => {
                    self.safety.record_trade_opened();
                    report.opened.push(id);
                    self.persist(now).await;
                }
                Err(e) => {
                    tracing::error!(pair = %pair, "❌ Filled entry could not be tracked: {}", e);
                    report.reject(pair, "open_failed");
                }
            }
        }
    }

    async fn exit_order(&self, pair: &str, side: OrderSide, quantity: f64) -> Result<Fill, ExchangeError> {
        self.with_timeout("place_market_order", self.exchange.place_market_order(pair, side, quantity))
            .await
    }

    /// Close one position: Closing while the order is out, Open again on failure
    async fn execute_exit(&mut self, signal: &ExitSignal, now: DateTime<Utc>) -> crate::Result<ClosedTrade> {
        let (pair, side, quantity) = match self.positions.get_position(signal.position_id) {
            Some(p) => (p.pair.clone(), p.direction.exit_side(), p.quantity),
            None => {
                return Err(EngineError::Data(format!(
                    "position {} vanished before exit",
                    signal.position_id
                )))
            }
        };

        self.positions
            .mark_closing(signal.position_id)
            .map_err(|e| EngineError::Data(e.to_string()))?;

        let fill = match self.exit_order(&pair, side, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                tracing::error!(
                    id = %signal.position_id,
                    pair = %pair,
                    reason = ?signal.reason,
                    "❌ Exit order failed, position stays open: {}",
                    e
                );
                if let Err(revert) = self.positions.revert_closing(signal.position_id) {
                    tracing::error!("Failed to revert closing state: {}", revert);
                }
                return Err(e.into());
            }
        };

        let closed = match self.positions.close_position(
            signal.position_id,
            fill.price,
            fill.fee,
            signal.reason,
            now,
        ) {
            Ok(closed) => closed,
            Err(e) => {
                if let Err(revert) = self.positions.revert_closing(signal.position_id) {
                    tracing::error!("Failed to revert closing state: {}", revert);
                }
                return Err(EngineError::Fatal(format!(
                    "exit filled but ledger settlement failed: {}",
                    e
                )));
            }
        };

        let pnl = closed.realized_pnl.unwrap_or_default();
        self.safety.record_close(pnl, now);

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_close(&closed).await {
                tracing::warn!("Failed to journal closed position: {}", e);
            }
        }

        self.persist(now).await;

        Ok(ClosedTrade {
            position_id: closed.id,
            pair: closed.pair,
            reason: signal.reason,
            exit_price: fill.price,
            pnl,
        })
    }

    /// Close every open position regardless of exit rules
    ///
    /// Positions without a price or whose order fails stay open and are
    /// retried on the next call.
    pub async fn liquidate_all(&mut self, reason: ExitReason, now: DateTime<Utc>) -> LiquidationReport {
        let mut report = LiquidationReport::default();
        if self.positions.open_count() == 0 {
            return report;
        }

        tracing::warn!(
            positions = self.positions.open_count(),
            reason = ?reason,
            "🚨 Liquidating all positions"
        );

        let snapshot = self.market.latest();
        let prices = self.exit_prices(&snapshot, now).await;
        let targets: Vec<(Uuid, String)> = self
            .positions
            .open_positions()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| (p.id, p.pair.clone()))
            .collect();

        for (id, pair) in targets {
            let Some(&price) = prices.get(&pair) else {
                report.failed.push((id, "no price".to_string()));
                continue;
            };

            let signal = ExitSignal {
                position_id: id,
                pair,
                price,
                reason,
            };

            match self.execute_exit(&signal, now).await {
                Ok(closed) => report.closed.push(closed),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }

        self.persist(now).await;
        report
    }

    /// Adopt an operator reset written to the store by another process
    ///
    /// Only honored once this engine's own halt has been saved, so a store
    /// that never saw the emergency cannot clear it.
    async fn sync_emergency_reset(&mut self) {
        if !self.emergency_on_record.load(Ordering::Relaxed) {
            return;
        }

        match self.store.load().await {
            Ok(Some(stored)) if !stored.safety.emergency => {
                self.safety.reset_emergency();
                self.emergency_on_record.store(false, Ordering::Relaxed);
                tracing::info!("✅ Emergency cleared by operator, trading resumes");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️  Could not check store for an emergency reset: {}", e),
        }
    }

    /// Operator acknowledgement that trading may resume
    pub async fn reset_emergency(&mut self, now: DateTime<Utc>) {
        self.safety.reset_emergency();
        self.persist(now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use crate::feed::{snapshot_channel, SnapshotPublisher};
    use crate::models::{SignalDirection, SignalSource, Tick, TradeSignal};
    use crate::persistence::MemorySnapshotStore;
    use crate::regime::{DecisionOracle, FallbackPolicy, OracleError, RuleBasedOracle};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FixedOracle {
        direction: SignalDirection,
        confidence: f64,
    }

    #[async_trait]
    impl DecisionOracle for FixedOracle {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn decide(&self, ctx: &OracleContext) -> Result<TradeSignal, OracleError> {
            Ok(TradeSignal {
                pair: ctx.pair.clone(),
                direction: self.direction,
                confidence: self.confidence,
                expected_profit_pct: 0.08,
                reasoning: "test".to_string(),
                source: SignalSource::Oracle,
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig {
            pairs: vec!["BTC/USD".to_string()],
            starting_tier: 2,
            ..Default::default()
        };
        config.evaluator.trend_filter = false;
        config
    }

    fn tick(publisher: &SnapshotPublisher, pair: &str, price: f64, at: DateTime<Utc>) {
        publisher.apply(&Tick {
            pair: pair.to_string(),
            price,
            volume: 100.0,
            timestamp: at,
        });
    }

    fn engine_with(
        direction: SignalDirection,
    ) -> (TradingEngine, SnapshotPublisher, Arc<PaperExchange>, Arc<MemorySnapshotStore>) {
        let (publisher, reader) = snapshot_channel();
        let exchange = Arc::new(PaperExchange::new(reader.clone(), 10_000.0, 0.0));
        let store = Arc::new(MemorySnapshotStore::new());
        let oracle = GuardedOracle::new(
            Box::new(FixedOracle {
                direction,
                confidence: 0.8,
            }),
            RuleBasedOracle::default(),
            FallbackPolicy::Skip,
            Duration::from_secs(5),
        );

        let deps = EngineDeps {
            exchange: exchange.clone(),
            oracle,
            store: store.clone(),
            journal: None,
            market: reader,
            feed_health: None,
        };

        let engine = TradingEngine::new(config(), deps, t0()).unwrap();
        (engine, publisher, exchange, store)
    }

    #[tokio::test]
    async fn test_cycle_opens_position_and_persists() {
        let (mut engine, publisher, _exchange, store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());

        let report = engine.run_cycle(t0()).await.unwrap();

        assert_eq!(report.opened.len(), 1);
        assert_eq!(engine.positions().open_count(), 1);
        assert_eq!(engine.safety().state().daily_trades, 1);

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.open_positions.len(), 1);
        assert!((saved.ledger.committed - engine.ledger().committed()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_quote_is_not_traded() {
        let (mut engine, publisher, _exchange, _store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0() - chrono::Duration::hours(1));

        let report = engine.run_cycle(t0()).await.unwrap();

        assert!(report.opened.is_empty());
        assert_eq!(report.rejections, vec![("BTC/USD".to_string(), "stale_data".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_entry_releases_reservation() {
        let (mut engine, publisher, exchange, _store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        exchange.fail_next_orders(1);

        let report = engine.run_cycle(t0()).await.unwrap();

        assert!(report.opened.is_empty());
        assert!(engine.ledger().committed().abs() < 1e-9);
        assert!((engine.ledger().available() - 1_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_exit_reverts_to_open() {
        let (mut engine, publisher, exchange, _store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();

        // Through the stop-loss, but the exit order is rejected
        let later = t0() + chrono::Duration::minutes(5);
        tick(&publisher, "BTC/USD", 90.0, later);
        exchange.fail_next_orders(1);

        let report = engine.run_cycle(later).await.unwrap();

        assert_eq!(report.exit_failures.len(), 1);
        assert_eq!(engine.positions().open_count(), 1);
        assert_eq!(engine.positions().open_positions()[0].status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_stop_loss_closes_and_credits_ledger() {
        let (mut engine, publisher, _exchange, _store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();
        let size = engine.positions().open_positions()[0].size;

        let later = t0() + chrono::Duration::minutes(5);
        tick(&publisher, "BTC/USD", 90.0, later);
        let report = engine.run_cycle(later).await.unwrap();

        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].reason, ExitReason::StopLoss);
        assert!((report.closed[0].pnl + size * 0.10).abs() < 1e-6);
        assert!((engine.ledger().total() - (1_000.0 - size * 0.10)).abs() < 1e-6);

        // Same cycle re-admits the pair at the new price
        assert_eq!(report.opened.len(), 1);
        assert_eq!(engine.positions().open_positions()[0].entry_price, 90.0);
    }

    #[tokio::test]
    async fn test_emergency_liquidates_and_blocks_admissions() {
        let (mut engine, publisher, _exchange, _store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();

        engine.safety.trigger_emergency("operator test");
        let later = t0() + chrono::Duration::minutes(5);
        tick(&publisher, "BTC/USD", 101.0, later);

        let report = engine.run_cycle(later).await.unwrap();
        assert!(report.liquidated);
        assert_eq!(report.closed[0].reason, ExitReason::Emergency);
        assert_eq!(engine.positions().open_count(), 0);
        assert_eq!(report.safety, SafetyStatus::Emergency);

        // Still halted on the next cycle
        let report = engine.run_cycle(later + chrono::Duration::minutes(5)).await.unwrap();
        assert!(report.opened.is_empty());

        engine.reset_emergency(later).await;
        assert!(engine.safety().status(later).is_normal());
    }

    #[tokio::test]
    async fn test_running_engine_adopts_reset_from_store() {
        let (mut engine, publisher, exchange, store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();

        engine.safety.trigger_emergency("operator test");
        let later = t0() + chrono::Duration::minutes(5);
        tick(&publisher, "BTC/USD", 101.0, later);
        assert!(engine.run_cycle(later).await.unwrap().liquidated);
        assert!(store.load().await.unwrap().unwrap().safety.emergency);

        // A separate process clears the halt through the shared store
        let deps = EngineDeps {
            exchange,
            oracle: GuardedOracle::rule_based(Default::default()),
            store: store.clone(),
            journal: None,
            market: publisher.reader(),
            feed_health: None,
        };
        let mut operator = TradingEngine::bootstrap(config(), deps, later).await.unwrap();
        assert!(operator.safety().state().emergency);
        operator.reset_emergency(later).await;

        let resumed = later + chrono::Duration::minutes(5);
        tick(&publisher, "BTC/USD", 102.0, resumed);
        let report = engine.run_cycle(resumed).await.unwrap();

        assert!(!report.liquidated);
        assert_eq!(report.safety, SafetyStatus::Normal);
        assert!(!engine.safety().state().emergency);
        assert_eq!(report.opened.len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_without_positions_is_saved() {
        let (mut engine, publisher, _exchange, store) = engine_with(SignalDirection::Hold);
        tick(&publisher, "BTC/USD", 100.0, t0());

        engine.safety.trigger_emergency("operator test");
        let report = engine.run_cycle(t0()).await.unwrap();

        assert!(report.liquidated);
        assert!(report.closed.is_empty());
        assert!(store.load().await.unwrap().unwrap().safety.emergency);

        // The store still says halted, so the next cycle stays halted
        let report = engine.run_cycle(t0() + chrono::Duration::minutes(5)).await.unwrap();
        assert!(report.liquidated);
        assert_eq!(report.safety, SafetyStatus::Emergency);
    }

    #[tokio::test]
    async fn test_unsaved_emergency_ignores_stale_store() {
        let (mut engine, publisher, _exchange, store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();
        assert!(!store.load().await.unwrap().unwrap().safety.emergency);

        // Stored snapshot predates the halt and must not be read as a reset
        engine.safety.trigger_emergency("operator test");
        let report = engine.run_cycle(t0() + chrono::Duration::minutes(5)).await.unwrap();

        assert!(report.liquidated);
        assert!(engine.safety().state().emergency);
    }

    #[tokio::test]
    async fn test_fatal_feed_stops_cycle() {
        let (mut engine, _publisher, _exchange, _store) = engine_with(SignalDirection::Long);
        let (tx, rx) = watch::channel(ConnectionState {
            fatal: Some("reconnect attempts exhausted".to_string()),
            ..Default::default()
        });
        engine.feed_health = Some(rx);

        let result = engine.run_cycle(t0()).await;
        assert!(matches!(result, Err(EngineError::Fatal(_))));
        drop(tx);
    }

    #[tokio::test]
    async fn test_bootstrap_restores_snapshot() {
        let (mut engine, publisher, exchange, store) = engine_with(SignalDirection::Long);
        tick(&publisher, "BTC/USD", 100.0, t0());
        engine.run_cycle(t0()).await.unwrap();
        let committed = engine.ledger().committed();

        let deps = EngineDeps {
            exchange,
            oracle: GuardedOracle::rule_based(Default::default()),
            store: store.clone(),
            journal: None,
            market: publisher.reader(),
            feed_health: None,
        };
        let restored = TradingEngine::bootstrap(config(), deps, t0()).await.unwrap();

        assert_eq!(restored.positions().open_count(), 1);
        assert!((restored.ledger().committed() - committed).abs() < 1e-9);
        assert_eq!(restored.levels().current_index(), 2);
    }
}
