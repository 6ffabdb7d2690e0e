use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use tierbot::api::{ExchangeAdapter, PaperExchange, RestExchangeClient};
use tierbot::db::{PostgresJournal, TradeJournal};
use tierbot::engine::EngineDeps;
use tierbot::feed::{snapshot_channel, MarketDataConnection, SnapshotReader, WebSocketStream};
use tierbot::persistence::{
    FileSnapshotStore, RedisSnapshotStore, SnapshotStore, StoreBackend,
};
use tierbot::regime::GuardedOracle;
use tierbot::{CycleScheduler, EngineConfig, TradingEngine};

#[derive(Parser)]
#[command(name = "tierbot", about = "Tiered adaptive trading engine")]
struct Cli {
    /// Config file (TOML, YAML or JSON); defaults to ./tierbot.* when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the feed and the cycle scheduler
    Run {
        /// Simulated fills against the live feed
        #[arg(long)]
        paper: bool,
    },
    /// Print the persisted engine state
    Status,
    /// Clear an emergency halt so trading can resume
    ResetEmergency,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Run { paper } => run(config, paper).await,
        Command::Status => status(config).await,
        Command::ResetEmergency => reset_emergency(config).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tierbot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    let persistence = &config.persistence;
    let store: Arc<dyn SnapshotStore> = match persistence.backend {
        StoreBackend::File => {
            tracing::info!("Snapshot store: file {}", persistence.path);
            Arc::new(FileSnapshotStore::new(&persistence.path))
        }
        StoreBackend::Redis => {
            let store = RedisSnapshotStore::new(&persistence.redis_url, &persistence.redis_key)
                .await
                .context("connecting to Redis snapshot store")?;
            tracing::info!("Snapshot store: redis {}", persistence.redis_url);
            Arc::new(store)
        }
    };
    Ok(store)
}

async fn connect_journal(config: &EngineConfig) -> Option<Arc<dyn TradeJournal>> {
    let url = config.journal.database_url.as_deref()?;

    match PostgresJournal::new(url).await {
        Ok(journal) => Some(Arc::new(journal)),
        Err(e) => {
            tracing::warn!("Trade journal disabled, Postgres unavailable: {}", e);
            None
        }
    }
}

fn paper_exchange(config: &EngineConfig, market: SnapshotReader) -> Arc<dyn ExchangeAdapter> {
    Arc::new(PaperExchange::new(
        market,
        config.initial_capital,
        config.exchange.paper_fee_pct,
    ))
}

async fn run(config: EngineConfig, paper: bool) -> anyhow::Result<()> {
    tracing::info!(
        "🚀 tierbot starting ({} mode, pairs: {})",
        if paper { "paper" } else { "live" },
        config.pairs.join(", ")
    );

    let (publisher, market) = snapshot_channel();
    let exchange: Arc<dyn ExchangeAdapter> = if paper {
        paper_exchange(&config, market.clone())
    } else {
        Arc::new(RestExchangeClient::new(&config.exchange)?)
    };

    let connection = MarketDataConnection::new(
        WebSocketStream::new(config.feed.url.clone()),
        &config.feed,
        config.pairs.clone(),
        publisher,
    );
    let feed_health = connection.health();
    let (stop_tx, stop_rx) = watch::channel(false);
    let feed_task = tokio::spawn(connection.run(stop_rx.clone()));

    let deps = EngineDeps {
        exchange,
        oracle: GuardedOracle::from_config(&config.oracle),
        store: open_store(&config).await?,
        journal: connect_journal(&config).await,
        market,
        feed_health: Some(feed_health),
    };

    let scheduler = CycleScheduler::new(config.scheduler.clone());
    let mut engine = TradingEngine::bootstrap(config, deps, Utc::now()).await?;

    let stop_tx = Arc::new(stop_tx);
    let signal_tx = stop_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, stopping...");
            let _ = signal_tx.send(true);
        }
    });

    let result = scheduler.run(&mut engine, stop_rx).await;

    // Scheduler may have halted on its own; the feed still needs the signal
    let _ = stop_tx.send(true);

    match feed_task.await {
        Ok(Err(e)) => tracing::error!("Market data feed exited: {}", e),
        Err(e) => tracing::error!("Market data task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    log_summary(&engine);
    tracing::info!("👋 tierbot stopped");

    result.map_err(Into::into)
}

fn log_summary(engine: &TradingEngine) {
    let performance = engine.positions().performance();
    let ledger = engine.ledger();

    tracing::info!("\n📊 === ENGINE SUMMARY ===");
    tracing::info!("Tier: {}", engine.levels().current().name);
    tracing::info!(
        "Capital: ${:.2} available, ${:.2} committed",
        ledger.available(),
        ledger.committed()
    );
    tracing::info!(
        "Trades: {} wins / {} losses, realized P&L ${:.2}",
        performance.total_wins,
        performance.total_losses,
        performance.realized_pnl
    );
    tracing::info!("Open positions: {}", engine.positions().open_count());
}

/// Engine over the persisted state with no live feed or exchange
async fn offline_engine(config: EngineConfig) -> anyhow::Result<TradingEngine> {
    let (_publisher, market) = snapshot_channel();
    let deps = EngineDeps {
        exchange: paper_exchange(&config, market.clone()),
        oracle: GuardedOracle::rule_based(config.oracle.rules.clone()),
        store: open_store(&config).await?,
        journal: None,
        market,
        feed_health: None,
    };

    Ok(TradingEngine::bootstrap(config, deps, Utc::now()).await?)
}

async fn status(config: EngineConfig) -> anyhow::Result<()> {
    let journal = connect_journal(&config).await;
    let engine = offline_engine(config).await?;
    let now = Utc::now();

    log_summary(&engine);
    tracing::info!("Safety: {:?}", engine.safety().status(now));
    if let Some(reason) = &engine.safety().state().emergency_reason {
        tracing::info!("Emergency reason: {}", reason);
    }

    for position in engine.positions().open_positions() {
        tracing::info!(
            "  {} {:?} ${:.2} @ {:.4} (SL {:.4}, TP {:.4}, tier {})",
            position.pair,
            position.direction,
            position.size,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
            position.tier
        );
    }

    if let Some(journal) = journal {
        let total = journal.total_realized_pnl().await?;
        tracing::info!("Journal: lifetime realized P&L ${:.2}", total);
        for closed in journal.recent_closes(10).await? {
            tracing::info!(
                "  {} {:?} pnl ${:.2} ({:?})",
                closed.pair,
                closed.direction,
                closed.realized_pnl.unwrap_or_default(),
                closed.close_reason
            );
        }
    }

    Ok(())
}

async fn reset_emergency(config: EngineConfig) -> anyhow::Result<()> {
    let mut engine = offline_engine(config).await?;
    let now = Utc::now();

    if !engine.safety().state().emergency {
        tracing::info!("No emergency halt is active");
        return Ok(());
    }

    engine.reset_emergency(now).await;
    tracing::info!("✅ Emergency cleared, status now {:?}", engine.safety().status(now));
    Ok(())
}
