//! Resilient market data connection.
//!
//! `ReconnectMachine` is the only place that decides connection state
//! transitions and reconnect delays:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!       ^             |             |
//!       |          failure    failure / stale
//!       |             v             v
//!       +-------- Backoff <---------+
//! ```
//!
//! `MarketDataConnection` drives a `MarketStream` through that machine,
//! re-issues every subscription after each (re)connect and publishes ticks
//! into the snapshot cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use super::backoff::{Backoff, BackoffConfig};
use super::cache::SnapshotPublisher;
use super::stream::MarketStream;
use super::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set once reconnects are exhausted; the feed will not recover by itself
    pub fatal: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            last_heartbeat: None,
            connected_since: None,
            last_error: None,
            fatal: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    pub backoff: BackoffConfig,
    /// No update for this long while connected forces a reconnect
    pub staleness_secs: u64,
    /// Connected this long without failure resets backoff and retry count
    pub reset_after_secs: u64,
    pub connect_timeout_secs: u64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9001/stream".to_string(),
            backoff: BackoffConfig::default(),
            staleness_secs: 30,
            reset_after_secs: 120,
            connect_timeout_secs: 10,
            max_reconnect_attempts: None,
        }
    }
}

/// Connection state machine and single source of reconnect delays
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    backoff: Backoff,
    staleness: chrono::Duration,
    reset_after: chrono::Duration,
    max_attempts: Option<u32>,
}

impl ReconnectMachine {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            state: ConnectionState::default(),
            backoff: Backoff::new(config.backoff.clone()),
            staleness: chrono::Duration::seconds(config.staleness_secs as i64),
            reset_after: chrono::Duration::seconds(config.reset_after_secs as i64),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// Disconnected/Backoff -> Connecting
    pub fn begin_connect(&mut self) {
        self.state.status = ConnectionStatus::Connecting;
    }

    /// Connecting -> Connected
    pub fn on_connected(&mut self, now: DateTime<Utc>) {
        self.state.status = ConnectionStatus::Connected;
        self.state.connected_since = Some(now);
        self.state.last_heartbeat = Some(now);
        self.state.last_error = None;
    }

    /// Record received data; a long enough healthy stretch forgives past failures
    pub fn on_heartbeat(&mut self, now: DateTime<Utc>) {
        self.state.last_heartbeat = Some(now);

        if self.state.retry_count > 0 && self.is_sustained(now) {
            tracing::info!(
                retries = self.state.retry_count,
                "Connection stable again, resetting backoff"
            );
            self.state.retry_count = 0;
            self.backoff.reset();
        }
    }

    /// Any state -> Backoff. Returns the delay to wait before reconnecting,
    /// or `RetriesExhausted` once the configured ceiling is passed.
    pub fn on_failure(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Duration, FeedError> {
        if self.state.status == ConnectionStatus::Connected && self.is_sustained(now) {
            self.state.retry_count = 0;
            self.backoff.reset();
        }

        self.state.retry_count = self.state.retry_count.saturating_add(1);
        self.state.last_error = Some(reason.into());
        self.state.connected_since = None;

        if let Some(max) = self.max_attempts {
            if self.state.retry_count > max {
                let attempts = self.state.retry_count - 1;
                self.state.status = ConnectionStatus::Disconnected;
                self.state.fatal = Some(format!(
                    "gave up after {} reconnect attempts: {}",
                    attempts,
                    self.state.last_error.as_deref().unwrap_or("unknown")
                ));
                return Err(FeedError::RetriesExhausted { attempts });
            }
        }

        self.state.status = ConnectionStatus::Backoff;
        Ok(self.backoff.next_delay())
    }

    /// True when nominally connected but nothing arrived within the threshold
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.state.status != ConnectionStatus::Connected {
            return false;
        }

        match self.state.last_heartbeat {
            Some(last) => now - last > self.staleness,
            None => true,
        }
    }

    /// Force Connected -> Backoff when the feed has gone quiet
    pub fn check_liveness(&mut self, now: DateTime<Utc>) -> Option<Result<Duration, FeedError>> {
        if self.is_stale(now) {
            Some(self.on_failure("no data within staleness threshold", now))
        } else {
            None
        }
    }

    /// Explicit shutdown, not a failure
    pub fn on_closed(&mut self) {
        self.state.status = ConnectionStatus::Disconnected;
        self.state.connected_since = None;
    }

    fn is_sustained(&self, now: DateTime<Utc>) -> bool {
        self.state
            .connected_since
            .map(|since| now - since >= self.reset_after)
            .unwrap_or(false)
    }
}

/// Market data client: drives the stream, survives disconnects, publishes snapshots
pub struct MarketDataConnection<S: MarketStream> {
    stream: S,
    machine: ReconnectMachine,
    subscriptions: Vec<String>,
    publisher: SnapshotPublisher,
    health: watch::Sender<ConnectionState>,
    staleness: Duration,
    connect_timeout: Duration,
}

impl<S: MarketStream> MarketDataConnection<S> {
    pub fn new(
        stream: S,
        config: &FeedConfig,
        subscriptions: Vec<String>,
        publisher: SnapshotPublisher,
    ) -> Self {
        let (health, _) = watch::channel(ConnectionState::default());

        Self {
            stream,
            machine: ReconnectMachine::new(config),
            subscriptions,
            publisher,
            health,
            staleness: Duration::from_secs(config.staleness_secs.max(1)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        }
    }

    /// Receiver for connection state, read by the engine each cycle
    pub fn health(&self) -> watch::Receiver<ConnectionState> {
        self.health.subscribe()
    }

    pub fn state(&self) -> &ConnectionState {
        self.machine.state()
    }

    /// Run until shutdown is signalled or reconnects are exhausted
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        tracing::info!(
            pairs = self.subscriptions.len(),
            "📡 Market data connection starting"
        );

        loop {
            if *shutdown.borrow() {
                self.stream.close().await;
                self.machine.on_closed();
                self.publish_health();
                tracing::info!("Market data connection stopped");
                return Ok(());
            }

            match self.machine.status() {
                ConnectionStatus::Disconnected
                | ConnectionStatus::Backoff
                | ConnectionStatus::Connecting => {
                    self.machine.begin_connect();
                    self.publish_health();

                    let attempt =
                        tokio::time::timeout(self.connect_timeout, self.connect_and_subscribe())
                            .await;

                    match attempt {
                        Ok(Ok(())) => {
                            self.machine.on_connected(chrono::Utc::now());
                            self.publish_health();
                            tracing::info!(
                                retries = self.machine.state().retry_count,
                                "✅ Market data connected, {} subscriptions issued",
                                self.subscriptions.len()
                            );
                        }
                        Ok(Err(e)) => self.fail(e.to_string(), &mut shutdown).await?,
                        Err(_) => self.fail("connect timed out", &mut shutdown).await?,
                    }
                }
                ConnectionStatus::Connected => {
                    let next = tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                // Nobody can stop us any more; treat as shutdown
                                self.stream.close().await;
                                self.machine.on_closed();
                                self.publish_health();
                                return Ok(());
                            }
                            continue;
                        }
                        next = tokio::time::timeout(self.staleness, self.stream.next_tick()) => next,
                    };

                    let now = chrono::Utc::now();
                    match next {
                        Ok(Ok(Some(tick))) => {
                            if tick.price.is_finite() && tick.price > 0.0 {
                                self.publisher.apply(&tick);
                            } else {
                                tracing::warn!(pair = %tick.pair, price = %tick.price, "Dropping invalid tick");
                            }
                            self.machine.on_heartbeat(now);
                        }
                        Ok(Ok(None)) => self.fail("stream closed by server", &mut shutdown).await?,
                        Ok(Err(e)) => self.fail(e.to_string(), &mut shutdown).await?,
                        Err(_) => {
                            if let Some(result) = self.machine.check_liveness(now) {
                                let delay = self.on_transition(result)?;
                                self.sleep_backoff(delay, &mut shutdown).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_subscribe(&mut self) -> Result<(), FeedError> {
        self.stream.connect().await?;
        // Subscriptions do not survive a reconnect; always re-issue them
        self.stream.subscribe(&self.subscriptions).await?;
        Ok(())
    }

    async fn fail(
        &mut self,
        reason: impl Into<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        let result = self.machine.on_failure(reason, chrono::Utc::now());
        let delay = self.on_transition(result)?;
        self.sleep_backoff(delay, shutdown).await;
        Ok(())
    }

    fn on_transition(&mut self, result: Result<Duration, FeedError>) -> Result<Duration, FeedError> {
        self.publish_health();

        match result {
            Ok(delay) => {
                let state = self.machine.state();
                tracing::warn!(
                    retry = state.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    reason = state.last_error.as_deref().unwrap_or("unknown"),
                    "⚠️  Market data disconnected, backing off"
                );
                Ok(delay)
            }
            Err(e) => {
                tracing::error!("❌ Market data connection giving up: {}", e);
                Err(e)
            }
        }
    }

    async fn sleep_backoff(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) {
        self.stream.close().await;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    fn publish_health(&self) {
        self.health.send_replace(self.machine.state().clone());
    }
}
