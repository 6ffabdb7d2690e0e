use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use super::TradeJournal;
use crate::execution::{ExitReason, Position, PositionStatus, TrailingStop};
use crate::models::Direction;
use crate::persistence::PersistenceError;

fn db_err(err: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Backend(err.to_string())
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or_default()
}

fn to_f64(value: Decimal) -> Result<f64, PersistenceError> {
    value
        .to_f64()
        .ok_or_else(|| PersistenceError::Corrupt(format!("decimal {} out of range", value)))
}

fn reason_str(reason: ExitReason) -> &'static str {
    match reason {
        ExitReason::StopLoss => "StopLoss",
        ExitReason::TakeProfit => "TakeProfit",
        ExitReason::TrailingStop => "TrailingStop",
        ExitReason::MaxHoldingTime => "MaxHoldingTime",
        ExitReason::Emergency => "Emergency",
        ExitReason::EmergencyStop => "EmergencyStop",
        ExitReason::Manual => "Manual",
    }
}

fn parse_reason(value: &str) -> Result<ExitReason, PersistenceError> {
    Ok(match value {
        "StopLoss" => ExitReason::StopLoss,
        "TakeProfit" => ExitReason::TakeProfit,
        "TrailingStop" => ExitReason::TrailingStop,
        "MaxHoldingTime" => ExitReason::MaxHoldingTime,
        "Emergency" => ExitReason::Emergency,
        "EmergencyStop" => ExitReason::EmergencyStop,
        "Manual" => ExitReason::Manual,
        other => return Err(PersistenceError::Corrupt(format!("invalid exit reason '{}'", other))),
    })
}

/// Postgres archive of closed positions
pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    /// Connect to Postgres and run migrations
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await.map_err(db_err)?;

        tracing::info!("Connected to Postgres trade journal");

        Ok(Self { pool })
    }

    /// Delete every journal row (testing only)
    #[cfg(test)]
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM closed_positions")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TradeJournal for PostgresJournal {
    async fn record_close(&self, position: &Position) -> Result<(), PersistenceError> {
        let (Some(reason), Some(pnl), Some(exit_price), Some(closed_at)) = (
            position.close_reason,
            position.realized_pnl,
            position.exit_price,
            position.closed_at,
        ) else {
            return Err(PersistenceError::Corrupt(format!(
                "position {} is not closed",
                position.id
            )));
        };

        let direction = match position.direction {
            Direction::Long => "Long",
            Direction::Short => "Short",
        };

        sqlx::query(
            r#"
            INSERT INTO closed_positions (
                id, pair, direction, tier, entry_price, exit_price, size, quantity,
                fees, stop_loss, take_profit, realized_pnl, exit_reason, opened_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(position.id)
        .bind(&position.pair)
        .bind(direction)
        .bind(&position.tier)
        .bind(to_decimal(position.entry_price))
        .bind(to_decimal(exit_price))
        .bind(to_decimal(position.size))
        .bind(to_decimal(position.quantity))
        .bind(to_decimal(position.fees))
        .bind(to_decimal(position.stop_loss))
        .bind(to_decimal(position.take_profit))
        .bind(to_decimal(pnl))
        .bind(reason_str(reason))
        .bind(position.opened_at)
        .bind(closed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::debug!(id = %position.id, pair = %position.pair, "Journaled closed position");
        Ok(())
    }

    async fn recent_closes(&self, limit: i64) -> Result<Vec<Position>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, pair, direction, tier, entry_price, exit_price, size, quantity,
                   fees, stop_loss, take_profit, realized_pnl, exit_reason, opened_at, closed_at
            FROM closed_positions
            ORDER BY closed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let direction = match row.get::<String, _>("direction").as_str() {
                "Long" => Direction::Long,
                "Short" => Direction::Short,
                other => return Err(PersistenceError::Corrupt(format!("invalid direction '{}'", other))),
            };
            let entry_price = to_f64(row.get("entry_price"))?;
            let exit_price = to_f64(row.get("exit_price"))?;
            let opened_at: DateTime<Utc> = row.get("opened_at");
            let closed_at: DateTime<Utc> = row.get("closed_at");
            let reason: String = row.get("exit_reason");

            positions.push(Position {
                id,
                pair: row.get("pair"),
                direction,
                entry_price,
                size: to_f64(row.get("size"))?,
                quantity: to_f64(row.get("quantity"))?,
                fees: to_f64(row.get("fees"))?,
                stop_loss: to_f64(row.get("stop_loss"))?,
                take_profit: to_f64(row.get("take_profit"))?,
                trailing: TrailingStop {
                    armed: false,
                    peak_price: entry_price,
                    distance_pct: 0.0,
                },
                opened_at,
                status: PositionStatus::Closed,
                close_reason: Some(parse_reason(&reason)?),
                realized_pnl: Some(to_f64(row.get("realized_pnl"))?),
                exit_price: Some(exit_price),
                closed_at: Some(closed_at),
                tier: row.get("tier"),
            });
        }

        Ok(positions)
    }

    async fn total_realized_pnl(&self) -> Result<f64, PersistenceError> {
        let row = sqlx::query("SELECT COALESCE(SUM(realized_pnl), 0) AS total_pnl FROM closed_positions")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        to_f64(row.get("total_pnl"))
    }
}
