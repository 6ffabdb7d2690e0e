use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{ExchangeAdapter, ExchangeConfig, ExchangeError, Fill, PriceQuote};
use crate::models::OrderSide;

// Type alias for the rate limiter to simplify signatures
type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    pair: &'a str,
    side: OrderSide,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
    #[serde(default)]
    volume: f64,
}

/// Generic JSON REST exchange client
///
/// Endpoints: `GET /price?pair=`, `POST /orders`, `GET /balance`.
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct RestExchangeClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<ExchangeRateLimiter>,
}

impl RestExchangeClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|e| ExchangeError::Network(format!("failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let response = self.authorized(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout(e.to_string())
            } else {
                ExchangeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn classify_status(status: StatusCode, body: String) -> ExchangeError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ExchangeError::Network(format!("{}: {}", status, body));
    }
    if status == StatusCode::NOT_FOUND {
        return ExchangeError::UnknownPair(body);
    }
    if body.to_ascii_lowercase().contains("insufficient") {
        return ExchangeError::InsufficientFunds(body);
    }
    ExchangeError::Rejected(format!("{}: {}", status, body))
}

#[async_trait]
impl ExchangeAdapter for RestExchangeClient {
    async fn fetch_price(&self, pair: &str) -> Result<PriceQuote, ExchangeError> {
        let url = format!("{}/price", self.base_url);
        let response = self.send(self.client.get(&url).query(&[("pair", pair)])).await?;

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        if !(body.price.is_finite() && body.price > 0.0) {
            return Err(ExchangeError::InvalidResponse(format!(
                "{}: price {}",
                pair, body.price
            )));
        }

        Ok(PriceQuote {
            price: body.price,
            volume: body.volume,
        })
    }

    async fn place_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<Fill, ExchangeError> {
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(ExchangeError::Rejected(format!("invalid quantity {}", quantity)));
        }

        let url = format!("{}/orders", self.base_url);
        let order = OrderRequest {
            pair,
            side,
            quantity,
        };

        tracing::info!(pair, side = ?side, quantity, "Placing market order");
        let response = self.send(self.client.post(&url).json(&order)).await?;

        let fill: Fill = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        if !(fill.price.is_finite() && fill.price > 0.0 && fill.quantity > 0.0) {
            return Err(ExchangeError::InvalidResponse(format!("bad fill {:?}", fill)));
        }

        Ok(fill)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        let url = format!("{}/balance", self.base_url);
        let response = self.send(self.client.get(&url)).await?;

        response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))
    }
}
