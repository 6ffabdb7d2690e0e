/// LLM-backed decision oracle over an OpenAI-compatible chat endpoint
///
/// The model gets the oracle context as JSON and must answer with
/// `{direction, confidence, expectedProfitPct, reasoning}`.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::oracle::{DecisionOracle, OracleContext, OracleError};
use crate::models::{SignalDirection, SignalSource, TradeSignal};

const SYSTEM_PROMPT: &str = "You are a trading decision oracle. Given market context as JSON, reply with JSON only: {\"direction\": \"long|short|hold\", \"confidence\": 0.0-1.0, \"expectedProfitPct\": fraction, \"reasoning\": \"...\"}.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 512,
            retry_delay_ms: 2500,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct LlmReply {
    pub direction: String,
    pub confidence: f64,
    #[serde(rename = "expectedProfitPct", alias = "expected_profit_pct")]
    pub expected_profit_pct: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl LlmReply {
    /// Parse model output, tolerating markdown code fences
    pub fn parse(text: &str) -> Result<Self, OracleError> {
        let mut text = text.trim();
        if text.starts_with("```") {
            text = text
                .trim_start_matches("```json")
                .trim_start_matches("```")
                .trim_end_matches("```")
                .trim();
        }

        serde_json::from_str(text).map_err(|e| OracleError::Parse(format!("{} (text: {})", e, text)))
    }

    pub fn into_signal(self, pair: &str) -> Result<TradeSignal, OracleError> {
        let direction = match self.direction.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => SignalDirection::Long,
            "short" | "sell" => SignalDirection::Short,
            "hold" | "none" => SignalDirection::Hold,
            other => return Err(OracleError::Parse(format!("unknown direction '{}'", other))),
        };

        if !self.confidence.is_finite() || !self.expected_profit_pct.is_finite() {
            return Err(OracleError::Parse("non-finite numbers".to_string()));
        }

        // Models sometimes answer 8 for 8%
        let expected_profit_pct = if self.expected_profit_pct.abs() > 1.0 {
            self.expected_profit_pct / 100.0
        } else {
            self.expected_profit_pct
        };

        Ok(TradeSignal {
            pair: pair.to_string(),
            direction,
            confidence: self.confidence.clamp(0.0, 1.0),
            expected_profit_pct,
            reasoning: self.reasoning,
            source: SignalSource::Oracle,
        })
    }
}

pub struct LlmOracle {
    api_key: String,
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmOracle {
    pub fn new(api_key: String, config: LlmConfig) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Build from config, reading the key from the configured variable
    pub fn from_env(config: LlmConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            OracleError::Unavailable(format!("{} is not set", config.api_key_env))
        })?;
        Ok(Self::new(api_key, config))
    }

    async fn request_once(&self, prompt: &str) -> Result<String, OracleError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: 0.0, // Deterministic responses
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", &self.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Api { status, body });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(format!("JSON decode error: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| OracleError::Parse("no choices in reply".to_string()))
    }
}

#[async_trait]
impl DecisionOracle for LlmOracle {
    fn name(&self) -> &str {
        "llm"
    }

    async fn decide(&self, ctx: &OracleContext) -> Result<TradeSignal, OracleError> {
        let prompt = serde_json::to_string(ctx).map_err(|e| OracleError::Parse(e.to_string()))?;

        let mut retry_count = 0;
        loop {
            if retry_count > 0 {
                // Exponential backoff
                let delay_ms = self.config.retry_delay_ms * 2_u64.pow(retry_count - 1);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let result = self
                .request_once(&prompt)
                .await
                .and_then(|text| LlmReply::parse(&text))
                .and_then(|reply| reply.into_signal(&ctx.pair));

            let err = match result {
                Ok(signal) => return Ok(signal),
                Err(e) => e,
            };

            let retryable = match &err {
                OracleError::Api { status, .. } => *status == 429 || *status >= 500,
                OracleError::Http(_) | OracleError::Parse(_) => true,
                _ => false,
            };

            retry_count += 1;
            if !retryable || retry_count >= self.config.max_retries.max(1) {
                return Err(err);
            }

            tracing::debug!(attempt = retry_count, "LLM oracle retry: {}", err);
        }
    }
}
