//! MEXC contract REST client (public endpoints only).

use crate::config::ExchangeConfig;
use crate::error::FeedError;
use crate::exchange::traits::{CandleHistory, SymbolSource};
use crate::exchange::types::*;
use crate::market::{Candle, Instrument, Timeframe};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// REST client for contract listings and kline history.
#[derive(Clone)]
pub struct MexcClient {
    http: Client,
    base_url: String,
    max_retries: u32,
    /// Unit of the retry waits: network errors wait `base * 2^n`,
    /// rate limits `base * 2^(n+2)`
    retry_base: Duration,
}

impl MexcClient {
    /// Create a new client from configuration.
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("rsi-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Override the unit of retry waits.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// GET with the retry policy: 429 and network failures are retried up to
    /// `max_retries` times; any other non-success status fails at once.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let result = self.http.get(&url).query(query).send().await;

            let wait = match result {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= self.max_retries {
                        return Err(FeedError::RateLimited {
                            attempts: attempt + 1,
                        });
                    }
                    warn!(url = %url, attempt, "Rate limited by exchange");
                    self.retry_base * 2u32.pow(attempt + 2)
                }
                Ok(response) if !response.status().is_success() => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(FeedError::Status { status, body });
                }
                Ok(response) => return Ok(response.json::<T>().await?),
                Err(err) => {
                    let err = FeedError::from(err);
                    if !err.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    warn!(url = %url, attempt, error = %err, "Request failed, retrying");
                    self.retry_base * 2u32.pow(attempt)
                }
            };

            debug!(url = %url, wait_ms = wait.as_millis() as u64, "Waiting before retry");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// All enabled USDT-margined contracts, sorted by symbol.
    #[instrument(skip(self))]
    pub async fn get_usdt_contracts(&self) -> Result<Vec<String>, FeedError> {
        let response: ApiResponse<Vec<ContractDetail>> =
            self.get_json("/api/v1/contract/detail", &[]).await?;
        if !response.success {
            return Err(FeedError::Api(
                response
                    .message
                    .unwrap_or_else(|| format!("code {}", response.code)),
            ));
        }

        let mut symbols: Vec<String> = response
            .data
            .unwrap_or_default()
            .into_iter()
            .filter(ContractDetail::is_usdt_enabled)
            .map(|c| c.symbol)
            .collect();
        symbols.sort();
        symbols.dedup();

        debug!(count = symbols.len(), "Fetched USDT contracts");
        Ok(symbols)
    }

    /// Closed klines in `[start, end]`; the still-open bucket is dropped.
    #[instrument(skip(self))]
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError> {
        let path = format!("/api/v1/contract/kline/{}", symbol);
        let query = [
            ("interval", interval_code(timeframe).to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ];
        let response: ApiResponse<KlineSeries> = self.get_json(&path, &query).await?;
        if !response.success {
            return Err(FeedError::Api(
                response
                    .message
                    .unwrap_or_else(|| format!("code {}", response.code)),
            ));
        }

        let series = response.data.unwrap_or_default();
        series_to_candles(symbol, timeframe, &series, Utc::now())
    }
}

/// Convert a columnar series to closed candles, oldest first.
///
/// A bucket counts as closed once its end is not after `now`.
pub fn series_to_candles(
    symbol: &str,
    timeframe: Timeframe,
    series: &KlineSeries,
    now: DateTime<Utc>,
) -> Result<Vec<Candle>, FeedError> {
    if !series.is_consistent() {
        return Err(FeedError::Malformed(format!(
            "kline columns of different length for {}",
            symbol
        )));
    }

    let mut candles = Vec::with_capacity(series.time.len());
    for i in 0..series.time.len() {
        let Some(ts) = DateTime::from_timestamp(series.time[i], 0) else {
            return Err(FeedError::Malformed(format!(
                "kline time {} out of range",
                series.time[i]
            )));
        };
        let candle = Candle {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start: timeframe.bucket_start(ts),
            open: series.open[i],
            high: series.high[i],
            low: series.low[i],
            close: series.close[i],
            volume: series.vol.get(i).copied().unwrap_or_default(),
            closed: true,
        };
        if candle.close_time() <= now {
            candles.push(candle);
        }
    }

    candles.sort_by_key(|c| c.bucket_start);
    candles.dedup_by_key(|c| c.bucket_start);
    Ok(candles)
}

#[async_trait]
impl CandleHistory for MexcClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError> {
        self.get_klines(symbol, timeframe, start, end).await
    }
}

#[async_trait]
impl SymbolSource for MexcClient {
    async fn list_active_symbols(&self) -> anyhow::Result<Vec<Instrument>> {
        let symbols = self
            .get_usdt_contracts()
            .await
            .context("Failed to fetch contract listing")?;
        Ok(symbols.into_iter().map(Instrument::new).collect())
    }
}
