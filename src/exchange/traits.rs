//! Transport seams between the pipeline and the exchange.
//!
//! The pipeline only talks to these traits, so tests can script a stream
//! session or mock the REST history without a network.

use crate::error::FeedError;
use crate::market::{Candle, Instrument, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Decoded streaming message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Last-trade update with the cumulative 24h volume.
    Ticker {
        symbol: String,
        timestamp: DateTime<Utc>,
        last_price: Decimal,
        volume_24h: Decimal,
    },
    /// Snapshot of the currently open kline bucket.
    Kline {
        symbol: String,
        timeframe: Timeframe,
        bucket_start: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    },
    /// Pong, subscription ack or other control frame.
    Heartbeat,
}

/// REST candle history used for warmup and gap backfill.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandleHistory: Send + Sync {
    /// Closed candles with bucket start in `[start, end]`, oldest first.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError>;
}

/// Provider of the tradable instrument set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn list_active_symbols(&self) -> anyhow::Result<Vec<Instrument>>;
}

/// Opens streaming sessions for a set of symbols.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect and subscribe every symbol on every tracked timeframe.
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn StreamSession>, FeedError>;
}

/// One live streaming connection. Dropped and replaced on reconnect.
#[async_trait]
pub trait StreamSession: Send {
    /// Next decoded message; `None` once the server closed the stream.
    ///
    /// `Err(FeedError::Malformed)` is not fatal, every other error is.
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>>;

    /// Application-level keepalive.
    async fn ping(&mut self) -> Result<(), FeedError>;

    /// Best-effort close handshake.
    async fn close(&mut self);
}
