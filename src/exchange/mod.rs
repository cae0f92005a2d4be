//! MEXC futures integration.
//!
//! - REST: contract listing and kline history with retry on rate limits
//! - Streaming: chunked ticker and kline subscriptions
//!
//! The pipeline depends only on the traits in [`traits`].

mod client;
pub mod traits;
mod types;
mod websocket;

pub use client::{series_to_candles, MexcClient};
pub use traits::{CandleHistory, StreamConnector, StreamMessage, StreamSession, SymbolSource};
pub use types::{interval_code, timeframe_from_code, ContractDetail, KlineSeries};
pub use websocket::{parse_message, MexcSession, MexcStreamConnector};

#[cfg(test)]
pub use traits::{MockCandleHistory, MockSymbolSource};
