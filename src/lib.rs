//! # RSI Sentinel
//!
//! Real-time signal monitor for MEXC USDT perpetual futures. Emits an alert
//! when an instrument moves sharply over a short window while its momentum
//! oscillator is stretched on both the 15-minute and 1-hour horizons.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: MEXC contract API client (REST + WebSocket)
//! - `registry`: Monitored instrument set and symbol cleaning
//! - `market`: Candles, rolling windows and the momentum oscillator
//! - `signal`: Three-filter evaluation and per-instrument cooldown
//! - `alert`: Alert sinks (structured log, Telegram)
//! - `pipeline`: Feed sessions, backfill, evaluation shards and dispatch
//! - `utils`: Shared decimal helpers

pub mod alert;
pub mod config;
pub mod error;
pub mod exchange;
pub mod market;
pub mod pipeline;
pub mod registry;
pub mod signal;
pub mod utils;

pub use config::Config;
