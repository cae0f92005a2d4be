//! Configuration management for the signal monitor.
//!
//! Loads settings from an optional `config.toml` layered under environment
//! variables (`SENTINEL__MONITOR__RSI_PERIOD=14`). The result is validated
//! once at startup and never mutated afterwards.

use crate::signal::EvaluatorConfig;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange endpoints and REST limits
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Streaming connection behaviour
    #[serde(default)]
    pub feed: FeedConfig,
    /// Signal thresholds and pipeline sizing
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Instrument set selection
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Alert delivery
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Retries after the first attempt for rate limits and network errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Concurrent backfill requests
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Backfill request pacing
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Symbols multiplexed on one streaming connection
    #[serde(default = "default_symbols_per_connection")]
    pub symbols_per_connection: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Silence longer than this is treated as a disconnect
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    /// Delay after a bucket ends before it is closed without a newer push
    #[serde(default = "default_close_grace")]
    pub close_grace_secs: u64,
    /// Pause between per-symbol subscription messages
    #[serde(default = "default_subscribe_delay")]
    pub subscribe_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Safety sweep interval
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Absolute percent move over the price-check window
    #[serde(default = "default_price_change_threshold")]
    pub price_change_threshold: Decimal,
    #[serde(default = "default_price_check_period")]
    pub price_check_period_minutes: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: u32,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: Decimal,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: Decimal,
    #[serde(default = "default_signal_cooldown")]
    pub signal_cooldown_secs: u64,
    /// Closed candles retained per instrument and timeframe
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_evaluation_shards")]
    pub evaluation_shards: usize,
    /// Instruments silent for longer than this are reported stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Longest time live candles are held while waiting for backfill
    #[serde(default = "default_backfill_hold")]
    pub backfill_hold_secs: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Capacity of every inter-stage channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Read symbols from this file instead of the exchange listing
    #[serde(default)]
    pub symbols_file: Option<PathBuf>,
    /// If non-empty, only these symbols are monitored
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Log,
    Telegram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub sink: SinkKind,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_secs: u64,
    /// Pending signals between the shards and the dispatcher
    #[serde(default = "default_alert_queue")]
    pub queue_capacity: usize,
    /// Answer /start, /help and /status in the alert chat (telegram sink only)
    #[serde(default = "default_bot_commands")]
    pub bot_commands: bool,
    /// Long-poll timeout of `getUpdates`
    #[serde(default = "default_command_poll")]
    pub command_poll_secs: u64,
}

// Default value functions
fn default_rest_url() -> String {
    "https://contract.mexc.com".to_string()
}

fn default_ws_url() -> String {
    "wss://contract.mexc.com/edge".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_concurrent_requests() -> usize {
    20
}

fn default_requests_per_second() -> u32 {
    15
}

fn default_symbols_per_connection() -> usize {
    200
}

fn default_ping_interval() -> u64 {
    20
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_reconnect_initial() -> u64 {
    5
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_close_grace() -> u64 {
    5
}

fn default_subscribe_delay() -> u64 {
    10
}

fn default_check_interval() -> u64 {
    60
}

fn default_price_change_threshold() -> Decimal {
    dec!(8)
}

fn default_price_check_period() -> usize {
    15
}

fn default_rsi_period() -> u32 {
    14
}

fn default_rsi_overbought() -> Decimal {
    dec!(70)
}

fn default_rsi_oversold() -> Decimal {
    dec!(30)
}

fn default_signal_cooldown() -> u64 {
    300
}

fn default_window_capacity() -> usize {
    100
}

fn default_evaluation_shards() -> usize {
    4
}

fn default_stale_after() -> u64 {
    300
}

fn default_backfill_hold() -> u64 {
    120
}

fn default_stats_interval() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_delivery_timeout() -> u64 {
    10
}

fn default_alert_queue() -> usize {
    256
}

fn default_bot_commands() -> bool {
    true
}

fn default_command_poll() -> u64 {
    30
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("registry.whitelist")
                    .with_list_parse_key("registry.blacklist"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values. Any failure is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;

        anyhow::ensure!(
            m.check_interval_secs >= 10,
            "check_interval_secs must be at least 10"
        );
        anyhow::ensure!(
            m.price_change_threshold > Decimal::ZERO,
            "price_change_threshold must be positive"
        );
        anyhow::ensure!(
            m.price_check_period_minutes >= 2,
            "price_check_period_minutes must be at least 2"
        );
        anyhow::ensure!(m.rsi_period >= 2, "rsi_period must be at least 2");
        anyhow::ensure!(
            m.rsi_oversold >= Decimal::ZERO
                && m.rsi_oversold < m.rsi_overbought
                && m.rsi_overbought <= dec!(100),
            "RSI thresholds must satisfy 0 <= oversold < overbought <= 100"
        );
        anyhow::ensure!(
            m.window_capacity >= self.min_window_capacity(),
            "window_capacity must be at least {} (rsi_period + 1 and price_check_period_minutes)",
            self.min_window_capacity()
        );
        anyhow::ensure!(
            m.evaluation_shards >= 1,
            "evaluation_shards must be at least 1"
        );
        anyhow::ensure!(m.channel_capacity >= 1, "channel_capacity must be at least 1");

        let f = &self.feed;
        anyhow::ensure!(
            f.symbols_per_connection >= 1,
            "symbols_per_connection must be at least 1"
        );
        anyhow::ensure!(
            f.reconnect_initial_secs >= 1 && f.reconnect_initial_secs <= f.reconnect_max_secs,
            "reconnect_initial_secs must be >= 1 and <= reconnect_max_secs"
        );
        anyhow::ensure!(
            f.ping_interval_secs >= 1 && f.ping_interval_secs < f.heartbeat_timeout_secs,
            "ping_interval_secs must be >= 1 and below heartbeat_timeout_secs"
        );

        anyhow::ensure!(
            self.exchange.max_concurrent_requests >= 1 && self.exchange.requests_per_second >= 1,
            "max_concurrent_requests and requests_per_second must be at least 1"
        );

        if self.alerts.sink == SinkKind::Telegram {
            anyhow::ensure!(
                !self.alerts.telegram_bot_token.trim().is_empty(),
                "telegram_bot_token is required when alerts.sink = \"telegram\""
            );
            anyhow::ensure!(
                !self.alerts.telegram_chat_id.trim().is_empty(),
                "telegram_chat_id is required when alerts.sink = \"telegram\""
            );
        }

        Ok(())
    }

    /// Settings that are legal but probably unintended.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.monitor.signal_cooldown_secs < 60 {
            warnings.push(format!(
                "signal_cooldown_secs = {} is very short, expect repeated alerts",
                self.monitor.signal_cooldown_secs
            ));
        }
        if self.monitor.price_change_threshold < dec!(5) {
            warnings.push(format!(
                "price_change_threshold = {}% is low, expect many signals",
                self.monitor.price_change_threshold
            ));
        }
        warnings
    }

    fn min_window_capacity(&self) -> usize {
        (self.monitor.rsi_period as usize + 1).max(self.monitor.price_check_period_minutes)
    }
}

impl MonitorConfig {
    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            price_change_threshold: self.price_change_threshold,
            price_check_period: self.price_check_period_minutes,
            overbought: self.rsi_overbought,
            oversold: self.rsi_oversold,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn signal_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.signal_cooldown_secs as i64)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            max_concurrent_requests: default_max_concurrent_requests(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols_per_connection: default_symbols_per_connection(),
            ping_interval_secs: default_ping_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            reconnect_initial_secs: default_reconnect_initial(),
            reconnect_max_secs: default_reconnect_max(),
            close_grace_secs: default_close_grace(),
            subscribe_delay_ms: default_subscribe_delay(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            price_change_threshold: default_price_change_threshold(),
            price_check_period_minutes: default_price_check_period(),
            rsi_period: default_rsi_period(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            signal_cooldown_secs: default_signal_cooldown(),
            window_capacity: default_window_capacity(),
            evaluation_shards: default_evaluation_shards(),
            stale_after_secs: default_stale_after(),
            backfill_hold_secs: default_backfill_hold(),
            stats_interval_secs: default_stats_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            symbols_file: None,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            telegram_api_url: default_telegram_api_url(),
            delivery_timeout_secs: default_delivery_timeout(),
            queue_capacity: default_alert_queue(),
            bot_commands: default_bot_commands(),
            command_poll_secs: default_command_poll(),
        }
    }
}
