//! Alert sinks: where admitted signals end up.
//!
//! A sink gets exactly one delivery attempt per event. Failures are
//! reported to the caller and never retried here.

mod commands;
mod telegram;

use crate::error::DeliveryError;
use crate::signal::SignalEvent;
use async_trait::async_trait;
use tracing::info;

pub use commands::{BotCommand, CommandResponder};
pub use telegram::{format_alert, TelegramSink};

/// Receives immutable signal events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError>;
}

/// Writes each signal as one JSON line under the `signal_alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError> {
        let json = serde_json::to_string(event)?;
        info!(target: "signal_alert", "SIGNAL_ALERT: {}", json);
        Ok(())
    }
}
