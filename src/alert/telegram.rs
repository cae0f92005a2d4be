//! Telegram Bot API sink (`sendMessage`, HTML parse mode).

use super::AlertSink;
use crate::config::AlertConfig;
use crate::error::DeliveryError;
use crate::signal::{Direction, SignalEvent};
use crate::utils::round_to_precision;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Telegram rejects messages above this length.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Posts signal alerts to a Telegram chat.
pub struct TelegramSink {
    http: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(config: &AlertConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.telegram_api_url.trim_end_matches('/'),
                config.telegram_bot_token
            ),
            chat_id: config.telegram_chat_id.clone(),
        })
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    #[instrument(skip_all, fields(symbol = %event.symbol))]
    async fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError> {
        post_message(&self.http, &self.endpoint, &self.chat_id, &format_alert(event)).await?;
        debug!("Alert delivered to Telegram");
        Ok(())
    }
}

/// `sendMessage` with HTML parse mode; a non-ok reply becomes `Rejected`.
pub(super) async fn post_message(
    http: &Client,
    endpoint: &str,
    chat_id: &str,
    text: &str,
) -> Result<(), DeliveryError> {
    let body = SendMessage {
        chat_id,
        text,
        parse_mode: "HTML",
        disable_web_page_preview: true,
    };

    let response = http.post(endpoint).json(&body).send().await?;
    let status = response.status();
    let reply: Option<BotResponse> = response.json().await.ok();

    match reply {
        Some(reply) if status.is_success() && reply.ok => Ok(()),
        reply => Err(DeliveryError::Rejected {
            status: status.as_u16(),
            description: reply
                .and_then(|r| r.description)
                .unwrap_or_else(|| "no description".to_string()),
        }),
    }
}

/// Human-readable alert text.
pub fn format_alert(event: &SignalEvent) -> String {
    let base = event
        .symbol
        .strip_suffix("_USDT")
        .unwrap_or(&event.symbol);
    let (icon, label) = match event.direction {
        Direction::Overbought => ("🔴", "OVERBOUGHT"),
        Direction::Oversold => ("🟢", "OVERSOLD"),
    };
    let sign = if event.price_change_pct.is_sign_negative() { "" } else { "+" };

    let text = format!(
        "🚨 <b>#{base}</b> {icon} <b>{label}</b>\n\n\
         📊 <b>{symbol}</b>\n\
         Price change: <b>{sign}{change}%</b>\n\
         Last price: {price}\n\n\
         RSI 1h: {rsi_1h}\n\
         RSI 15m: {rsi_15m}\n\n\
         🕒 {at}",
        symbol = event.symbol,
        change = round_to_precision(event.price_change_pct, 2),
        price = event.last_price.normalize(),
        rsi_1h = round_to_precision(event.momentum_1h, 2),
        rsi_15m = round_to_precision(event.momentum_15m, 2),
        at = event.triggered_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );

    if text.chars().count() > MAX_MESSAGE_CHARS {
        text.chars().take(MAX_MESSAGE_CHARS - 3).chain("...".chars()).collect()
    } else {
        text
    }
}
