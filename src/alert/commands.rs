//! Bot commands answered in the alert chat: `/start`, `/help`, `/status`.
//!
//! Updates are long-polled with `getUpdates`. Only messages from the
//! configured chat are answered.

use super::telegram::post_message;
use crate::config::{AlertConfig, MonitorConfig};
use crate::error::DeliveryError;
use crate::pipeline::PipelineStats;
use anyhow::Context;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
}

impl BotCommand {
    /// Parse `/cmd`, `/cmd@BotName` and `/cmd args`.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(BotCommand::Start),
            "help" => Some(BotCommand::Help),
            "status" => Some(BotCommand::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Answers management commands from pipeline counters.
pub struct CommandResponder {
    http: Client,
    api_base: String,
    chat_id: String,
    poll_secs: u64,
    monitor: MonitorConfig,
    stats: Arc<PipelineStats>,
    started: Instant,
}

impl CommandResponder {
    pub fn new(
        alerts: &AlertConfig,
        monitor: &MonitorConfig,
        stats: Arc<PipelineStats>,
    ) -> anyhow::Result<Self> {
        // The long poll must finish before the client gives up
        let http = Client::builder()
            .timeout(Duration::from_secs(
                alerts.command_poll_secs + alerts.delivery_timeout_secs,
            ))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_base: format!(
                "{}/bot{}",
                alerts.telegram_api_url.trim_end_matches('/'),
                alerts.telegram_bot_token
            ),
            chat_id: alerts.telegram_chat_id.clone(),
            poll_secs: alerts.command_poll_secs,
            monitor: monitor.clone(),
            stats,
            started: Instant::now(),
        })
    }

    /// Poll and answer until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("🤖 Bot commands enabled");
        let mut offset = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.poll_once(offset) => match polled {
                    Ok(next) => offset = next,
                    Err(e) => {
                        warn!(error = %e, "getUpdates failed");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = sleep(RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }
        info!("Bot commands stopped");
    }

    /// One `getUpdates` round. Returns the offset for the next round.
    pub async fn poll_once(&self, offset: i64) -> Result<i64, DeliveryError> {
        let response = self
            .http
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_secs.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .send()
            .await?;
        let status = response.status();
        let updates: UpdatesResponse = response.json().await?;
        if !updates.ok {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description: updates
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            });
        }

        let mut next = offset;
        for update in updates.result {
            next = next.max(update.update_id + 1);
            let Some(message) = update.message else { continue };
            if message.chat.id.to_string() != self.chat_id {
                debug!(chat = message.chat.id, "Ignoring message from another chat");
                continue;
            }
            let Some(command) = message.text.as_deref().and_then(BotCommand::parse) else {
                continue;
            };

            let endpoint = format!("{}/sendMessage", self.api_base);
            if let Err(e) = post_message(&self.http, &endpoint, &self.chat_id, &self.reply(command)).await {
                warn!(?command, error = %e, "Command reply failed");
            }
        }
        Ok(next)
    }

    pub fn reply(&self, command: BotCommand) -> String {
        let m = &self.monitor;
        match command {
            BotCommand::Start => format!(
                "👋 <b>RSI Sentinel</b>\n\n\
                 Watching MEXC USDT futures. A signal needs all three filters:\n\
                 1️⃣ Price change ≥ {}% over {} minutes\n\
                 2️⃣ RSI 1h &gt; {} or &lt; {}\n\
                 3️⃣ RSI 15m &gt; {} or &lt; {}",
                m.price_change_threshold,
                m.price_check_period_minutes,
                m.rsi_overbought,
                m.rsi_oversold,
                m.rsi_overbought,
                m.rsi_oversold,
            ),
            BotCommand::Help => "<b>📚 Commands</b>\n\n\
                 /start - what the bot watches\n\
                 /status - pipeline counters\n\
                 /help - this list"
                .to_string(),
            BotCommand::Status => {
                let s = self.stats.snapshot();
                let uptime = self.started.elapsed().as_secs();
                format!(
                    "✅ <b>Running</b> for {}h {}m\n\n\
                     🔄 Check interval: {}s\n\
                     📊 Evaluations: {}\n\
                     🚨 Signals: {} (suppressed {}, dropped {})\n\
                     📬 Delivered: {}, failed: {}\n\
                     📡 Reconnects: {}",
                    uptime / 3600,
                    uptime % 3600 / 60,
                    m.check_interval_secs,
                    s.evaluations,
                    s.signals_emitted,
                    s.signals_suppressed,
                    s.signals_dropped,
                    s.deliveries_ok,
                    s.deliveries_failed,
                    s.reconnects,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Counter;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn responder(server: &MockServer, stats: Arc<PipelineStats>) -> CommandResponder {
        let alerts = AlertConfig {
            telegram_api_url: server.uri(),
            telegram_bot_token: "123:abc".to_string(),
            telegram_chat_id: "-1001".to_string(),
            command_poll_secs: 0,
            ..AlertConfig::default()
        };
        CommandResponder::new(&alerts, &MonitorConfig::default(), stats).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(BotCommand::parse("/status"), Some(BotCommand::Status));
        assert_eq!(BotCommand::parse("/Help@sentinel_bot"), Some(BotCommand::Help));
        assert_eq!(BotCommand::parse("  /start now"), Some(BotCommand::Start));
        assert_eq!(BotCommand::parse("status"), None);
        assert_eq!(BotCommand::parse("/price BTC"), None);
        assert_eq!(BotCommand::parse(""), None);
    }

    #[tokio::test]
    async fn test_status_reply_reads_counters() {
        let server = MockServer::start().await;
        let stats = Arc::new(PipelineStats::default());
        stats.add(Counter::Evaluations, 42);
        stats.incr(Counter::SignalsEmitted);
        stats.incr(Counter::SignalsDropped);

        let text = responder(&server, stats).reply(BotCommand::Status);
        assert!(text.contains("Evaluations: 42"));
        assert!(text.contains("Signals: 1 (suppressed 0, dropped 1)"));
    }

    #[tokio::test]
    async fn test_answers_own_chat_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot123:abc/getUpdates"))
            .and(query_param("offset", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": [
                    {"update_id": 7, "message": {"message_id": 1, "chat": {"id": -1001}, "text": "/status"}},
                    {"update_id": 8, "message": {"message_id": 2, "chat": {"id": 555}, "text": "/status"}},
                    {"update_id": 9, "message": {"message_id": 3, "chat": {"id": -1001}, "text": "hello"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(serde_json::json!({"chat_id": "-1001"})))
            .and(body_string_contains("Running"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let next = responder(&server, Arc::new(PipelineStats::default()))
            .poll_once(7)
            .await
            .unwrap();
        assert_eq!(next, 10);
    }

    #[tokio::test]
    async fn test_rejected_poll_surfaces_description() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let err = responder(&server, Arc::new(PipelineStats::default()))
            .poll_once(0)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 401, .. }));
    }
}
