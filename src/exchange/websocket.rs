//! MEXC contract streaming session.
//!
//! One connection carries `sub.ticker` plus one `sub.kline` per tracked
//! timeframe for each symbol of its chunk. Keepalive is an application-level
//! `{"method":"ping"}`.

use crate::error::FeedError;
use crate::exchange::traits::{StreamConnector, StreamMessage, StreamSession};
use crate::exchange::types::*;
use crate::market::Timeframe;
use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens MEXC streaming sessions.
#[derive(Debug, Clone)]
pub struct MexcStreamConnector {
    url: String,
    subscribe_delay: Duration,
}

impl MexcStreamConnector {
    pub fn new(url: impl Into<String>, subscribe_delay: Duration) -> Self {
        Self {
            url: url.into(),
            subscribe_delay,
        }
    }
}

#[async_trait]
impl StreamConnector for MexcStreamConnector {
    async fn connect(&self, symbols: &[String]) -> Result<Box<dyn StreamSession>, FeedError> {
        debug!(url = %self.url, "Connecting to stream");
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|source| FeedError::Connect {
                url: self.url.clone(),
                source: Box::new(source),
            })?;

        let mut session = MexcSession { ws };
        for symbol in symbols {
            session.send(&WsRequest::sub_ticker(symbol)).await?;
            for timeframe in Timeframe::ALL {
                session.send(&WsRequest::sub_kline(symbol, timeframe)).await?;
            }
            if !self.subscribe_delay.is_zero() {
                tokio::time::sleep(self.subscribe_delay).await;
            }
        }

        info!(symbols = symbols.len(), "Stream subscribed");
        Ok(Box::new(session))
    }
}

/// A live MEXC websocket connection.
pub struct MexcSession {
    ws: WsStream,
}

impl MexcSession {
    async fn send(&mut self, request: &WsRequest<'_>) -> Result<(), FeedError> {
        let text =
            serde_json::to_string(request).map_err(|e| FeedError::Malformed(e.to_string()))?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }
}

#[async_trait]
impl StreamSession for MexcSession {
    async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
        loop {
            let frame = match self.ws.next().await? {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err.into())),
            };
            return match frame {
                Message::Text(text) => Some(parse_message(text.as_str())),
                Message::Ping(_) | Message::Pong(_) => Some(Ok(StreamMessage::Heartbeat)),
                Message::Binary(bytes) => Some(Err(FeedError::Malformed(format!(
                    "unexpected binary frame of {} bytes",
                    bytes.len()
                )))),
                Message::Close(frame) => {
                    debug!(?frame, "Stream closed by server");
                    None
                }
                Message::Frame(_) => continue,
            };
        }
    }

    async fn ping(&mut self) -> Result<(), FeedError> {
        self.send(&WsRequest::ping()).await
    }

    async fn close(&mut self) {
        if let Err(err) = self.ws.close(None).await {
            debug!(error = %err, "Close handshake failed");
        }
    }
}

/// Decode one text frame.
pub fn parse_message(text: &str) -> Result<StreamMessage, FeedError> {
    let envelope: WsEnvelope =
        serde_json::from_str(text).map_err(|e| malformed(text, e.to_string()))?;

    match envelope.channel.as_str() {
        "push.ticker" => {
            let push: TickerPush = serde_json::from_value(envelope.data)
                .map_err(|e| malformed(text, e.to_string()))?;
            if push.last_price <= Decimal::ZERO {
                return Err(malformed(text, "non-positive price".to_string()));
            }
            let timestamp = DateTime::from_timestamp_millis(push.timestamp)
                .ok_or_else(|| malformed(text, "timestamp out of range".to_string()))?;
            Ok(StreamMessage::Ticker {
                symbol: push.symbol,
                timestamp,
                last_price: push.last_price,
                volume_24h: push.volume24,
            })
        }
        "push.kline" => {
            let push: KlinePush = serde_json::from_value(envelope.data)
                .map_err(|e| malformed(text, e.to_string()))?;
            let timeframe = timeframe_from_code(&push.interval)
                .ok_or_else(|| malformed(text, format!("untracked interval {}", push.interval)))?;
            let bucket_start = DateTime::from_timestamp(push.t, 0)
                .ok_or_else(|| malformed(text, "bucket time out of range".to_string()))?;
            Ok(StreamMessage::Kline {
                symbol: push.symbol,
                timeframe,
                bucket_start: timeframe.bucket_start(bucket_start),
                open: push.o,
                high: push.h,
                low: push.l,
                close: push.c,
                volume: push.q,
            })
        }
        "rs.error" => {
            warn!(symbol = ?envelope.symbol, data = %envelope.data, "Exchange reported stream error");
            Ok(StreamMessage::Heartbeat)
        }
        "pong" => Ok(StreamMessage::Heartbeat),
        channel if channel.starts_with("rs.") => Ok(StreamMessage::Heartbeat),
        channel => Err(malformed(text, format!("unknown channel {}", channel))),
    }
}

fn malformed(text: &str, reason: String) -> FeedError {
    let preview: String = text.chars().take(120).collect();
    FeedError::Malformed(format!("{}: {}", reason, preview))
}
