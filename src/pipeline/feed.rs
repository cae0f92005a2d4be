//! Streaming ingestion: one task per chunk of symbols.
//!
//! Each connection is an owned session. Per-session state (open kline
//! buckets, cumulative volume readings) lives in a [`FeedNormalizer`] that
//! is created with the session and dropped with it. On any loss the task
//! reconnects with capped doubling backoff and asks for the missed range.

use super::stats::{Counter, PipelineStats};
use super::{BackfillKind, BackfillRequest, FeedEvent, ShardRouter};
use crate::error::FeedError;
use crate::exchange::{StreamConnector, StreamMessage, StreamSession};
use crate::market::{Candle, Tick, Timeframe};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing knobs of a feed task.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub ping_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// Delay after a bucket ends before closing it without a newer push
    pub close_grace: chrono::Duration,
    /// How often elapsed buckets are flushed
    pub flush_interval: Duration,
    /// Buckets of history requested per timeframe after the first connect
    pub warmup_buckets: usize,
}

impl FeedSettings {
    pub fn from_config(feed: &crate::config::FeedConfig, window_capacity: usize) -> Self {
        Self {
            ping_interval: Duration::from_secs(feed.ping_interval_secs),
            heartbeat_timeout: Duration::from_secs(feed.heartbeat_timeout_secs),
            reconnect_initial: Duration::from_secs(feed.reconnect_initial_secs),
            reconnect_max: Duration::from_secs(feed.reconnect_max_secs),
            close_grace: chrono::Duration::seconds(feed.close_grace_secs as i64),
            flush_interval: Duration::from_secs(1),
            warmup_buckets: window_capacity,
        }
    }
}

/// Turns raw stream messages into ticks and closed candles.
#[derive(Debug)]
pub struct FeedNormalizer {
    close_grace: chrono::Duration,
    open: HashMap<(String, Timeframe), Candle>,
    last_closed: HashMap<(String, Timeframe), DateTime<Utc>>,
    volume_24h: HashMap<String, Decimal>,
}

impl FeedNormalizer {
    pub fn new(close_grace: chrono::Duration) -> Self {
        Self {
            close_grace,
            open: HashMap::new(),
            last_closed: HashMap::new(),
            volume_24h: HashMap::new(),
        }
    }

    pub fn on_message(&mut self, message: StreamMessage) -> Vec<FeedEvent> {
        match message {
            StreamMessage::Ticker {
                symbol,
                timestamp,
                last_price,
                volume_24h,
            } => {
                // First reading of a session has no baseline; a shrinking
                // rolling 24h total counts as zero.
                let previous = self.volume_24h.insert(symbol.clone(), volume_24h);
                let volume = previous
                    .map(|prev| (volume_24h - prev).max(Decimal::ZERO))
                    .unwrap_or(Decimal::ZERO);
                vec![FeedEvent::Tick(Tick {
                    symbol,
                    timestamp,
                    price: last_price,
                    volume,
                })]
            }
            StreamMessage::Kline {
                symbol,
                timeframe,
                bucket_start,
                open,
                high,
                low,
                close,
                volume,
            } => {
                let key = (symbol, timeframe);
                if self
                    .last_closed
                    .get(&key)
                    .is_some_and(|closed| bucket_start <= *closed)
                {
                    debug!(symbol = %key.0, timeframe = %timeframe, bucket = %bucket_start, "Late kline push ignored");
                    return Vec::new();
                }

                let snapshot = Candle {
                    symbol: key.0.clone(),
                    timeframe,
                    bucket_start,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    closed: false,
                };

                let mut events = Vec::new();
                match self.open.get(&key) {
                    Some(current) if current.bucket_start > bucket_start => {
                        debug!(symbol = %key.0, timeframe = %timeframe, "Out-of-order kline push ignored");
                        return events;
                    }
                    Some(current) if current.bucket_start < bucket_start => {
                        if let Some(finished) = self.open.remove(&key) {
                            events.push(self.close(finished));
                        }
                    }
                    _ => {}
                }
                self.open.insert(key, snapshot);
                events
            }
            StreamMessage::Heartbeat => Vec::new(),
        }
    }

    /// Close every open bucket whose end plus the grace period has passed.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<FeedEvent> {
        let due: Vec<_> = self
            .open
            .iter()
            .filter(|(_, candle)| candle.close_time() + self.close_grace <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let finished: Vec<Candle> = due
            .into_iter()
            .filter_map(|key| self.open.remove(&key))
            .collect();
        let mut events: Vec<FeedEvent> = finished
            .into_iter()
            .map(|candle| self.close(candle))
            .collect();
        events.sort_by_key(|event| match event {
            FeedEvent::CandleClosed(c) => Some(c.bucket_start),
            _ => None,
        });
        events
    }

    fn close(&mut self, mut candle: Candle) -> FeedEvent {
        candle.closed = true;
        self.last_closed.insert(
            (candle.symbol.clone(), candle.timeframe),
            candle.bucket_start,
        );
        FeedEvent::CandleClosed(candle)
    }
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(FeedError),
}

/// Owns the streaming connection of one chunk of symbols.
pub struct ChunkFeed {
    id: usize,
    symbols: Vec<String>,
    connector: Arc<dyn StreamConnector>,
    router: ShardRouter,
    backfill_tx: mpsc::Sender<BackfillRequest>,
    settings: FeedSettings,
    stats: Arc<PipelineStats>,
}

impl ChunkFeed {
    pub fn new(
        id: usize,
        symbols: Vec<String>,
        connector: Arc<dyn StreamConnector>,
        router: ShardRouter,
        backfill_tx: mpsc::Sender<BackfillRequest>,
        settings: FeedSettings,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            id,
            symbols,
            connector,
            router,
            backfill_tx,
            settings,
            stats,
        }
    }

    /// Connect, stream and reconnect until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut backoff = self.settings.reconnect_initial;
        let mut warmed_up = false;
        let mut disconnected_at: Option<DateTime<Utc>> = None;

        loop {
            if *stop.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.connector.connect(&self.symbols) => result,
                _ = stop.changed() => break,
            };

            match connected {
                Ok(session) => {
                    info!(chunk = self.id, symbols = self.symbols.len(), "✅ Stream connected");
                    backoff = self.settings.reconnect_initial;

                    let now = Utc::now();
                    if !warmed_up {
                        self.request_backfill(BackfillKind::Warmup, None, now);
                        warmed_up = true;
                    } else if let Some(since) = disconnected_at.take() {
                        self.request_backfill(BackfillKind::Reconnect, Some(since), now);
                    }

                    match self.drive(session, &mut stop).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(err) => {
                            warn!(chunk = self.id, error = %err, "Stream lost");
                            self.stats.incr(Counter::Reconnects);
                            disconnected_at.get_or_insert_with(Utc::now);
                        }
                    }
                }
                Err(err) => {
                    warn!(chunk = self.id, error = %err, retry_in = ?backoff, "Stream connect failed");
                }
            }

            tokio::select! {
                _ = sleep(backoff) => {}
                _ = stop.changed() => break,
            }
            backoff = (backoff * 2).min(self.settings.reconnect_max);
        }

        info!(chunk = self.id, "Stream task stopped");
    }

    async fn drive(
        &self,
        mut session: Box<dyn StreamSession>,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut normalizer = FeedNormalizer::new(self.settings.close_grace);

        let start = Instant::now();
        let mut ping = interval_at(start + self.settings.ping_interval, self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval_at(start + self.settings.flush_interval, self.settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_message = start;

        loop {
            let events = tokio::select! {
                _ = stop.changed() => {
                    session.close().await;
                    return SessionEnd::Shutdown;
                }
                _ = sleep_until(last_message + self.settings.heartbeat_timeout) => {
                    session.close().await;
                    return SessionEnd::Lost(FeedError::HeartbeatTimeout(self.settings.heartbeat_timeout));
                }
                _ = ping.tick() => {
                    if let Err(err) = session.ping().await {
                        return SessionEnd::Lost(err);
                    }
                    continue;
                }
                _ = flush.tick() => normalizer.flush(Utc::now()),
                message = session.next_message() => {
                    last_message = Instant::now();
                    match message {
                        None => return SessionEnd::Lost(FeedError::Closed),
                        Some(Err(FeedError::Malformed(reason))) => {
                            self.stats.incr(Counter::MalformedMessages);
                            debug!(chunk = self.id, %reason, "Dropping malformed message");
                            continue;
                        }
                        Some(Err(err)) => return SessionEnd::Lost(err),
                        Some(Ok(message)) => normalizer.on_message(message),
                    }
                }
            };

            for event in events {
                match &event {
                    FeedEvent::Tick(_) => self.stats.incr(Counter::Ticks),
                    FeedEvent::CandleClosed(_) => self.stats.incr(Counter::CandlesClosed),
                    FeedEvent::Backfill(_) => {}
                }
                if !self.router.route(event).await {
                    session.close().await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    /// Queue history requests for every symbol and timeframe of the chunk.
    /// Never waits: a full queue drops the request and the shard's hold
    /// timeout takes over.
    fn request_backfill(
        &self,
        kind: BackfillKind,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let mut dropped = 0usize;
        for symbol in &self.symbols {
            for timeframe in Timeframe::ALL {
                let start = match since {
                    Some(since) => timeframe.bucket_start(since) - timeframe.duration(),
                    None => {
                        timeframe.bucket_start(now)
                            - timeframe.duration() * self.settings.warmup_buckets as i32
                    }
                };
                let request = BackfillRequest {
                    symbol: symbol.clone(),
                    timeframe,
                    start,
                    end: now,
                    kind,
                };
                if self.backfill_tx.try_send(request).is_err() {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            self.stats.add(Counter::BackfillsDropped, dropped as u64);
            warn!(chunk = self.id, dropped, ?kind, "Backfill queue full, requests dropped");
        } else {
            debug!(chunk = self.id, ?kind, "Backfill requested");
        }
    }
}
