//! Pipeline assembly and lifecycle.
//!
//! Owns the instrument registry, spawns every stage and replaces the feed
//! sessions wholesale when the instrument set changes.

use super::backfill::Backfiller;
use super::dispatch::AlertDispatcher;
use super::feed::{ChunkFeed, FeedSettings};
use super::shard::EvaluationShard;
use super::stats::PipelineStats;
use super::{BackfillRequest, ShardRouter};
use crate::alert::AlertSink;
use crate::config::Config;
use crate::exchange::{CandleHistory, StreamConnector};
use crate::market::Timeframe;
use crate::registry::InstrumentRegistry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Feed tasks sharing one stop signal.
struct FeedGeneration {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl FeedGeneration {
    async fn stop(self) {
        // Receivers already gone means the tasks already finished
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct Monitor {
    config: Arc<Config>,
    registry: InstrumentRegistry,
    connector: Arc<dyn StreamConnector>,
    history: Arc<dyn CandleHistory>,
    sink: Arc<dyn AlertSink>,
    stats: Arc<PipelineStats>,
}

impl Monitor {
    pub fn new(
        config: Arc<Config>,
        registry: InstrumentRegistry,
        connector: Arc<dyn StreamConnector>,
        history: Arc<dyn CandleHistory>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            history,
            sink,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` turns true, then stop every stage in order.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.registry
            .refresh()
            .await
            .context("Failed to load the instrument set")?;
        anyhow::ensure!(!self.registry.is_empty(), "No instruments to monitor");

        let monitor = &self.config.monitor;
        let symbols = self.registry.symbols();
        info!(
            instruments = symbols.len(),
            shards = monitor.evaluation_shards,
            sink = self.sink.name(),
            "🚀 Starting signal pipeline"
        );

        let (alert_tx, alert_rx) = mpsc::channel(self.config.alerts.queue_capacity.max(1));
        // Room for one warmup round plus gap requests
        let backfill_capacity = monitor
            .channel_capacity
            .max(symbols.len() * Timeframe::ALL.len() * 2);
        let (backfill_tx, backfill_rx) = mpsc::channel::<BackfillRequest>(backfill_capacity);

        let mut shard_txs = Vec::with_capacity(monitor.evaluation_shards);
        let mut shard_tasks = Vec::with_capacity(monitor.evaluation_shards);
        for id in 0..monitor.evaluation_shards {
            let (tx, rx) = mpsc::channel(monitor.channel_capacity);
            let shard = EvaluationShard::new(
                id,
                monitor,
                backfill_tx.clone(),
                alert_tx.clone(),
                self.stats.clone(),
            );
            shard_txs.push(tx);
            shard_tasks.push(tokio::spawn(shard.run(rx, shutdown.clone())));
        }
        drop(alert_tx);
        let router = ShardRouter::new(shard_txs);

        let dispatcher = AlertDispatcher::new(self.sink.clone(), self.stats.clone());
        let dispatcher_task = tokio::spawn(dispatcher.run(alert_rx));

        let backfiller = Backfiller::new(
            self.history.clone(),
            router.clone(),
            self.config.exchange.max_concurrent_requests,
            self.config.exchange.requests_per_second,
            self.stats.clone(),
        );
        let backfill_task = tokio::spawn(backfiller.run(backfill_rx, shutdown.clone()));

        let stats_task = tokio::spawn(report_stats(
            self.stats.clone(),
            Duration::from_secs(monitor.stats_interval_secs.max(1)),
            shutdown.clone(),
        ));

        router.broadcast_retain(Arc::new(symbols.iter().cloned().collect())).await;
        let mut feeds = self.spawn_feeds(&symbols, &router, &backfill_tx);

        let period = Duration::from_secs(self.config.registry.refresh_interval_secs.max(1));
        let mut refresh = interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = refresh.tick() => {
                    let change = match self.registry.refresh().await {
                        Ok(change) => change,
                        Err(e) => {
                            warn!("⚠️  Instrument refresh failed, keeping current set: {:#}", e);
                            continue;
                        }
                    };
                    if change.is_empty() {
                        debug!("Instrument set unchanged");
                        continue;
                    }
                    if self.registry.is_empty() {
                        warn!("⚠️  Instrument refresh returned nothing, keeping current sessions");
                        continue;
                    }

                    info!(
                        added = change.added.len(),
                        removed = change.removed.len(),
                        "🔄 Instrument set changed, replacing feed sessions"
                    );
                    feeds.stop().await;
                    let symbols = self.registry.symbols();
                    let universe: HashSet<String> = symbols.iter().cloned().collect();
                    router.broadcast_retain(Arc::new(universe)).await;
                    feeds = self.spawn_feeds(&symbols, &router, &backfill_tx);
                }
            }
        }

        info!("🛑 Stopping signal pipeline");
        feeds.stop().await;
        drop(router);
        drop(backfill_tx);

        let _ = backfill_task.await;
        for task in shard_tasks {
            let _ = task.await;
        }
        // Shards held the last alert senders; the dispatcher drains and exits
        let _ = dispatcher_task.await;
        let _ = stats_task.await;

        self.stats.log_summary();
        info!("✅ Signal pipeline stopped");
        Ok(())
    }

    fn spawn_feeds(
        &self,
        symbols: &[String],
        router: &ShardRouter,
        backfill_tx: &mpsc::Sender<BackfillRequest>,
    ) -> FeedGeneration {
        let (stop, stop_rx) = watch::channel(false);
        let settings = FeedSettings::from_config(&self.config.feed, self.config.monitor.window_capacity);

        let tasks: Vec<_> = symbols
            .chunks(self.config.feed.symbols_per_connection.max(1))
            .enumerate()
            .map(|(id, chunk)| {
                let feed = ChunkFeed::new(
                    id,
                    chunk.to_vec(),
                    self.connector.clone(),
                    router.clone(),
                    backfill_tx.clone(),
                    settings.clone(),
                    self.stats.clone(),
                );
                tokio::spawn(feed.run(stop_rx.clone()))
            })
            .collect();

        info!(
            connections = tasks.len(),
            symbols = symbols.len(),
            "📡 Feed sessions started"
        );
        FeedGeneration { stop, tasks }
    }
}

async fn report_stats(stats: Arc<PipelineStats>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => stats.log_summary(),
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeliveryError, FeedError};
    use crate::exchange::{MockCandleHistory, MockSymbolSource, StreamMessage, StreamSession};
    use crate::market::{Candle, Instrument};
    use crate::pipeline::Counter;
    use crate::signal::{Direction, SignalEvent};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 12, 0, 0).unwrap()
    }

    fn history_series(symbol: &str, timeframe: Timeframe, changes: &[Decimal]) -> Vec<Candle> {
        let mut close = dec!(100);
        let mut closes = vec![close];
        for change in changes {
            close += change;
            closes.push(close);
        }
        let n = closes.len() as i32;
        closes
            .into_iter()
            .enumerate()
            .map(|(i, close)| Candle {
                symbol: symbol.to_string(),
                timeframe,
                bucket_start: base() - timeframe.duration() * (n - i as i32),
                open: close,
                high: close,
                low: close,
                close,
                volume: dec!(1),
                closed: true,
            })
            .collect()
    }

    /// Streams scripted klines once, then stays silent.
    struct ReplaySession {
        script: Vec<StreamMessage>,
    }

    #[async_trait]
    impl StreamSession for ReplaySession {
        async fn next_message(&mut self) -> Option<Result<StreamMessage, FeedError>> {
            if self.script.is_empty() {
                std::future::pending::<()>().await;
            }
            Some(Ok(self.script.remove(0)))
        }

        async fn ping(&mut self) -> Result<(), FeedError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct ReplayConnector {
        subscribed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl StreamConnector for ReplayConnector {
        async fn connect(&self, symbols: &[String]) -> Result<Box<dyn StreamSession>, FeedError> {
            self.subscribed.lock().unwrap().push(symbols.to_vec());
            let script = (0..15)
                .map(|i| {
                    let close = if i < 14 {
                        dec!(100) + Decimal::from(i) * dec!(0.5)
                    } else {
                        dec!(108.5)
                    };
                    StreamMessage::Kline {
                        symbol: "BTC_USDT".to_string(),
                        timeframe: Timeframe::Min1,
                        bucket_start: base() + chrono::Duration::minutes(i),
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: dec!(2),
                    }
                })
                .collect();
            Ok(Box::new(ReplaySession { script }))
        }
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<SignalEvent>,
    }

    #[async_trait]
    impl AlertSink for ChannelSink {
        fn name(&self) -> &'static str {
            "channel"
        }

        async fn deliver(&self, event: &SignalEvent) -> Result<(), DeliveryError> {
            let _ = self.tx.send(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_end_to_end_signal() {
        let mut source = MockSymbolSource::new();
        source.expect_list_active_symbols().returning(|| {
            Ok(vec![
                Instrument::new("BTC_USDT"),
                Instrument {
                    symbol: "OLD_USDT".to_string(),
                    active: false,
                },
            ])
        });

        let mut history = MockCandleHistory::new();
        history
            .expect_fetch_candles()
            .returning(|symbol, timeframe, _, _| {
                Ok(match timeframe {
                    Timeframe::Min1 => Vec::new(),
                    Timeframe::Min15 => {
                        let changes: Vec<Decimal> = (0..7).flat_map(|_| [dec!(3), dec!(-1)]).collect();
                        history_series(symbol, timeframe, &changes)
                    }
                    Timeframe::Hour1 => {
                        let mut changes = vec![dec!(39), dec!(-11)];
                        changes.extend([Decimal::ZERO; 12]);
                        history_series(symbol, timeframe, &changes)
                    }
                })
            });

        let connector = Arc::new(ReplayConnector {
            subscribed: Mutex::new(Vec::new()),
        });
        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        let config = Arc::new(Config::default());
        let registry = InstrumentRegistry::new(Arc::new(source), &[], &[]);
        let monitor = Monitor::new(
            config,
            registry,
            connector.clone(),
            Arc::new(history),
            Arc::new(ChannelSink { tx: alert_tx }),
        );
        let stats = monitor.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));

        let event = tokio::time::timeout(Duration::from_secs(10), alert_rx.recv())
            .await
            .expect("no signal within timeout")
            .expect("sink dropped");
        assert_eq!(event.symbol, "BTC_USDT");
        assert_eq!(event.direction, Direction::Overbought);
        assert_eq!(event.price_change_pct, dec!(8.5));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            connector.subscribed.lock().unwrap().clone(),
            vec![vec!["BTC_USDT".to_string()]]
        );
        assert_eq!(stats.get(Counter::SignalsEmitted), 1);
        assert_eq!(stats.get(Counter::DeliveriesOk), 1);
        assert_eq!(stats.get(Counter::BackfillsOk), 3);
    }

    #[tokio::test]
    async fn test_empty_instrument_set_is_fatal() {
        let mut source = MockSymbolSource::new();
        source.expect_list_active_symbols().returning(|| Ok(Vec::new()));

        let monitor = Monitor::new(
            Arc::new(Config::default()),
            InstrumentRegistry::new(Arc::new(source), &[], &[]),
            Arc::new(ReplayConnector {
                subscribed: Mutex::new(Vec::new()),
            }),
            Arc::new(MockCandleHistory::new()),
            Arc::new(crate::alert::LogSink),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let err = monitor.run(shutdown_rx).await.unwrap_err();
        assert!(err.to_string().contains("No instruments"));
    }
}
