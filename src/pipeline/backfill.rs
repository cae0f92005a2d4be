//! REST history fetches for warmup, reconnect and gap backfill.
//!
//! Requests are paced to the exchange rate limit and bounded by a
//! semaphore. Every answer, success or failure, goes back to the owning
//! shard so it can release its hold.

use super::stats::{Counter, PipelineStats};
use super::{BackfillRequest, BackfillResult, FeedEvent, ShardRouter};
use crate::exchange::CandleHistory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Backfiller {
    history: Arc<dyn CandleHistory>,
    router: ShardRouter,
    semaphore: Arc<Semaphore>,
    pacing: Duration,
    stats: Arc<PipelineStats>,
}

impl Backfiller {
    pub fn new(
        history: Arc<dyn CandleHistory>,
        router: ShardRouter,
        max_concurrent: usize,
        requests_per_second: u32,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            history,
            router,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pacing: Duration::from_secs(1) / requests_per_second.max(1),
            stats,
        }
    }

    /// Serve requests until the queue closes or shutdown is signalled.
    /// In-flight fetches are aborted on shutdown.
    pub async fn run(self, mut rx: mpsc::Receiver<BackfillRequest>, mut shutdown: watch::Receiver<bool>) {
        let mut pace = interval(self.pacing);
        pace.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            let request = tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                _ = shutdown.changed() => {
                    tasks.abort_all();
                    info!("Backfill stopped");
                    return;
                }
            };

            pace.tick().await;
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => {
                    tasks.abort_all();
                    return;
                }
            };

            let history = self.history.clone();
            let router = self.router.clone();
            let stats = self.stats.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = history
                    .fetch_candles(&request.symbol, request.timeframe, request.start, request.end)
                    .await;

                let outcome = match outcome {
                    Ok(candles) => {
                        stats.incr(Counter::BackfillsOk);
                        debug!(
                            symbol = %request.symbol,
                            timeframe = %request.timeframe,
                            kind = ?request.kind,
                            candles = candles.len(),
                            "Backfill fetched"
                        );
                        Ok(candles)
                    }
                    Err(err) => {
                        stats.incr(Counter::BackfillsFailed);
                        warn!(
                            symbol = %request.symbol,
                            timeframe = %request.timeframe,
                            kind = ?request.kind,
                            error = %err,
                            "Backfill failed"
                        );
                        Err(err.to_string())
                    }
                };

                router
                    .route(FeedEvent::Backfill(BackfillResult { request, outcome }))
                    .await;
            });
        }

        // Queue closed: let started fetches deliver their answers
        while tasks.join_next().await.is_some() {}
        info!("Backfill stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedError;
    use crate::exchange::MockCandleHistory;
    use crate::market::{Candle, Timeframe};
    use crate::pipeline::{BackfillKind, ShardMsg};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn request(symbol: &str, timeframe: Timeframe) -> BackfillRequest {
        BackfillRequest {
            symbol: symbol.to_string(),
            timeframe,
            start: Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 8, 1, 1, 0, 0).unwrap(),
            kind: BackfillKind::Warmup,
        }
    }

    #[tokio::test]
    async fn test_results_reach_the_router() {
        let mut history = MockCandleHistory::new();
        history
            .expect_fetch_candles()
            .withf(|symbol, _, _, _| symbol.starts_with("BTC"))
            .returning(|symbol, timeframe, start, _| {
                Ok(vec![Candle {
                    symbol: symbol.to_string(),
                    timeframe,
                    bucket_start: start,
                    open: dec!(1),
                    high: dec!(1),
                    low: dec!(1),
                    close: dec!(1),
                    volume: dec!(1),
                    closed: true,
                }])
            });
        history
            .expect_fetch_candles()
            .withf(|symbol, _, _, _| symbol.starts_with("DOGE"))
            .returning(|_, _, _, _| Err(FeedError::RateLimited { attempts: 4 }));

        let (shard_tx, mut shard_rx) = mpsc::channel(8);
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PipelineStats::default());
        let backfiller = Backfiller::new(
            Arc::new(history),
            ShardRouter::new(vec![shard_tx]),
            2,
            100,
            stats.clone(),
        );

        tx.send(request("BTC_USDT", Timeframe::Min15)).await.unwrap();
        tx.send(request("DOGE_USDT", Timeframe::Hour1)).await.unwrap();
        drop(tx);
        backfiller.run(rx, shutdown_rx).await;

        let mut ok = 0;
        let mut failed = 0;
        while let Ok(ShardMsg::Feed(FeedEvent::Backfill(result))) = shard_rx.try_recv() {
            match result.outcome {
                Ok(candles) => {
                    assert_eq!(result.request.symbol, "BTC_USDT");
                    assert_eq!(candles.len(), 1);
                    ok += 1;
                }
                Err(reason) => {
                    assert_eq!(result.request.symbol, "DOGE_USDT");
                    assert!(reason.contains("4 attempts"));
                    failed += 1;
                }
            }
        }
        assert_eq!((ok, failed), (1, 1));
        assert_eq!(stats.get(Counter::BackfillsOk), 1);
        assert_eq!(stats.get(Counter::BackfillsFailed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let history = MockCandleHistory::new();
        let (shard_tx, _shard_rx) = mpsc::channel(8);
        let (_tx, rx) = mpsc::channel::<BackfillRequest>(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backfiller = Backfiller::new(
            Arc::new(history),
            ShardRouter::new(vec![shard_tx]),
            1,
            10,
            Arc::new(PipelineStats::default()),
        );

        let handle = tokio::spawn(backfiller.run(rx, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio_test::assert_ok!(handle.await);
    }
}
