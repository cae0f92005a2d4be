//! The real-time signal pipeline.
//!
//! ```text
//! feed chunks ──┐                      ┌─> shard 0 ─┐
//!               ├─> ShardRouter (hash) ┼─> shard 1 ─┼─> alert queue ─> dispatcher ─> sink
//! backfiller ───┘                      └─> shard N ─┘
//!      ^                                   │
//!      └──────── backfill requests ────────┘
//! ```
//!
//! Every handoff is a bounded mpsc channel. A shard is the single writer
//! for the window store, momentum states and cooldown entry of its
//! instruments.

mod backfill;
mod dispatch;
mod feed;
mod monitor;
mod shard;
mod stats;

use crate::market::{Candle, Tick, Timeframe};
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use backfill::Backfiller;
pub use dispatch::AlertDispatcher;
pub use feed::{ChunkFeed, FeedNormalizer, FeedSettings};
pub use monitor::Monitor;
pub use shard::{evaluate_once, EvaluationShard, InstrumentState, ShardSettings, SyncState};
pub use stats::{Counter, PipelineStats, StatsSnapshot};

/// Why history is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillKind {
    /// Initial history after the first connect
    Warmup,
    /// Range missed while the stream was down
    Reconnect,
    /// Hole detected between live candles
    Gap,
}

/// A request for closed candles of one (instrument, timeframe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: BackfillKind,
}

/// Answer to a [`BackfillRequest`]; failures carry the error text.
#[derive(Debug, Clone)]
pub struct BackfillResult {
    pub request: BackfillRequest,
    pub outcome: Result<Vec<Candle>, String>,
}

/// Events flowing from the ingestion side into the shards.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(Tick),
    CandleClosed(Candle),
    Backfill(BackfillResult),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            FeedEvent::Tick(tick) => &tick.symbol,
            FeedEvent::CandleClosed(candle) => &candle.symbol,
            FeedEvent::Backfill(result) => &result.request.symbol,
        }
    }
}

/// Messages accepted by an evaluation shard.
#[derive(Debug, Clone)]
pub enum ShardMsg {
    Feed(FeedEvent),
    /// Drop every instrument not in the set
    Retain(Arc<HashSet<String>>),
}

/// Hash-partitions instruments onto shard queues.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    shards: Vec<mpsc::Sender<ShardMsg>>,
}

impl ShardRouter {
    pub fn new(shards: Vec<mpsc::Sender<ShardMsg>>) -> Self {
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Stable shard index for a symbol.
    pub fn shard_for(&self, symbol: &str) -> usize {
        if self.shards.len() <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Forward an event to its shard. Returns false once the shard is gone.
    pub async fn route(&self, event: FeedEvent) -> bool {
        let Some(shard) = self.shards.get(self.shard_for(event.symbol())) else {
            return false;
        };
        shard.send(ShardMsg::Feed(event)).await.is_ok()
    }

    pub async fn broadcast_retain(&self, symbols: Arc<HashSet<String>>) {
        for shard in &self.shards {
            // A closed shard is already shutting down
            let _ = shard.send(ShardMsg::Retain(symbols.clone())).await;
        }
    }
}
