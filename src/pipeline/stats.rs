//! Pipeline counters, shared by every stage and logged periodically.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counted pipeline occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Ticks,
    CandlesClosed,
    MalformedMessages,
    Reconnects,
    BackfillsOk,
    BackfillsFailed,
    BackfillsDropped,
    Evaluations,
    SignalsEmitted,
    SignalsSuppressed,
    SignalsDropped,
    DeliveriesOk,
    DeliveriesFailed,
}

const COUNTERS: usize = 13;

/// Monotonic counters updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct PipelineStats {
    counters: [AtomicU64; COUNTERS],
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub candles_closed: u64,
    pub malformed_messages: u64,
    pub reconnects: u64,
    pub backfills_ok: u64,
    pub backfills_failed: u64,
    pub backfills_dropped: u64,
    pub evaluations: u64,
    pub signals_emitted: u64,
    pub signals_suppressed: u64,
    pub signals_dropped: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
}

impl PipelineStats {
    pub fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.get(Counter::Ticks),
            candles_closed: self.get(Counter::CandlesClosed),
            malformed_messages: self.get(Counter::MalformedMessages),
            reconnects: self.get(Counter::Reconnects),
            backfills_ok: self.get(Counter::BackfillsOk),
            backfills_failed: self.get(Counter::BackfillsFailed),
            backfills_dropped: self.get(Counter::BackfillsDropped),
            evaluations: self.get(Counter::Evaluations),
            signals_emitted: self.get(Counter::SignalsEmitted),
            signals_suppressed: self.get(Counter::SignalsSuppressed),
            signals_dropped: self.get(Counter::SignalsDropped),
            deliveries_ok: self.get(Counter::DeliveriesOk),
            deliveries_failed: self.get(Counter::DeliveriesFailed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            ticks = s.ticks,
            candles_closed = s.candles_closed,
            malformed = s.malformed_messages,
            reconnects = s.reconnects,
            backfills_ok = s.backfills_ok,
            backfills_failed = s.backfills_failed,
            backfills_dropped = s.backfills_dropped,
            evaluations = s.evaluations,
            signals = s.signals_emitted,
            suppressed = s.signals_suppressed,
            dropped = s.signals_dropped,
            delivered = s.deliveries_ok,
            delivery_failures = s.deliveries_failed,
            "📈 Pipeline stats"
        );
    }
}
