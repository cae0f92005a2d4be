//! Evaluation shards.
//!
//! A shard exclusively owns the window store, momentum states and cooldown
//! entries of the instruments hashed onto it, and applies their events in
//! arrival order. Closed 1m candles trigger evaluation; a periodic sweep
//! re-evaluates instruments that only saw ticks, releases expired backfill
//! holds and reports instruments that went silent.

use super::stats::{Counter, PipelineStats};
use super::{BackfillKind, BackfillRequest, BackfillResult, FeedEvent, ShardMsg};
use crate::config::MonitorConfig;
use crate::exchange::CandleHistory;
use crate::market::{Candle, MomentumState, RecordOutcome, Timeframe, WindowStore};
use crate::signal::{CooldownGate, FilterReport, SignalEvaluator, SignalEvent};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Per-shard knobs derived from [`MonitorConfig`].
#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub window_capacity: usize,
    pub rsi_period: u32,
    pub backfill_hold: Duration,
    pub stale_after: chrono::Duration,
    pub check_interval: Duration,
}

impl ShardSettings {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            window_capacity: config.window_capacity,
            rsi_period: config.rsi_period,
            backfill_hold: Duration::from_secs(config.backfill_hold_secs),
            stale_after: chrono::Duration::seconds(config.stale_after_secs as i64),
            check_interval: config.check_interval(),
        }
    }
}

/// Backfill synchronisation of one (instrument, timeframe).
#[derive(Debug, Clone)]
pub enum SyncState {
    Live,
    /// Live closed candles are parked until history arrives
    Holding {
        since: Instant,
        pending: Vec<Candle>,
        kind: BackfillKind,
    },
}

impl SyncState {
    pub fn is_live(&self) -> bool {
        matches!(self, SyncState::Live)
    }
}

/// Everything a shard keeps for one instrument.
#[derive(Debug)]
pub struct InstrumentState {
    store: WindowStore,
    momentum_15m: MomentumState,
    momentum_1h: MomentumState,
    sync: [SyncState; 3],
    /// Ticks arrived since the last evaluation
    dirty: bool,
    stale_reported: bool,
}

impl InstrumentState {
    fn new(settings: &ShardSettings, now: Instant) -> Self {
        let warming = || SyncState::Holding {
            since: now,
            pending: Vec::new(),
            kind: BackfillKind::Warmup,
        };
        Self {
            store: WindowStore::new(settings.window_capacity),
            momentum_15m: MomentumState::new(Timeframe::Min15, settings.rsi_period),
            momentum_1h: MomentumState::new(Timeframe::Hour1, settings.rsi_period),
            sync: [warming(), warming(), warming()],
            dirty: false,
            stale_reported: false,
        }
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    /// Oscillator of a momentum timeframe; `None` for the price timeframe.
    pub fn momentum(&self, timeframe: Timeframe) -> Option<&MomentumState> {
        match timeframe {
            Timeframe::Min1 => None,
            Timeframe::Min15 => Some(&self.momentum_15m),
            Timeframe::Hour1 => Some(&self.momentum_1h),
        }
    }

    pub fn sync(&self, timeframe: Timeframe) -> &SyncState {
        &self.sync[timeframe.index()]
    }

    fn momentum_mut(&mut self, timeframe: Timeframe) -> Option<&mut MomentumState> {
        match timeframe {
            Timeframe::Min1 => None,
            Timeframe::Min15 => Some(&mut self.momentum_15m),
            Timeframe::Hour1 => Some(&mut self.momentum_1h),
        }
    }

    fn apply(&mut self, candle: Candle) -> bool {
        let timeframe = candle.timeframe;
        let momentum_input = (timeframe != Timeframe::Min1).then(|| candle.clone());
        if self.store.record(candle) != RecordOutcome::Inserted {
            return false;
        }
        if let (Some(momentum), Some(candle)) = (self.momentum_mut(timeframe), momentum_input) {
            momentum.update(&candle);
        }
        self.stale_reported = false;
        true
    }

    /// End a hold: merge parked and backfilled candles, apply them in bucket
    /// order and go live. Returns the number of candles inserted.
    fn release(&mut self, timeframe: Timeframe, backfilled: Vec<Candle>) -> usize {
        let pending = match std::mem::replace(&mut self.sync[timeframe.index()], SyncState::Live) {
            SyncState::Holding { pending, .. } => pending,
            SyncState::Live => Vec::new(),
        };

        // Live candles first so they win over backfilled ones on dedup
        let mut candles: Vec<Candle> = pending
            .into_iter()
            .chain(backfilled)
            .filter(|c| c.timeframe == timeframe && c.closed)
            .collect();
        candles.sort_by_key(|c| c.bucket_start);
        candles.dedup_by_key(|c| c.bucket_start);

        candles
            .into_iter()
            .map(|candle| self.apply(candle))
            .filter(|inserted| *inserted)
            .count()
    }
}

/// Single writer for the state of its instruments.
pub struct EvaluationShard {
    id: usize,
    settings: ShardSettings,
    evaluator: SignalEvaluator,
    cooldown: CooldownGate,
    instruments: HashMap<String, InstrumentState>,
    /// Monitored set after the last registry refresh
    universe: Option<Arc<HashSet<String>>>,
    backfill_tx: mpsc::Sender<BackfillRequest>,
    alert_tx: mpsc::Sender<SignalEvent>,
    stats: Arc<PipelineStats>,
}

impl EvaluationShard {
    pub fn new(
        id: usize,
        config: &MonitorConfig,
        backfill_tx: mpsc::Sender<BackfillRequest>,
        alert_tx: mpsc::Sender<SignalEvent>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            id,
            settings: ShardSettings::from_config(config),
            evaluator: SignalEvaluator::new(config.evaluator_config()),
            cooldown: CooldownGate::new(config.signal_cooldown()),
            instruments: HashMap::new(),
            universe: None,
            backfill_tx,
            alert_tx,
            stats,
        }
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentState> {
        self.instruments.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Process messages until the queue closes or shutdown is signalled,
    /// then drain whatever is still queued.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ShardMsg>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.check_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Utc::now()).await,
                _ = shutdown.changed() => {
                    rx.close();
                    while let Some(msg) = rx.recv().await {
                        self.handle(msg).await;
                    }
                    break;
                }
            }
        }

        info!(shard = self.id, instruments = self.instruments.len(), "Evaluation shard stopped");
    }

    pub async fn handle(&mut self, msg: ShardMsg) {
        let event = match msg {
            ShardMsg::Retain(symbols) => {
                self.retain(symbols);
                return;
            }
            ShardMsg::Feed(event) => event,
        };

        if self
            .universe
            .as_ref()
            .is_some_and(|universe| !universe.contains(event.symbol()))
        {
            trace!(shard = self.id, symbol = event.symbol(), "Event for unmonitored instrument");
            return;
        }

        match event {
            FeedEvent::Tick(tick) => {
                let state = self.state_mut(&tick.symbol);
                if state.store.record_tick(&tick) {
                    state.dirty = true;
                    state.stale_reported = false;
                }
            }
            FeedEvent::CandleClosed(candle) => self.on_candle(candle).await,
            FeedEvent::Backfill(result) => self.on_backfill(result).await,
        }
    }

    /// Release expired holds, re-evaluate ticked instruments and report
    /// silent ones.
    pub async fn sweep(&mut self, now: DateTime<Utc>) {
        let hold = self.settings.backfill_hold;
        let stale_after = self.settings.stale_after;
        let clock = Instant::now();
        let mut due = Vec::new();

        for (symbol, state) in self.instruments.iter_mut() {
            for timeframe in Timeframe::ALL {
                let expired = matches!(
                    state.sync(timeframe),
                    SyncState::Holding { since, .. } if clock.duration_since(*since) >= hold
                );
                if expired {
                    let applied = state.release(timeframe, Vec::new());
                    warn!(symbol = %symbol, timeframe = %timeframe, applied, "Backfill hold expired");
                    if applied > 0 && timeframe == Timeframe::SHORTEST {
                        state.dirty = true;
                    }
                }
            }

            if state.dirty {
                due.push(symbol.clone());
            }

            let silent = state
                .store
                .last_update()
                .is_some_and(|last| now - last > stale_after);
            if silent && !state.stale_reported {
                state.stale_reported = true;
                warn!(
                    symbol = %symbol,
                    last_update = ?state.store.last_update(),
                    "No market data received recently"
                );
            }
        }

        for symbol in due {
            self.evaluate(&symbol);
        }
    }

    fn state_mut(&mut self, symbol: &str) -> &mut InstrumentState {
        let settings = &self.settings;
        self.instruments
            .entry(symbol.to_string())
            .or_insert_with(|| InstrumentState::new(settings, Instant::now()))
    }

    async fn on_candle(&mut self, candle: Candle) {
        let symbol = candle.symbol.clone();
        let timeframe = candle.timeframe;
        let capacity = self.settings.window_capacity;
        let settings = &self.settings;
        let state = self
            .instruments
            .entry(symbol.clone())
            .or_insert_with(|| InstrumentState::new(settings, Instant::now()));

        if let SyncState::Holding { pending, .. } = &mut state.sync[timeframe.index()] {
            pending.push(candle);
            if pending.len() < capacity {
                return;
            }
            let applied = state.release(timeframe, Vec::new());
            warn!(symbol = %symbol, timeframe = %timeframe, applied, "Hold buffer full, released without backfill");
            if applied > 0 && timeframe == Timeframe::SHORTEST {
                self.evaluate(&symbol);
            }
            return;
        }

        let expected = state
            .store
            .window(timeframe)
            .latest()
            .map(|latest| latest.bucket_start + timeframe.duration());
        if let Some(expected) = expected.filter(|expected| candle.bucket_start > *expected) {
            let request = BackfillRequest {
                symbol: symbol.clone(),
                timeframe,
                start: expected,
                end: candle.bucket_start - timeframe.duration(),
                kind: BackfillKind::Gap,
            };
            debug!(symbol = %symbol, timeframe = %timeframe, from = %request.start, to = %request.end, "Gap detected");

            if self.backfill_tx.try_send(request).is_ok() {
                state.sync[timeframe.index()] = SyncState::Holding {
                    since: Instant::now(),
                    pending: vec![candle],
                    kind: BackfillKind::Gap,
                };
                return;
            }
            self.stats.incr(Counter::BackfillsDropped);
            warn!(symbol = %symbol, timeframe = %timeframe, "Backfill queue full, gap left unfilled");
        }

        if state.apply(candle) && timeframe == Timeframe::SHORTEST {
            self.evaluate(&symbol);
        }
    }

    async fn on_backfill(&mut self, result: BackfillResult) {
        let BackfillResult { request, outcome } = result;
        let candles = match outcome {
            Ok(candles) => candles,
            Err(reason) => {
                debug!(symbol = %request.symbol, timeframe = %request.timeframe, %reason, "Releasing hold after failed backfill");
                Vec::new()
            }
        };

        let state = self.state_mut(&request.symbol);
        let applied = state.release(request.timeframe, candles);
        debug!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            kind = ?request.kind,
            applied,
            "Backfill merged"
        );

        if applied > 0 {
            self.evaluate(&request.symbol);
        }
    }

    fn evaluate(&mut self, symbol: &str) {
        let Some(state) = self.instruments.get_mut(symbol) else {
            return;
        };
        state.dirty = false;
        let Some(evaluated_at) = state.store.last_update() else {
            return;
        };

        let report = self.evaluator.evaluate(
            symbol,
            &state.store,
            state.momentum_1h.value(),
            state.momentum_15m.value(),
            evaluated_at,
        );
        self.stats.incr(Counter::Evaluations);

        let Some(event) = report.to_event() else {
            trace!(symbol, shock = ?report.price_shock, "No signal");
            return;
        };

        if !self.cooldown.admit(&event) {
            self.stats.incr(Counter::SignalsSuppressed);
            return;
        }

        self.stats.incr(Counter::SignalsEmitted);
        info!(
            symbol,
            direction = %event.direction,
            change_pct = %event.price_change_pct,
            rsi_1h = %event.momentum_1h,
            rsi_15m = %event.momentum_15m,
            "🚨 Signal"
        );

        // Never wait on a slow sink; ingestion keeps flowing
        match self.alert_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.stats.incr(Counter::SignalsDropped);
                warn!(
                    shard = self.id,
                    symbol = %event.symbol,
                    "Alert queue full, signal dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                warn!(shard = self.id, "Alert queue closed, signal dropped");
            }
        }
    }

    fn retain(&mut self, symbols: Arc<HashSet<String>>) {
        let before = self.instruments.len();
        self.instruments.retain(|symbol, _| symbols.contains(symbol));
        self.cooldown.retain(|symbol| symbols.contains(symbol));
        let removed = before - self.instruments.len();
        if removed > 0 {
            info!(shard = self.id, removed, "Dropped state of unmonitored instruments");
        }
        self.universe = Some(symbols);
    }
}

/// One-shot evaluation from REST history, for the `evaluate` command.
pub async fn evaluate_once(
    history: &dyn CandleHistory,
    symbol: &str,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<FilterReport> {
    let mut store = WindowStore::new(config.window_capacity);
    let mut momentum_15m = MomentumState::new(Timeframe::Min15, config.rsi_period);
    let mut momentum_1h = MomentumState::new(Timeframe::Hour1, config.rsi_period);

    for timeframe in Timeframe::ALL {
        let start = timeframe.bucket_start(now) - timeframe.duration() * config.window_capacity as i32;
        let mut candles = history
            .fetch_candles(symbol, timeframe, start, now)
            .await
            .with_context(|| format!("Failed to fetch {timeframe} candles for {symbol}"))?;
        candles.sort_by_key(|c| c.bucket_start);

        for candle in candles {
            let momentum = match timeframe {
                Timeframe::Min1 => None,
                Timeframe::Min15 => Some(&mut momentum_15m),
                Timeframe::Hour1 => Some(&mut momentum_1h),
            };
            if let Some(momentum) = momentum {
                momentum.update(&candle);
            }
            store.record(candle);
        }
    }

    let evaluator = SignalEvaluator::new(config.evaluator_config());
    Ok(evaluator.evaluate(
        symbol,
        &store,
        momentum_1h.value(),
        momentum_15m.value(),
        store.last_update().unwrap_or(now),
    ))
}
