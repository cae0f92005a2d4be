//! Per-instrument alert suppression.

use super::event::SignalEvent;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Gate state of one instrument at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Suppressed { until: DateTime<Utc> },
}

/// Suppresses repeat events for an instrument until its cooldown elapsed.
///
/// Time is measured on the event's own trigger timestamp, so replaying the
/// same sequence always yields the same decisions.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    cooldown: Duration,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: HashMap::new(),
        }
    }

    pub fn state(&self, symbol: &str, at: DateTime<Utc>) -> GateState {
        match self.last_fired.get(symbol) {
            Some(fired) if at - *fired < self.cooldown => GateState::Suppressed {
                until: *fired + self.cooldown,
            },
            _ => GateState::Idle,
        }
    }

    /// Returns true and records the fire time if the event may pass.
    /// Suppressed events are dropped, never queued.
    pub fn admit(&mut self, event: &SignalEvent) -> bool {
        match self.state(&event.symbol, event.triggered_at) {
            GateState::Idle => {
                self.last_fired
                    .insert(event.symbol.clone(), event.triggered_at);
                true
            }
            GateState::Suppressed { until } => {
                debug!(
                    symbol = %event.symbol,
                    until = %until,
                    "Signal suppressed by cooldown"
                );
                false
            }
        }
    }

    /// Drop entries of instruments no longer monitored.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.last_fired.retain(|symbol, _| keep(symbol));
    }

    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}
