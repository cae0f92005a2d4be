//! Alert delivery stage.

use super::stats::{Counter, PipelineStats};
use crate::alert::AlertSink;
use crate::signal::SignalEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Hands admitted signals to the sink, one attempt each.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    stats: Arc<PipelineStats>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, stats: Arc<PipelineStats>) -> Self {
        Self { sink, stats }
    }

    /// Deliver until every sender is gone and the queue is empty.
    pub async fn run(self, mut rx: mpsc::Receiver<SignalEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(&event).await;
        }
        info!(sink = self.sink.name(), "Alert dispatcher stopped");
    }

    async fn dispatch(&self, event: &SignalEvent) {
        match self.sink.deliver(event).await {
            Ok(()) => self.stats.incr(Counter::DeliveriesOk),
            Err(e) => {
                self.stats.incr(Counter::DeliveriesFailed);
                error!(
                    sink = self.sink.name(),
                    symbol = %event.symbol,
                    error = %e,
                    "Alert delivery failed"
                );
            }
        }
    }
}
