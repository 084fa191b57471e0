//! Progress samples queued to an external stats sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::DistributionContext;
use crate::phase::Generation;

/// One snapshot of phase progress.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSample {
    pub generation: Generation,
    /// Time since the phase started.
    pub elapsed: Duration,
    pub bytes_sent_delta: u64,
    pub bytes_received_delta: u64,
    /// Units completed so far in this phase.
    pub completed: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Receives samples fire-and-forget. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn enqueue(&self, sample: StatsSample);
}

/// Default sink: writes samples to the `tracing` log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn enqueue(&self, sample: StatsSample) {
        debug!(
            generation = sample.generation.0,
            elapsed_ms = sample.elapsed.as_millis() as u64,
            sent = sample.bytes_sent_delta,
            received = sample.bytes_received_delta,
            completed = sample.completed,
            "stats sample"
        );
    }
}

/// Forwards samples into a channel, for callers that store them elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatsSample>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatsSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn enqueue(&self, sample: StatsSample) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.tx.send(sample);
    }
}

/// Turns the process-wide byte counters into per-sample deltas.
pub(crate) struct StatsRecorder {
    generation: Generation,
    started: Instant,
    last_sent: u64,
    last_received: u64,
    sink: Arc<dyn TelemetrySink>,
}

impl StatsRecorder {
    pub(crate) fn new(
        generation: Generation,
        ctx: &DistributionContext,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            generation,
            started: Instant::now(),
            last_sent: ctx.bytes_sent(),
            last_received: ctx.bytes_received(),
            sink,
        }
    }

    pub(crate) fn sample(&mut self, ctx: &DistributionContext, completed: u64) {
        let sent = ctx.bytes_sent();
        let received = ctx.bytes_received();
        self.sink.enqueue(StatsSample {
            generation: self.generation,
            elapsed: self.started.elapsed(),
            bytes_sent_delta: sent.saturating_sub(self.last_sent),
            bytes_received_delta: received.saturating_sub(self.last_received),
            completed,
            recorded_at: Utc::now(),
        });
        self.last_sent = sent;
        self.last_received = received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_reports_deltas() {
        let ctx = DistributionContext::new();
        ctx.record_sent(100);
        let (sink, mut rx) = ChannelSink::new();
        let mut recorder = StatsRecorder::new(Generation(1), &ctx, Arc::new(sink));

        ctx.record_sent(40);
        ctx.record_received(8);
        recorder.sample(&ctx, 3);
        ctx.record_sent(2);
        recorder.sample(&ctx, 5);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.bytes_sent_delta, 40);
        assert_eq!(first.bytes_received_delta, 8);
        assert_eq!(first.completed, 3);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.bytes_sent_delta, 2);
        assert_eq!(second.bytes_received_delta, 0);
        assert_eq!(second.generation, Generation(1));
    }

    #[test]
    fn sinks_ignore_closed_receivers() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let ctx = DistributionContext::new();
        let mut recorder = StatsRecorder::new(Generation(2), &ctx, Arc::new(sink));
        recorder.sample(&ctx, 0);
        TracingSink.enqueue(StatsSample {
            generation: Generation(2),
            elapsed: Duration::ZERO,
            bytes_sent_delta: 0,
            bytes_received_delta: 0,
            completed: 0,
            recorded_at: Utc::now(),
        });
    }
}
