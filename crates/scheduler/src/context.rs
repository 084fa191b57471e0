use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::warn;

/// Process-wide state shared by every phase and every worker thread.
///
/// Holds the cooperative early-exit flag and the running transfer counters.
/// Inject one instance per process as `Arc<DistributionContext>`.
#[derive(Debug, Default)]
pub struct DistributionContext {
    early_exit: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl DistributionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every worker thread to stop at its next idle check.
    pub fn request_early_exit(&self) {
        if !self.early_exit.swap(true, Ordering::SeqCst) {
            warn!("early exit requested");
        }
    }

    pub fn early_exit_requested(&self) -> bool {
        self.early_exit.load(Ordering::SeqCst)
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Payload bytes sent since the process started (see `Message::wire_len`).
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Payload bytes received since the process started.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let ctx = DistributionContext::new();
        ctx.record_sent(10);
        ctx.record_sent(5);
        ctx.record_received(7);
        assert_eq!(ctx.bytes_sent(), 15);
        assert_eq!(ctx.bytes_received(), 7);
    }

    #[test]
    fn early_exit_is_sticky() {
        let ctx = DistributionContext::new();
        assert!(!ctx.early_exit_requested());
        ctx.request_early_exit();
        ctx.request_early_exit();
        assert!(ctx.early_exit_requested());
    }
}
