//! # Keepalive ticker (C4)
//!
//! A re-armable, single-shot timer. [`KeepaliveTicker::reschedule`] arranges
//! for exactly one future tick on [`KeepaliveTicker::ticks`]; calling it
//! again before the first tick fires replaces the pending deadline rather
//! than stacking a second one. [`KeepaliveTicker::stop`] is idempotent and,
//! once called, turns `reschedule` into a no-op.
//!
//! The tick channel is never closed: closing it would be indistinguishable
//! from a tick to a consumer selecting on it, so `stop` is communicated out
//! of band (the `stopped` flag here; callers of this crate route shutdown
//! through the owning stage's own close signal instead of relying on
//! `ticks` ending).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A rescheduleable single-shot timer yielding `Instant`s on `ticks`.
pub struct KeepaliveTicker {
    ticks_tx: mpsc::Sender<Instant>,
    pub ticks: mpsc::Receiver<Instant>,
    stopped: Arc<AtomicBool>,
    current: Option<JoinHandle<()>>,
    generation: Arc<std::sync::atomic::AtomicU64>,
}

impl KeepaliveTicker {
    pub fn new() -> Self {
        let (ticks_tx, ticks) = mpsc::channel(4);
        KeepaliveTicker {
            ticks_tx,
            ticks,
            stopped: Arc::new(AtomicBool::new(false)),
            current: None,
            generation: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Arrange for exactly one tick after `delay`. Safe to call
    /// concurrently with `stop()`; a no-op once stopped.
    pub fn reschedule(&mut self, delay: Duration) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.current.take() {
            handle.abort();
        }
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let stopped = self.stopped.clone();
        let tx = self.ticks_tx.clone();
        self.current = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            if generation.load(Ordering::SeqCst) != my_gen {
                // superseded by a later reschedule
                return;
            }
            let _ = tx.send(Instant::now()).await;
        }));
    }

    /// Idempotent. After this call, `reschedule` is a no-op and no further
    /// ticks are delivered.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.current.take() {
            handle.abort();
        }
    }
}

impl Default for KeepaliveTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeepaliveTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reschedule_delivers_exactly_one_tick() {
        let mut ticker = KeepaliveTicker::new();
        ticker.reschedule(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ticker.ticks.recv().await.is_some());

        // No second tick without another reschedule.
        let drained = tokio::time::timeout(Duration::from_millis(5), ticker.ticks.recv()).await;
        assert!(drained.is_err(), "expected no further ticks");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_reschedule_delivers_nothing() {
        let mut ticker = KeepaliveTicker::new();
        ticker.stop();
        ticker.reschedule(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let drained = tokio::time::timeout(Duration::from_millis(5), ticker.ticks.recv()).await;
        assert!(drained.is_err(), "stop() must suppress all future ticks");
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_before_a_tick_fires_replaces_the_deadline() {
        let mut ticker = KeepaliveTicker::new();
        ticker.reschedule(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(10)).await;
        ticker.reschedule(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ticker.ticks.recv().await.is_some());
        let drained = tokio::time::timeout(Duration::from_millis(200), ticker.ticks.recv()).await;
        assert!(drained.is_err(), "the superseded first deadline must not also tick");
    }
}
