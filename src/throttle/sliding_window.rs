use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ErrorThresholdConfig;
use crate::error::Result;
use crate::metrics::ConsumptionMetrics;

/// Notified synchronously on the mover task whenever the computed threshold
/// changes.
pub trait ThresholdChangeListener: Send + Sync {
    fn on_threshold_change(&self, new_threshold: f64);
}

pub type ListenerId = u64;

/// Converts a stream of [`mark`](SlidingWindowThreshold::mark) events (one
/// per delivery error) into a trailing-window error count threshold used to
/// drive adaptive throttling.
///
/// Tick counters span two window widths so the current half and the half
/// about to roll off coexist without a compaction pass. `mark` is a single
/// atomic increment and may race from any thread; the running total is
/// maintained solely by the periodic mover, keeping `threshold()` an O(1)
/// atomic read. The window covers the `ticks_in_window` ticks strictly
/// before the in-progress one.
pub struct SlidingWindowThreshold {
    inner: Arc<WindowInner>,
    mover: Mutex<Option<JoinHandle<()>>>,
}

struct WindowInner {
    ticks: Vec<AtomicU64>,
    tick_rate_ms: u64,
    ticks_in_window: u64,
    pct_error_threshold: f32,
    clock: Arc<dyn Clock>,
    /// Sum of ticks inside the window. Mover-only writes.
    total: AtomicU64,
    /// Tick the mover last advanced to. Mover-only writes.
    last_tick: AtomicU64,
    threshold_bits: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ThresholdChangeListener>)>>,
    next_listener_id: AtomicU64,
    metrics: Arc<ConsumptionMetrics>,
}

impl SlidingWindowThreshold {
    pub fn new(
        config: &ErrorThresholdConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<ConsumptionMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let ticks_in_window = config.window_size_ms / config.tick_rate_ms;
        let slots = (2 * ticks_in_window) as usize;

        let inner = Arc::new(WindowInner {
            ticks: (0..slots).map(|_| AtomicU64::new(0)).collect(),
            tick_rate_ms: config.tick_rate_ms,
            ticks_in_window,
            pct_error_threshold: config.pct_error_threshold,
            last_tick: AtomicU64::new(0),
            total: AtomicU64::new(0),
            threshold_bits: AtomicU64::new(0f64.to_bits()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            clock,
            metrics,
        });
        inner.last_tick.store(inner.current_tick(), Ordering::SeqCst);

        // Twice the tick rate so a tick boundary is never skipped.
        let period = Duration::from_millis((config.tick_rate_ms / 2).max(1));
        let mover_inner = inner.clone();
        let mover = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                mover_inner.move_window();
            }
        });
        info!(
            "sliding error-rate window: {} ticks of {}ms, {}% threshold",
            ticks_in_window, config.tick_rate_ms, config.pct_error_threshold
        );

        Ok(Self {
            inner,
            mover: Mutex::new(Some(mover)),
        })
    }

    /// Records one error event in the current tick. Lock-free; callable
    /// from any thread.
    pub fn mark(&self) {
        let slot = (self.inner.current_tick() % self.inner.ticks.len() as u64) as usize;
        self.inner.ticks[slot].fetch_add(1, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.inner.threshold_bits.load(Ordering::SeqCst))
    }

    /// Slides the window up to the current tick. Driven by the periodic
    /// mover task; exposed so tests can drive time deterministically.
    pub fn move_window(&self) {
        self.inner.move_window();
    }

    pub fn register_listener(&self, listener: Arc<dyn ThresholdChangeListener>) -> ListenerId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Cancels the periodic mover task. Idempotent.
    pub fn close(&self) {
        if let Some(handle) = self.mover.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SlidingWindowThreshold {
    fn drop(&mut self) {
        self.close();
    }
}

impl WindowInner {
    fn current_tick(&self) -> u64 {
        (self.clock.now_millis().max(0) as u64) / self.tick_rate_ms
    }

    fn move_window(&self) {
        let current = self.current_tick();
        let last = self.last_tick.load(Ordering::SeqCst);
        if current == last {
            return;
        }

        let slots = self.ticks.len() as u64;
        let mut total = self.total.load(Ordering::SeqCst);
        if current - last >= self.ticks_in_window {
            // The mover lagged a full window; counts can no longer be
            // attributed to ticks, so restart empty.
            for slot in &self.ticks {
                slot.store(0, Ordering::SeqCst);
            }
            total = 0;
        } else {
            for tick in last..current {
                // Tick `tick` has completed and enters the window; the tick
                // one window behind it rolls out.
                total += self.ticks[(tick % slots) as usize].load(Ordering::SeqCst);
                if tick >= self.ticks_in_window {
                    let out = (tick - self.ticks_in_window) % slots;
                    total -= self.ticks[out as usize].swap(0, Ordering::SeqCst);
                }
            }
        }
        self.total.store(total, Ordering::SeqCst);
        self.last_tick.store(current, Ordering::SeqCst);

        let new_threshold = total as f64 * self.pct_error_threshold as f64 / 100.0;
        let old_bits = self
            .threshold_bits
            .swap(new_threshold.to_bits(), Ordering::SeqCst);
        if old_bits != new_threshold.to_bits() {
            debug!("error-rate threshold moved to {}", new_threshold);
            self.metrics.error_threshold.set(new_threshold);
            let listeners = self.listeners.lock().clone();
            for (_, listener) in listeners {
                listener.on_threshold_change(new_threshold);
            }
        }
    }
}
