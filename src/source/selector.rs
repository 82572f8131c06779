use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SelectorConfig;
use crate::error::{Result, ShardMqError};
use crate::metrics::ConsumptionMetrics;
use crate::source::tracker::{MessageBatch, MessageSource, MessageTracker};
use crate::types::InternalQueueType;

/// Single pull point over one source per internal queue type (main, retry
/// levels, dead-letter). Each holder keeps exactly one fetch outstanding;
/// the selector serves whichever holder's fetch completed first, so
/// delivery across queue types follows completion order rather than a
/// fixed priority.
///
/// The caller drives `next_messages` in a loop with at most one request
/// outstanding, and must [`recycle`](SelectedTrackers::recycle) every
/// returned batch once consumed or that queue type stalls.
pub struct MessageSourceSelector {
    shared: Arc<SelectorShared>,
}

struct SelectorShared {
    holders: Vec<Holder>,
    pending: AtomicBool,
    notify: Notify,
    batch_size: usize,
    empty_refetch_delay: Duration,
    metrics: Arc<ConsumptionMetrics>,
}

struct Holder {
    queue_type: InternalQueueType,
    source: Arc<dyn MessageSource>,
    state: Mutex<HolderState>,
}

enum HolderState {
    /// Fetch task outstanding.
    Fetching,
    /// Completed fetch waiting to be claimed.
    Ready(Vec<MessageTracker>),
    /// Completed fetch failed; the error waits to be claimed.
    Failed(ShardMqError),
    /// Claimed; waits for `recycle` (or `rearm` after a failure).
    Parked,
}

impl MessageSourceSelector {
    /// Builds one holder per `(queue type, source)` pair and arms every
    /// holder's first fetch. Holders are scanned in queue-type order: main,
    /// retry levels ascending, dead-letter.
    pub fn new(
        mut sources: Vec<(InternalQueueType, Arc<dyn MessageSource>)>,
        config: &SelectorConfig,
        metrics: Arc<ConsumptionMetrics>,
    ) -> Self {
        sources.sort_by_key(|(queue_type, _)| queue_type.ordinal());
        let holders = sources
            .into_iter()
            .map(|(queue_type, source)| Holder {
                queue_type,
                source,
                state: Mutex::new(HolderState::Parked),
            })
            .collect::<Vec<_>>();
        info!("message source selector over {} queue types", holders.len());

        let shared = Arc::new(SelectorShared {
            holders,
            pending: AtomicBool::new(false),
            notify: Notify::new(),
            batch_size: config.batch_size,
            empty_refetch_delay: Duration::from_millis(config.empty_refetch_delay_ms),
            metrics,
        });
        for index in 0..shared.holders.len() {
            SelectorShared::arm(&shared, index);
        }
        Self { shared }
    }

    /// Waits for the first holder with a completed fetch and hands over its
    /// batch. Fails immediately with [`ShardMqError::RequestPending`] if a
    /// previous call has not returned yet, and with the holder's error if
    /// its fetch failed (recover with [`rearm`](Self::rearm)).
    pub async fn next_messages(&self) -> Result<SelectedTrackers> {
        if self
            .shared
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShardMqError::RequestPending);
        }
        let result = self.wait_for_ready().await;
        self.shared.pending.store(false, Ordering::SeqCst);
        result
    }

    async fn wait_for_ready(&self) -> Result<SelectedTrackers> {
        loop {
            for (index, holder) in self.shared.holders.iter().enumerate() {
                let taken = {
                    let mut state = holder.state.lock();
                    if matches!(*state, HolderState::Fetching | HolderState::Parked) {
                        continue;
                    }
                    std::mem::replace(&mut *state, HolderState::Parked)
                };
                match taken {
                    HolderState::Ready(trackers) => {
                        self.shared
                            .metrics
                            .messages_polled
                            .inc_by(trackers.len() as f64);
                        debug!(
                            "serving {} messages from {}",
                            trackers.len(),
                            holder.queue_type
                        );
                        return Ok(SelectedTrackers {
                            queue_type: holder.queue_type,
                            batch: MessageBatch::new(trackers)?,
                            shared: self.shared.clone(),
                            holder_index: index,
                        });
                    }
                    HolderState::Failed(error) => {
                        warn!("fetch from {} failed: {}", holder.queue_type, error);
                        return Err(error);
                    }
                    HolderState::Fetching | HolderState::Parked => unreachable!(),
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Restarts a holder parked by a failed fetch. Recovery is the caller's
    /// decision; the selector never retries on its own.
    pub fn rearm(&self, queue_type: InternalQueueType) -> Result<()> {
        let index = self
            .shared
            .holders
            .iter()
            .position(|holder| holder.queue_type == queue_type)
            .ok_or_else(|| {
                ShardMqError::InvalidConfig(format!("no source for queue type {}", queue_type))
            })?;
        {
            let state = self.shared.holders[index].state.lock();
            if !matches!(&*state, HolderState::Parked) {
                return Err(ShardMqError::Invariant(format!(
                    "holder {} is not parked",
                    queue_type
                )));
            }
        }
        SelectorShared::arm(&self.shared, index);
        Ok(())
    }
}

impl SelectorShared {
    /// Starts the holder's next fetch on a background task. An empty
    /// completion re-arms itself after a short pause instead of surfacing
    /// an empty batch: a grouped source returns zero whenever all of its
    /// known groups are in flight.
    fn arm(shared: &Arc<Self>, index: usize) {
        *shared.holders[index].state.lock() = HolderState::Fetching;
        let shared = shared.clone();
        tokio::spawn(async move {
            let holder = &shared.holders[index];
            loop {
                let mut buf = Vec::with_capacity(shared.batch_size);
                match holder.source.next_messages(shared.batch_size, &mut buf).await {
                    Ok(0) => {
                        tokio::time::sleep(shared.empty_refetch_delay).await;
                    }
                    Ok(count) => {
                        debug!("{} fetch completed with {} messages", holder.queue_type, count);
                        *holder.state.lock() = HolderState::Ready(buf);
                        shared.notify.notify_one();
                        return;
                    }
                    Err(error) => {
                        *holder.state.lock() = HolderState::Failed(error);
                        shared.notify.notify_one();
                        return;
                    }
                }
            }
        });
    }
}

/// Batch of trackers claimed from one queue type's holder. Single-pass,
/// like [`MessageBatch`]; consuming code must call [`recycle`](Self::recycle)
/// afterwards to re-arm the holder's fetch.
pub struct SelectedTrackers {
    queue_type: InternalQueueType,
    batch: MessageBatch,
    shared: Arc<SelectorShared>,
    holder_index: usize,
}

impl SelectedTrackers {
    pub fn queue_type(&self) -> InternalQueueType {
        self.queue_type
    }

    pub fn count(&self) -> usize {
        self.batch.count()
    }

    pub fn remaining(&self) -> usize {
        self.batch.remaining()
    }

    pub fn next_message(&mut self) -> Result<MessageTracker> {
        self.batch.next_message()
    }

    /// Re-arms the originating holder for its next fetch.
    pub fn recycle(self) {
        SelectorShared::arm(&self.shared, self.holder_index);
    }
}
