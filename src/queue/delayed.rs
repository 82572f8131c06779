use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::queue::traits::Consumer;
use crate::types::{PartitionId, PolledMessage};

/// Decorator over a backing [`Consumer`] that withholds messages until they
/// have aged past a configurable delay. Used to pace retry queues: a failed
/// message re-produced to a retry level becomes visible only after its
/// retry backoff has elapsed.
///
/// Offset commits are delegated unchanged; the decorator adds release
/// timing only.
pub struct DelayedConsumer<C: Consumer> {
    delegate: C,
    delay_ms: AtomicU64,
    clock: Arc<dyn Clock>,
    batch: Mutex<DelayBatch>,
}

/// Messages buffered from the delegate, grouped by partition in arrival
/// order. Release walks each partition's head forward, so a partially aged
/// batch yields only the eligible prefix per partition.
#[derive(Default)]
struct DelayBatch {
    partitions: HashMap<PartitionId, std::collections::VecDeque<PolledMessage>>,
    buffered: usize,
}

impl DelayBatch {
    fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    fn merge(&mut self, messages: Vec<PolledMessage>) {
        for message in messages {
            self.buffered += 1;
            self.partitions
                .entry(message.partition)
                .or_default()
                .push_back(message);
        }
    }

    /// Earliest produced timestamp among partition heads. The heads are the
    /// oldest per partition, so this is the next message to become eligible.
    fn earliest_timestamp(&self) -> Option<i64> {
        self.partitions
            .values()
            .filter_map(|q| q.front().map(|m| m.produced_timestamp))
            .min()
    }

    fn take_consumable(&mut self, now_millis: i64, delay_ms: u64) -> Vec<PolledMessage> {
        let mut ready = Vec::new();
        for queue in self.partitions.values_mut() {
            while queue
                .front()
                .map(|head| now_millis - head.produced_timestamp >= delay_ms as i64)
                .unwrap_or(false)
            {
                if let Some(message) = queue.pop_front() {
                    self.buffered -= 1;
                    ready.push(message);
                }
            }
        }
        self.partitions.retain(|_, q| !q.is_empty());
        ready
    }
}

impl<C: Consumer> DelayedConsumer<C> {
    pub fn new(delegate: C, delay_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            delegate,
            delay_ms: AtomicU64::new(delay_ms),
            clock,
            batch: Mutex::new(DelayBatch::default()),
        }
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::SeqCst)
    }

    /// Live-tunes the delay without restart. Takes effect on the next
    /// eligibility computation.
    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl<C: Consumer> Consumer for DelayedConsumer<C> {
    async fn receive(&self) -> Result<Vec<PolledMessage>> {
        let mut batch = self.batch.lock().await;

        if batch.is_empty() {
            let fetched = self.delegate.receive().await?;
            debug!("delayed consumer buffered {} messages", fetched.len());
            batch.merge(fetched);
        }

        loop {
            let delay_ms = self.delay_ms.load(Ordering::SeqCst);
            let now = self.clock.now_millis();
            let ready = batch.take_consumable(now, delay_ms);
            if !ready.is_empty() {
                return Ok(ready);
            }

            let earliest = match batch.earliest_timestamp() {
                Some(ts) => ts,
                // Delegate returned nothing; let the caller poll again.
                None => return Ok(Vec::new()),
            };
            let time_left = (earliest + delay_ms as i64 - now).max(1) as u64;
            debug!("delayed consumer waiting {}ms for eligibility", time_left);
            // Eligibility is re-derived after the timer fires rather than
            // assumed from exact firing time.
            tokio::time::sleep(Duration::from_millis(time_left)).await;
        }
    }

    async fn commit_individual(&self, message: &PolledMessage) -> Result<()> {
        self.delegate.commit_individual(message).await
    }

    async fn commit_cumulative(&self, message: &PolledMessage) -> Result<()> {
        self.delegate.commit_cumulative(message).await
    }

    async fn close(&self) -> Result<()> {
        self.delegate.close().await
    }
}
