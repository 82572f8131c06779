use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::UngroupedSourceConfig;
use crate::error::Result;
use crate::metrics::ConsumptionMetrics;
use crate::queue::Consumer;
use crate::source::tracker::{MessageSource, MessageTracker};

/// Source with no ordering guarantee beyond backing-queue order. Fetched
/// messages that do not fit the caller's buffer are parked in a local
/// overflow queue and drained first on the next call.
///
/// With `max_overflow_messages = None` the overflow can grow without bound
/// when callers request small batches; that is a deliberate
/// rely-on-upstream-backpressure trade-off, made explicit through config.
/// With `Some(n)` the delegate fetch is skipped while the overflow holds at
/// least `n` messages, bounding memory at `n` plus one fetch batch.
pub struct UngroupedMessageSource<C: Consumer> {
    consumer: Arc<C>,
    overflow: Mutex<VecDeque<MessageTracker>>,
    max_overflow_messages: Option<usize>,
    metrics: Arc<ConsumptionMetrics>,
}

impl<C: Consumer + 'static> UngroupedMessageSource<C> {
    pub fn new(
        consumer: Arc<C>,
        config: &UngroupedSourceConfig,
        metrics: Arc<ConsumptionMetrics>,
    ) -> Self {
        Self {
            consumer,
            overflow: Mutex::new(VecDeque::new()),
            max_overflow_messages: config.max_overflow_messages,
            metrics,
        }
    }

    fn drain_overflow(&self, max: usize, buf: &mut Vec<MessageTracker>) -> usize {
        let mut overflow = self.overflow.lock();
        let mut filled = 0;
        while filled < max {
            match overflow.pop_front() {
                Some(tracker) => {
                    buf.push(tracker);
                    filled += 1;
                }
                None => break,
            }
        }
        filled
    }
}

#[async_trait]
impl<C: Consumer + 'static> MessageSource for UngroupedMessageSource<C> {
    async fn next_messages(&self, max: usize, buf: &mut Vec<MessageTracker>) -> Result<usize> {
        let mut filled = self.drain_overflow(max, buf);
        if filled >= max {
            return Ok(filled);
        }

        if let Some(bound) = self.max_overflow_messages {
            if self.overflow.lock().len() >= bound {
                debug!("overflow at bound {}, skipping fetch", bound);
                return Ok(filled);
            }
        }

        let committer: Arc<dyn Consumer> = self.consumer.clone();
        let fetched = self.consumer.receive().await?;
        let mut overflow = self.overflow.lock();
        for message in fetched {
            let tracker = MessageTracker::new(message, committer.clone(), self.metrics.clone());
            if filled < max {
                buf.push(tracker);
                filled += 1;
            } else {
                overflow.push_back(tracker);
            }
        }
        if !overflow.is_empty() {
            debug!("{} messages parked in overflow", overflow.len());
        }
        Ok(filled)
    }
}
