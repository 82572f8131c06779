use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, ShardMqError};
use crate::metrics::ConsumptionMetrics;
use crate::queue::Consumer;
use crate::types::{ConsumptionStatus, GroupId, PolledMessage};

/// Hook installed by the grouped source at hand-out time so a consumed
/// message releases its group for further consumption.
pub(crate) trait GroupRelease: Send + Sync {
    fn free_group(&self, group_id: &GroupId) -> Result<()>;
}

/// Bridges one polled message to its completion action. Created when a
/// message is pulled from a backing source and consumed exactly once by the
/// processing loop via [`on_consumed`](MessageTracker::on_consumed); move
/// semantics enforce the exactly-once contract.
pub struct MessageTracker {
    message: PolledMessage,
    committer: Arc<dyn Consumer>,
    metrics: Arc<ConsumptionMetrics>,
    group_release: Option<(Arc<dyn GroupRelease>, GroupId)>,
}

impl MessageTracker {
    pub(crate) fn new(
        message: PolledMessage,
        committer: Arc<dyn Consumer>,
        metrics: Arc<ConsumptionMetrics>,
    ) -> Self {
        Self {
            message,
            committer,
            metrics,
            group_release: None,
        }
    }

    pub(crate) fn with_group_release(
        mut self,
        release: Arc<dyn GroupRelease>,
        group_id: GroupId,
    ) -> Self {
        self.group_release = Some((release, group_id));
        self
    }

    pub fn message(&self) -> &PolledMessage {
        &self.message
    }

    /// Reports the delivery outcome. Commits the individual offset for
    /// committable statuses; failed messages are not committed here, their
    /// retry/DLQ redirection is the caller's responsibility. Always releases
    /// the group, even when the commit fails, so a commit error cannot wedge
    /// a group's ordering queue.
    pub async fn on_consumed(mut self, status: ConsumptionStatus) -> Result<()> {
        let commit_result = if status.is_committable() {
            match self.committer.commit_individual(&self.message).await {
                Ok(()) => {
                    self.metrics.messages_committed.inc();
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        "commit failed for message {} at offset {}: {}",
                        self.message.id, self.message.offset, e
                    );
                    Err(e)
                }
            }
        } else {
            self.metrics.delivery_errors.inc();
            Ok(())
        };

        if let Some((release, group_id)) = self.group_release.take() {
            release.free_group(&group_id)?;
        }

        commit_result
    }
}

/// Ordered, single-pass sequence of trackers taken from one fetch of one
/// group (or one fetch of an ungrouped source). Slots are nulled after
/// hand-out so delivered messages can be dropped without shrinking the
/// backing sequence.
pub struct MessageBatch {
    slots: Vec<Option<MessageTracker>>,
    cursor: usize,
}

impl MessageBatch {
    pub fn new(trackers: Vec<MessageTracker>) -> Result<Self> {
        if trackers.is_empty() {
            return Err(ShardMqError::EmptyBatch);
        }
        Ok(Self {
            slots: trackers.into_iter().map(Some).collect(),
            cursor: 0,
        })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn remaining(&self) -> usize {
        self.slots.len() - self.cursor
    }

    pub fn next_message(&mut self) -> Result<MessageTracker> {
        let slot = self
            .slots
            .get_mut(self.cursor)
            .ok_or(ShardMqError::BatchExhausted)?;
        self.cursor += 1;
        slot.take().ok_or_else(|| {
            ShardMqError::Invariant("message batch slot already consumed".to_string())
        })
    }
}

/// Pull port filled by the per-queue-type sources. One call places up to
/// `max` ready trackers into `buf` and returns the count placed.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    async fn next_messages(&self, max: usize, buf: &mut Vec<MessageTracker>) -> Result<usize>;
}

/// Per-group consumption state: at most one message of a group is
/// outstanding to the processing loop while `status` is `InFlight`.
pub(crate) struct GroupTracker {
    pub(crate) status: GroupStatus,
    pub(crate) batches: VecDeque<MessageBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupStatus {
    Free,
    InFlight,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    pub(crate) struct RecordingConsumer {
        pub committed: Mutex<Vec<u64>>,
    }

    impl RecordingConsumer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                committed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        async fn receive(&self) -> Result<Vec<PolledMessage>> {
            Ok(Vec::new())
        }

        async fn commit_individual(&self, message: &PolledMessage) -> Result<()> {
            self.committed.lock().push(message.offset);
            Ok(())
        }

        async fn commit_cumulative(&self, message: &PolledMessage) -> Result<()> {
            self.committed.lock().push(message.offset);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn tracker(offset: u64, committer: Arc<RecordingConsumer>) -> MessageTracker {
        let message = PolledMessage::new(Bytes::from_static(b"m"), 0, 0, offset, None);
        MessageTracker::new(message, committer, ConsumptionMetrics::new())
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(
            MessageBatch::new(Vec::new()),
            Err(ShardMqError::EmptyBatch)
        ));
    }

    #[test]
    fn test_batch_hands_out_in_order_and_exhausts() {
        let committer = RecordingConsumer::new();
        let trackers = (0..3).map(|i| tracker(i, committer.clone())).collect();
        let mut batch = MessageBatch::new(trackers).unwrap();

        assert_eq!(batch.count(), 3);
        for expected in 0..3u64 {
            assert_eq!(batch.remaining(), (3 - expected) as usize);
            let t = batch.next_message().unwrap();
            assert_eq!(t.message().offset, expected);
        }
        assert_eq!(batch.remaining(), 0);
        assert!(matches!(
            batch.next_message(),
            Err(ShardMqError::BatchExhausted)
        ));
    }

    #[tokio::test]
    async fn test_on_consumed_commits_only_committable_statuses() {
        let committer = RecordingConsumer::new();

        tracker(1, committer.clone())
            .on_consumed(ConsumptionStatus::Sent)
            .await
            .unwrap();
        tracker(2, committer.clone())
            .on_consumed(ConsumptionStatus::Filtered)
            .await
            .unwrap();
        tracker(3, committer.clone())
            .on_consumed(ConsumptionStatus::Failed)
            .await
            .unwrap();

        assert_eq!(*committer.committed.lock(), vec![1, 2]);
    }
}
