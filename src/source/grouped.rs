use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::GroupedSourceConfig;
use crate::error::{Result, ShardMqError};
use crate::metrics::ConsumptionMetrics;
use crate::queue::Consumer;
use crate::source::tracker::{
    GroupRelease, GroupStatus, GroupTracker, MessageBatch, MessageSource, MessageTracker,
};
use crate::types::GroupId;

/// Source that serves at most one message per distinct group id at a time,
/// so per-group delivery order is preserved end to end: message N+1 of a
/// group is never handed out before message N's consumption outcome has
/// been observed.
///
/// Group bookkeeping is keyed in a concurrent map and the free-group queue
/// sits behind a mutex with O(1) critical sections, because frees arrive on
/// arbitrary completion threads and must never block the fetch path.
pub struct GroupedMessageSource<C: Consumer> {
    consumer: Arc<C>,
    state: Arc<GroupedState>,
}

struct GroupedState {
    groups: DashMap<GroupId, GroupTracker>,
    free_groups: Mutex<VecDeque<GroupId>>,
    total_in_flight: AtomicUsize,
    max_in_flight_messages: usize,
    metrics: Arc<ConsumptionMetrics>,
}

impl<C: Consumer + 'static> GroupedMessageSource<C> {
    pub fn new(
        consumer: Arc<C>,
        config: &GroupedSourceConfig,
        metrics: Arc<ConsumptionMetrics>,
    ) -> Self {
        Self {
            consumer,
            state: Arc::new(GroupedState {
                groups: DashMap::new(),
                free_groups: Mutex::new(VecDeque::new()),
                total_in_flight: AtomicUsize::new(0),
                max_in_flight_messages: config.max_in_flight_messages,
                metrics,
            }),
        }
    }

    /// Messages fetched but not yet freed by the processing loop.
    pub fn total_in_flight(&self) -> usize {
        self.state.total_in_flight.load(Ordering::SeqCst)
    }

    /// Fetches one batch from the backing consumer and files every message
    /// under its group. Groups seen for the first time join the back of the
    /// free-group queue. Grouped mode requires a group id on every message.
    async fn replenish(&self) -> Result<()> {
        let fetched = self.consumer.receive().await?;
        if fetched.is_empty() {
            return Ok(());
        }
        debug!("replenishing {} messages into group trackers", fetched.len());

        let committer: Arc<dyn Consumer> = self.consumer.clone();
        // Group in first-appearance order so newly discovered groups enter
        // the free queue in fetch order.
        let mut order: Vec<GroupId> = Vec::new();
        let mut per_group: std::collections::HashMap<GroupId, Vec<MessageTracker>> =
            std::collections::HashMap::new();
        for message in fetched {
            let group_id = message
                .group_id
                .clone()
                .ok_or_else(|| ShardMqError::MissingGroupId(message.id.to_string()))?;
            if !per_group.contains_key(&group_id) {
                order.push(group_id.clone());
            }
            per_group.entry(group_id).or_default().push(MessageTracker::new(
                message,
                committer.clone(),
                self.state.metrics.clone(),
            ));
        }

        for group_id in order {
            let trackers = per_group.remove(&group_id).unwrap_or_default();
            let added = trackers.len();
            let batch = MessageBatch::new(trackers)?;
            match self.state.groups.entry(group_id.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(GroupTracker {
                        status: GroupStatus::Free,
                        batches: VecDeque::from([batch]),
                    });
                    self.state.free_groups.lock().push_back(group_id);
                }
                Entry::Occupied(mut occupied) => {
                    occupied.get_mut().batches.push_back(batch);
                }
            }
            self.state.total_in_flight.fetch_add(added, Ordering::SeqCst);
        }
        self.state
            .metrics
            .messages_in_flight
            .set(self.state.total_in_flight.load(Ordering::SeqCst) as f64);
        Ok(())
    }
}

impl GroupedState {
    /// Pops free groups into the output buffer, one message per group,
    /// marking each group in flight. A popped group whose tracker is
    /// missing or already in flight indicates a concurrency bug and is
    /// raised, never skipped.
    fn drain_free_groups(
        self: &Arc<Self>,
        max: usize,
        buf: &mut Vec<MessageTracker>,
    ) -> Result<usize> {
        let mut filled = 0;
        while filled < max {
            // The queue guard must drop before touching the group map; the
            // free path locks them in the opposite order.
            let popped = self.free_groups.lock().pop_front();
            let group_id = match popped {
                Some(group_id) => group_id,
                None => break,
            };

            let mut entry = self.groups.get_mut(&group_id).ok_or_else(|| {
                error!("free-group entry {} has no tracker", group_id);
                ShardMqError::Invariant(format!("free group {} has no tracker", group_id))
            })?;
            if entry.status != GroupStatus::Free {
                error!("free-group entry {} is already in flight", group_id);
                return Err(ShardMqError::Invariant(format!(
                    "free group {} is already in flight",
                    group_id
                )));
            }
            entry.status = GroupStatus::InFlight;
            let tracker = entry
                .batches
                .front_mut()
                .ok_or_else(|| {
                    ShardMqError::Invariant(format!("free group {} has no batches", group_id))
                })?
                .next_message()?;
            drop(entry);

            let release: Arc<dyn GroupRelease> = self.clone();
            buf.push(tracker.with_group_release(release, group_id));
            filled += 1;
        }
        Ok(filled)
    }
}

impl GroupRelease for GroupedState {
    /// Called from `MessageTracker::on_consumed` on arbitrary completion
    /// threads. Freed groups with pending work re-enter at the front of the
    /// free queue, giving recently active groups soft priority over newly
    /// discovered ones; fully drained groups are dropped.
    fn free_group(&self, group_id: &GroupId) -> Result<()> {
        match self.groups.entry(group_id.clone()) {
            Entry::Vacant(_) => {
                error!("freeing group {} with no tracker", group_id);
                Err(ShardMqError::Invariant(format!(
                    "freeing group {} with no tracker",
                    group_id
                )))
            }
            Entry::Occupied(mut occupied) => {
                let drained = {
                    let tracker = occupied.get_mut();
                    if tracker.status != GroupStatus::InFlight {
                        error!("freeing group {} that is not in flight", group_id);
                        return Err(ShardMqError::Invariant(format!(
                            "freeing group {} that is not in flight",
                            group_id
                        )));
                    }
                    if tracker
                        .batches
                        .front()
                        .map(|batch| batch.remaining() == 0)
                        .unwrap_or(false)
                    {
                        tracker.batches.pop_front();
                    }
                    tracker.batches.is_empty()
                };
                self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
                self.metrics
                    .messages_in_flight
                    .set(self.total_in_flight.load(Ordering::SeqCst) as f64);
                if drained {
                    occupied.remove();
                } else {
                    occupied.get_mut().status = GroupStatus::Free;
                    self.free_groups.lock().push_front(group_id.clone());
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<C: Consumer + 'static> MessageSource for GroupedMessageSource<C> {
    async fn next_messages(&self, max: usize, buf: &mut Vec<MessageTracker>) -> Result<usize> {
        // Watermark check: replenish only while total in-flight sits below
        // the configured maximum; one fetch batch may overshoot it.
        if self.state.total_in_flight.load(Ordering::SeqCst) < self.state.max_in_flight_messages {
            self.replenish().await?;
        }
        self.state.drain_free_groups(max, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConsumptionStatus, PolledMessage};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    struct ScriptedConsumer {
        batches: Mutex<VecDeque<Vec<PolledMessage>>>,
        fetches: Mutex<usize>,
        committed: Mutex<Vec<u64>>,
    }

    impl ScriptedConsumer {
        fn new(batches: Vec<Vec<PolledMessage>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                fetches: Mutex::new(0),
                committed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Consumer for ScriptedConsumer {
        async fn receive(&self) -> Result<Vec<PolledMessage>> {
            *self.fetches.lock() += 1;
            Ok(self.batches.lock().pop_front().unwrap_or_default())
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

    fn grouped_message(group: &str, offset: u64) -> PolledMessage {
        PolledMessage::new(
            Bytes::from_static(b"m"),
            0,
            0,
            offset,
            Some(group.to_string()),
        )
    }

    fn source_with(
        batches: Vec<Vec<PolledMessage>>,
        max_in_flight: usize,
    ) -> (GroupedMessageSource<ScriptedConsumer>, Arc<ScriptedConsumer>) {
        let consumer = ScriptedConsumer::new(batches);
        let config = GroupedSourceConfig {
            max_in_flight_messages: max_in_flight,
        };
        let source = GroupedMessageSource::new(consumer.clone(), &config, ConsumptionMetrics::new());
        (source, consumer)
    }

    #[tokio::test]
    async fn test_one_message_per_group_then_release_unlocks_next() {
        let fetch = vec![
            grouped_message("A", 1),
            grouped_message("A", 2),
            grouped_message("A", 3),
            grouped_message("B", 10),
        ];
        let (source, consumer) = source_with(vec![fetch], 2);

        let mut buf = Vec::new();
        assert_eq!(source.next_messages(2, &mut buf).await.unwrap(), 2);
        let offsets: Vec<u64> = buf.iter().map(|t| t.message().offset).collect();
        // Only the head of "A" is eligible alongside "B"'s single message.
        assert_eq!(offsets, vec![1, 10]);
        assert_eq!(source.total_in_flight(), 4);

        // Both groups busy: nothing eligible, and in-flight (4) sits at or
        // above the watermark (2) so no fetch is issued either.
        let mut buf2 = Vec::new();
        assert_eq!(source.next_messages(2, &mut buf2).await.unwrap(), 0);
        assert_eq!(*consumer.fetches.lock(), 1);

        // Freeing "A"'s head makes the next "A" message eligible.
        let a1 = buf.remove(0);
        a1.on_consumed(ConsumptionStatus::Sent).await.unwrap();
        let mut buf3 = Vec::new();
        assert_eq!(source.next_messages(2, &mut buf3).await.unwrap(), 1);
        assert_eq!(buf3[0].message().offset, 2);
        assert_eq!(source.total_in_flight(), 3);
        assert_eq!(*consumer.committed.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_in_flight_returns_to_zero_and_tracker_dropped() {
        let fetch = vec![grouped_message("A", 1), grouped_message("A", 2)];
        let (source, _consumer) = source_with(vec![fetch], 100);

        let mut buf = Vec::new();
        source.next_messages(8, &mut buf).await.unwrap();
        assert_eq!(buf.len(), 1);
        buf.remove(0)
            .on_consumed(ConsumptionStatus::Sent)
            .await
            .unwrap();

        let mut buf = Vec::new();
        source.next_messages(8, &mut buf).await.unwrap();
        assert_eq!(buf.len(), 1);
        assert_eq!(buf[0].message().offset, 2);
        buf.remove(0)
            .on_consumed(ConsumptionStatus::Filtered)
            .await
            .unwrap();

        assert_eq!(source.total_in_flight(), 0);
        assert!(source.state.groups.is_empty());
        assert!(source.state.free_groups.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_id_is_fatal() {
        let fetch = vec![PolledMessage::new(Bytes::from_static(b"m"), 0, 0, 1, None)];
        let (source, _consumer) = source_with(vec![fetch], 100);

        let mut buf = Vec::new();
        assert!(matches!(
            source.next_messages(4, &mut buf).await,
            Err(ShardMqError::MissingGroupId(_))
        ));
    }

    #[tokio::test]
    async fn test_freeing_non_in_flight_group_is_fatal() {
        let fetch = vec![grouped_message("A", 1)];
        let (source, _consumer) = source_with(vec![fetch], 100);

        let mut buf = Vec::new();
        source.next_messages(4, &mut buf).await.unwrap();

        assert!(matches!(
            source.state.free_group(&"unknown".to_string()),
            Err(ShardMqError::Invariant(_))
        ));
        // "A" is legitimately in flight; freeing it twice must fail on the
        // second call.
        source.state.free_group(&"A".to_string()).unwrap();
        assert!(matches!(
            source.state.free_group(&"A".to_string()),
            Err(ShardMqError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_freed_group_rejoins_queue_front() {
        let fetch = vec![
            grouped_message("A", 1),
            grouped_message("A", 2),
            grouped_message("B", 10),
            grouped_message("C", 20),
        ];
        let (source, _consumer) = source_with(vec![fetch], 100);

        let mut buf = Vec::new();
        // Claim only "A", leaving B and C free in the queue.
        assert_eq!(source.next_messages(1, &mut buf).await.unwrap(), 1);
        assert_eq!(buf[0].message().offset, 1);

        buf.remove(0)
            .on_consumed(ConsumptionStatus::Sent)
            .await
            .unwrap();
        // Front insertion on free: "A" is served again before B and C.
        assert_eq!(
            source.state.free_groups.lock().front(),
            Some(&"A".to_string())
        );
    }

    #[tokio::test]
    async fn test_watermark_gates_replenish_but_not_drain() {
        let (source, consumer) = source_with(
            vec![
                vec![grouped_message("A", 1), grouped_message("B", 2)],
                vec![grouped_message("C", 3)],
            ],
            1,
        );

        // First fetch overshoots the watermark of 1; both buffered messages
        // are still drained.
        let mut buf = Vec::new();
        assert_eq!(source.next_messages(4, &mut buf).await.unwrap(), 2);
        assert_eq!(*consumer.fetches.lock(), 1);

        // In-flight (2) >= watermark (1): no second fetch.
        let mut buf2 = Vec::new();
        assert_eq!(source.next_messages(4, &mut buf2).await.unwrap(), 0);
        assert_eq!(*consumer.fetches.lock(), 1);

        for tracker in buf {
            tracker.on_consumed(ConsumptionStatus::Sent).await.unwrap();
        }
        // Back below the watermark: fetching resumes.
        let mut buf3 = Vec::new();
        assert_eq!(source.next_messages(4, &mut buf3).await.unwrap(), 1);
        assert_eq!(buf3[0].message().offset, 3);
        assert_eq!(*consumer.fetches.lock(), 2);
    }
}
