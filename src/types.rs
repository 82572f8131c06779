use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type PartitionId = u32;
pub type Offset = u64;
pub type GroupId = String;
pub type MessageId = Uuid;

/// A message pulled from one partition of a backing queue. Read-only to the
/// consumption engine; produced by the backing queue client.
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub id: MessageId,
    pub payload: Bytes,
    pub partition: PartitionId,
    /// Epoch millis assigned by the producer path.
    pub produced_timestamp: i64,
    pub offset: Offset,
    pub group_id: Option<GroupId>,
}

impl PolledMessage {
    pub fn new(
        payload: Bytes,
        partition: PartitionId,
        produced_timestamp: i64,
        offset: Offset,
        group_id: Option<GroupId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            partition,
            produced_timestamp,
            offset,
            group_id,
        }
    }
}

/// Outcome of one delivery attempt, reported back through
/// `MessageTracker::on_consumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionStatus {
    /// Delivered to the destination; offset is committed.
    Sent,
    /// Excluded by a subscription filter; offset is committed.
    Filtered,
    /// Delivery failed; the caller decides on retry/DLQ redirection,
    /// the offset is not committed here.
    Failed,
}

impl ConsumptionStatus {
    pub fn is_committable(&self) -> bool {
        matches!(self, ConsumptionStatus::Sent | ConsumptionStatus::Filtered)
    }
}

/// One of the backing logs feeding a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternalQueueType {
    Main,
    Retry(u8),
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueCategory {
    Main,
    Retry,
    DeadLetter,
}

impl InternalQueueType {
    pub fn category(&self) -> QueueCategory {
        match self {
            InternalQueueType::Main => QueueCategory::Main,
            InternalQueueType::Retry(_) => QueueCategory::Retry,
            InternalQueueType::DeadLetter => QueueCategory::DeadLetter,
        }
    }

    /// Position in the selector's fixed holder order: main, retry levels
    /// ascending, dead-letter last.
    pub fn ordinal(&self) -> u32 {
        match self {
            InternalQueueType::Main => 0,
            InternalQueueType::Retry(level) => 1 + *level as u32,
            InternalQueueType::DeadLetter => u32::MAX,
        }
    }
}

impl fmt::Display for InternalQueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalQueueType::Main => write!(f, "main"),
            InternalQueueType::Retry(level) => write!(f, "retry-{}", level),
            InternalQueueType::DeadLetter => write!(f, "dead-letter"),
        }
    }
}
