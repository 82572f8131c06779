use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Offset, PolledMessage};

/// Pull client over one backing partitioned log (main, a retry level, or
/// dead-letter). Implementations are supplied by the shard-hosting process.
///
/// `receive` resolves with the currently available batch, which may be
/// empty; implementations may wait internally up to their own poll timeout.
/// A closed consumer must fail pending and future calls promptly rather
/// than hang.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn receive(&self) -> Result<Vec<PolledMessage>>;

    /// Commit exactly this message's offset.
    async fn commit_individual(&self, message: &PolledMessage) -> Result<()>;

    /// Commit this message's offset and everything before it in the partition.
    async fn commit_cumulative(&self, message: &PolledMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Push client to one backing log, used by the processing loop to redirect
/// failed deliveries to a retry level or the dead-letter queue.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, message: PolledMessage) -> Result<Offset>;

    async fn close(&self) -> Result<()>;
}
