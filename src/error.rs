use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShardMqError>;

#[derive(Error, Debug)]
pub enum ShardMqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal consistency violation: {0}")]
    Invariant(String),

    #[error("Message batch is empty")]
    EmptyBatch,

    #[error("Message batch exhausted")]
    BatchExhausted,

    #[error("Message {0} has no group id but source is grouped")]
    MissingGroupId(String),

    #[error("A next-messages request is already pending")]
    RequestPending,

    #[error("Consumer closed: {0}")]
    Closed(String),

    #[error("Commit failed at offset {0}: {1}")]
    CommitFailed(u64, String),
}
