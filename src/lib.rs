pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod source;
pub mod throttle;
pub mod types;

pub use config::ConsumptionConfig;
pub use error::{Result, ShardMqError};
