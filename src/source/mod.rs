pub mod grouped;
pub mod selector;
pub mod tracker;
pub mod ungrouped;

pub use grouped::GroupedMessageSource;
pub use selector::{MessageSourceSelector, SelectedTrackers};
pub use tracker::{MessageBatch, MessageSource, MessageTracker};
pub use ungrouped::UngroupedMessageSource;
