pub mod delayed;
pub mod traits;

pub use delayed::DelayedConsumer;
pub use traits::{Consumer, Producer};
