pub mod sliding_window;

pub use sliding_window::{ListenerId, SlidingWindowThreshold, ThresholdChangeListener};
