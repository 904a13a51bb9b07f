//! Session state and transfer bookkeeping.

pub mod machine;
pub mod progress;

pub use machine::SessionState;
pub use progress::{BlockPacer, Progress, ProgressTracker};
