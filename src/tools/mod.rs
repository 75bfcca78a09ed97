//! Small helpers shared by the concurrency primitives.

pub mod system;
pub mod watch;
