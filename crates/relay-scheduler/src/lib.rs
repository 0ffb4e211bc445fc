//! Dependency resolution and job scheduling for Relay CI.

pub mod dag;
pub mod scheduler;

pub use dag::ExecutionGraph;
pub use scheduler::{JobOutput, Scheduler, SchedulerConfig};
