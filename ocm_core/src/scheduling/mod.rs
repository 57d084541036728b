//! Real-time task scheduling: timing primitives, RT thread attributes,
//! wake-up strategies, and the task runtime itself.

pub mod rt;
pub mod sleep;
pub mod task;
pub mod timer;

pub use sleep::{ExternalTimerSleep, InternalTimerSleep, SleepStrategy, TriggerSleep};
pub use task::{NodeTask, TaskRunner, TaskState};
pub use timer::{monotonic_now_ms, PeriodicLoop, Stopwatch};
