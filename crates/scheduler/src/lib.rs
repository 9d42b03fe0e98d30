//! Recurring segment exports: triggers, schedule persistence and the
//! dispatch loop.

pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use schedule::{ExportSchedule, RunStatus, ScheduleRequest};
pub use scheduler::{DispatchHandle, Scheduler, SchedulerHandle};
pub use store::{InMemoryScheduleStore, JsonScheduleStore, ScheduleStore};
pub use trigger::Trigger;
