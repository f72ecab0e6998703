//! Cron scheduling of enabled jobs.

pub mod cron;
pub mod engine;

pub use self::cron::{parse_schedule, DueJob, ScheduleInfo, Scheduler};
pub use self::engine::run_scheduler_loop;
