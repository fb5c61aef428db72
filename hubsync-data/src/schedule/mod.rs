//! Per-table sync scheduling.
//!
//! A [`ScheduleConfig`] names how often each table runs and in which mode.
//! The [`Scheduler`] pairs those schedules with [`hubsync_core::TableSync`]
//! managers and drives them from a Tokio runtime until shut down.

mod config;
mod runner;

pub use config::{ScheduleConfig, ScheduleError, TableSchedule};
pub use runner::{Scheduler, TableActivity};
