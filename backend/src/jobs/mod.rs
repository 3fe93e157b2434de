// Background Jobs Service
//
// Runs the scheduled workflow pass on a cron expression using tokio-cron-scheduler.

pub mod scheduler;

pub use scheduler::{JobConfig, JobError, JobResult, JobScheduler, WORKFLOW_TICK_JOB};
