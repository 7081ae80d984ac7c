//! Cron scheduling for recurring backend prompts.
//!
//! The [`CronManager`] keeps durable job definitions, runs due jobs against the
//! reasoning backend and appends a [`CronRun`] per execution. The
//! [`rollup`] module layers the per-group daily rollup on top.

mod job;
pub mod rollup;
mod scheduler;
mod storage;

pub use job::{
    CronJobDefinition, CronJobId, CronJobPatch, CronRun, NewCronJob, RunStatus, next_occurrence,
    parse_schedule,
};
pub use rollup::{GroupRollup, RollupReport, RollupSync, sync_rollup_jobs};
pub use scheduler::{CronManager, JobCompletionHandler, SchedulerHandle};
pub use storage::{CronStorage, FileCronStorage, MemoryCronStorage, RunLog};
