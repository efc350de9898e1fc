//! Scheduler and worker pools
//!
//! Dispatches work units to provider-bounded pools, delivers results back
//! to each job's serialized completion handler, and resumes interrupted
//! jobs on startup.

mod core;
mod pool;

pub use core::{Job, JobFactory, JobRecord, Scheduler, SchedulerError, JOBS_COLLECTION};
pub use pool::{PoolConfig, WorkerPool};
