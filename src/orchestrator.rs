//! Parallel backfill: plan what is missing, schedule it over a worker
//! pool, compose the resulting partials into full stores at the handoff.

pub mod job;
pub mod plan;
pub mod scheduler;
pub mod worker;

pub use job::Job;
pub use plan::Plan;
pub use scheduler::{compose_store, compose_stores, Scheduler, SchedulerConfig};
pub use worker::Worker;
