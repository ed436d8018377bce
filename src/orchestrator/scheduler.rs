//! Scheduler: the behavior side of backfill. Dispatches ready jobs onto a
//! bounded queue, drives a pool of workers, retries failures, and finally
//! composes the produced partials into full stores at the handoff block.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::block::BlockRange;
use crate::error::{EngineError, EngineResult};
use crate::orchestrator::job::Job;
use crate::orchestrator::plan::Plan;
use crate::orchestrator::worker::Worker;
use crate::storage::state::scan_module;
use crate::store::partial::read_partial;
use crate::store::{StoreConfig, StoreMap, StoreUnit};

/// Bounded multi-producer job queue feeding the worker pool.
struct JobQueue {
    inner: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    not_full: Condvar,
    stopped: AtomicBool,
    max_size: usize,
}

impl JobQueue {
    fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stopped: AtomicBool::new(false),
            max_size: max_size.max(1),
        }
    }

    fn push(&self, job: Job) -> EngineResult<()> {
        let mut queue = self.inner.lock();
        while queue.len() >= self.max_size && !self.stopped.load(Ordering::Acquire) {
            self.not_full.wait(&mut queue);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Canceled);
        }
        queue.push_back(job);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Job> {
        let mut queue = self.inner.lock();
        loop {
            if let Some(job) = queue.pop_front() {
                self.not_full.notify_one();
                return Some(job);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut queue);
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

struct JobReport {
    job: Job,
    result: EngineResult<Vec<BlockRange>>,
}

/// Contiguous-coverage tracker for one module: completed ranges advance the
/// frontier only once every gap before them is closed.
struct Coverage {
    covered_through: u64,
    done: BTreeMap<u64, u64>,
}

impl Coverage {
    fn new(covered_through: u64) -> Self {
        Self {
            covered_through,
            done: BTreeMap::new(),
        }
    }

    fn complete(&mut self, range: BlockRange) {
        self.done
            .insert(range.start_block, range.exclusive_end_block);
        while let Some(end) = self.done.remove(&self.covered_through) {
            self.covered_through = end;
        }
    }
}

pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub max_job_retries: usize,
    /// Base delay before a failed job is requeued, scaled linearly by the
    /// attempt count.
    pub retry_backoff: std::time::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            max_job_retries: 3,
            retry_backoff: std::time::Duration::from_millis(250),
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    cancel: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared cancellation signal: flipping it makes workers drain and
    /// `run` return [`EngineError::Canceled`].
    pub fn cancel_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Drives every planned job to completion. `on_job_done` fires on the
    /// scheduler thread after each successful job, with the partial ranges
    /// the worker produced.
    #[tracing::instrument(skip_all, fields(jobs = plan.jobs().len(), workers = workers.len()))]
    pub fn run(
        &self,
        mut plan: Plan,
        workers: Vec<Box<dyn Worker>>,
        mut on_job_done: impl FnMut(&Job, &[BlockRange]),
    ) -> EngineResult<()> {
        let mut pending = plan.take_jobs();
        let total_jobs = pending.len();
        if total_jobs == 0 {
            tracing::info!("no jobs to schedule, storage already covers the request");
            return Ok(());
        }

        let mut coverage: HashMap<String, Coverage> = plan
            .modules_state
            .iter()
            .map(|(name, state)| (name.clone(), Coverage::new(state.covered_through())))
            .collect();

        let queue = Arc::new(JobQueue::new(self.config.queue_capacity));
        let (report_tx, report_rx) = mpsc::channel::<JobReport>();

        let outcome = std::thread::scope(|scope| -> EngineResult<()> {
            for worker in workers {
                let queue = Arc::clone(&queue);
                let report_tx = report_tx.clone();
                let cancel = Arc::clone(&self.cancel);
                scope.spawn(move || {
                    while let Some(job) = queue.pop() {
                        if cancel.load(Ordering::Acquire) {
                            break;
                        }
                        let result = worker.work(&job);
                        if report_tx.send(JobReport { job, result }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(report_tx);

            let mut completed = 0usize;
            while completed < total_jobs {
                if self.cancel.load(Ordering::Acquire) {
                    queue.stop();
                    return Err(EngineError::Canceled);
                }

                // Scan unscheduled jobs in priority order and queue every
                // ready one. Plan-time sorting makes this scan the whole
                // prioritization.
                let mut still_pending = Vec::with_capacity(pending.len());
                for job in pending.drain(..) {
                    if job_ready(&job, &coverage) {
                        tracing::debug!(job = %job, "job dispatched");
                        queue.push(job)?;
                    } else {
                        still_pending.push(job);
                    }
                }
                pending = still_pending;

                let report = match report_rx.recv() {
                    Ok(report) => report,
                    Err(_) => {
                        queue.stop();
                        return Err(EngineError::Canceled);
                    }
                };

                match report.result {
                    Ok(ranges) => {
                        completed += 1;
                        let entry = coverage
                            .entry(report.job.module_name.clone())
                            .or_insert_with(|| Coverage::new(report.job.range.start_block));
                        entry.complete(report.job.range);
                        tracing::info!(
                            job = %report.job,
                            completed,
                            total_jobs,
                            "job completed"
                        );
                        on_job_done(&report.job, &ranges);
                    }
                    Err(err) if !err.is_retryable() => {
                        queue.stop();
                        self.cancel.store(true, Ordering::Release);
                        tracing::error!(job = %report.job, error = %err, "job failed fatally");
                        return Err(err);
                    }
                    Err(err) => {
                        let mut job = report.job;
                        job.attempts += 1;
                        if job.attempts > self.config.max_job_retries {
                            queue.stop();
                            self.cancel.store(true, Ordering::Release);
                            return Err(EngineError::JobExhausted {
                                module: job.module_name,
                                range: job.range,
                                attempts: job.attempts,
                                reason: err.to_string(),
                            });
                        }
                        tracing::warn!(
                            job = %job,
                            attempts = job.attempts,
                            error = %err,
                            "job failed, requeueing"
                        );
                        std::thread::sleep(self.config.retry_backoff * job.attempts as u32);
                        pending.push(job);
                        pending.sort_by_key(|j| j.priority);
                    }
                }
            }

            queue.stop();
            Ok(())
        });

        outcome
    }
}

fn job_ready(job: &Job, coverage: &HashMap<String, Coverage>) -> bool {
    job.dependencies.iter().all(|dep| {
        coverage
            .get(dep)
            .map(|c| c.covered_through >= job.range.start_block)
            .unwrap_or(false)
    })
}

/// Composes one module's full snapshot plus contiguous partials into a
/// full store covering `[initial, target)`. The merged snapshot is
/// persisted when `target` lands on an aligned boundary, so later requests
/// (and dependent subrequests) load it directly instead of re-merging.
pub fn compose_store(
    config: &StoreConfig,
    save_interval: u64,
    target: u64,
) -> EngineResult<crate::store::full::FullStore> {
    let state = scan_module(config, save_interval, target)?;
    let mut full = config.new_full();

    if let Some(range) = state.initial_complete_range {
        if range.exclusive_end_block > config.initial_block() {
            full.load(range.exclusive_end_block)?;
        }
    }
    for range in &state.partials_present {
        if range.start_block != full.covered_through() {
            break;
        }
        let partial = read_partial(config.state_store(), config.name(), range)?;
        full.merge(&partial)?;
    }

    if full.covered_through() < target.max(config.initial_block()) {
        return Err(EngineError::MissingSnapshot {
            module: config.name().to_string(),
            block: target,
        });
    }

    let already_saved = state
        .initial_complete_range
        .map(|r| r.exclusive_end_block == target)
        .unwrap_or(false);
    if target > config.initial_block() && target % save_interval == 0 && !already_saved {
        full.save(target)?;
    }
    Ok(full)
}

/// Composes every module at the handoff block, in parallel, producing the
/// store map the linear pipeline starts from.
pub fn compose_stores(
    configs: &[StoreConfig],
    save_interval: u64,
    handoff: u64,
) -> EngineResult<StoreMap> {
    let units: Vec<StoreUnit> = configs
        .par_iter()
        .map(|config| compose_store(config, save_interval, handoff).map(StoreUnit::Full))
        .collect::<EngineResult<Vec<_>>>()?;

    let mut map = StoreMap::new();
    for unit in units {
        map.set(unit);
    }
    Ok(map)
}
