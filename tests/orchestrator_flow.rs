//! Scheduler behavior: dependency-aware dispatch, retries, exhaustion, and
//! the backfill-then-compose path matching a linear run.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::support::{
    map_input, map_module, module_set, payload_num, source_input, store_module,
    subrequest_details, tempdir, MemoryBlockSource, NativeStoreExecutor,
};
use tierstream::error::{EngineError, EngineResult};
use tierstream::execout::Caches;
use tierstream::manifest::module::{UpdatePolicy, ValueType};
use tierstream::orchestrator::{compose_store, Job, Plan, Scheduler, SchedulerConfig, Worker};
use tierstream::pipeline::{Pipeline, PipelineConfig};
use tierstream::store::{StoreConfig, StoreMap, StoreUnit};
use tierstream::{BlockRange, FsObjectStore, ModuleExecutor, ModuleGraph, ObjectStore};

type WorkLog = Arc<Mutex<Vec<(String, u64)>>>;

/// Writes an empty partial for the job's range and records the call.
struct MockWorker {
    configs: HashMap<String, StoreConfig>,
    log: WorkLog,
}

impl Worker for MockWorker {
    fn work(&self, job: &Job) -> EngineResult<Vec<BlockRange>> {
        self.log
            .lock()
            .unwrap()
            .push((job.module_name.clone(), job.range.start_block));
        let config = &self.configs[&job.module_name];
        let mut partial = config.new_partial(job.range.start_block);
        partial.save(job.range.exclusive_end_block)?;
        Ok(vec![job.range])
    }
}

/// Fails each listed job exactly once, then behaves like [`MockWorker`].
struct FlakyWorker {
    inner: MockWorker,
    fail_once: Mutex<Vec<(String, u64)>>,
}

impl Worker for FlakyWorker {
    fn work(&self, job: &Job) -> EngineResult<Vec<BlockRange>> {
        let mut pending = self.fail_once.lock().unwrap();
        let key = (job.module_name.clone(), job.range.start_block);
        if let Some(pos) = pending.iter().position(|k| *k == key) {
            pending.remove(pos);
            return Err(EngineError::Io(std::io::Error::other(
                "simulated worker failure",
            )));
        }
        drop(pending);
        self.inner.work(job)
    }
}

struct AlwaysFailingWorker;

impl Worker for AlwaysFailingWorker {
    fn work(&self, _job: &Job) -> EngineResult<Vec<BlockRange>> {
        Err(EngineError::Io(std::io::Error::other(
            "simulated worker timeout",
        )))
    }
}

fn two_tier_fixture(
    base: &Arc<dyn ObjectStore>,
) -> (ModuleGraph, Vec<StoreConfig>, HashMap<String, StoreConfig>) {
    let extract = map_module("extract", 0, vec![source_input()]);
    let totals = store_module(
        "totals",
        0,
        UpdatePolicy::Add,
        ValueType::Int64,
        vec![map_input("extract")],
    );
    let derived = store_module(
        "derived",
        0,
        UpdatePolicy::Set,
        ValueType::String,
        vec![common::support::store_input("totals")],
    );

    let totals_config = StoreConfig::new(&totals, "testhash-totals", base, false)
        .unwrap()
        .unwrap();
    let derived_config = StoreConfig::new(&derived, "testhash-derived", base, false)
        .unwrap()
        .unwrap();

    let graph = ModuleGraph::new(vec![extract, totals, derived]).unwrap();
    let configs = vec![totals_config.clone(), derived_config.clone()];
    let by_name = HashMap::from([
        ("totals".to_string(), totals_config),
        ("derived".to_string(), derived_config),
    ]);
    (graph, configs, by_name)
}

/// A dependent job dispatches only after its ancestor's coverage reaches
/// the job's start block.
#[test]
fn scheduler_honors_dependencies_and_priority() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (graph, configs, by_name) = two_tier_fixture(&base);

    let plan = Plan::build(&graph, &configs, 500, 500, 1000).unwrap();
    assert_eq!(plan.jobs().len(), 4);

    let log: WorkLog = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<Box<dyn Worker>> = vec![Box::new(MockWorker {
        configs: by_name,
        log: log.clone(),
    })];

    let scheduler = Scheduler::new(SchedulerConfig::default());
    let mut completions = Vec::new();
    scheduler
        .run(plan, workers, |job, _| {
            completions.push(job.module_name.clone())
        })
        .unwrap();

    let order = log.lock().unwrap().clone();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], ("totals".to_string(), 0));

    let position = |module: &str, start: u64| {
        order
            .iter()
            .position(|entry| entry.0 == module && entry.1 == start)
            .unwrap()
    };
    // derived@500 needs totals covered through 500.
    assert!(position("derived", 500) > position("totals", 0));
    assert_eq!(completions.len(), 4);
}

#[test]
fn scheduler_retries_transient_worker_failures() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (graph, configs, by_name) = two_tier_fixture(&base);
    let plan = Plan::build(&graph, &configs, 500, 500, 500).unwrap();
    assert_eq!(plan.jobs().len(), 2);

    let log: WorkLog = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<Box<dyn Worker>> = vec![Box::new(FlakyWorker {
        inner: MockWorker {
            configs: by_name,
            log: log.clone(),
        },
        fail_once: Mutex::new(vec![("totals".to_string(), 0)]),
    })];

    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.run(plan, workers, |_, _| {}).unwrap();

    // The failed attempt ran again and both jobs completed.
    let order = log.lock().unwrap().clone();
    assert_eq!(
        order.iter().filter(|(m, s)| m == "totals" && *s == 0).count(),
        1
    );
    assert_eq!(order.len(), 2);
}

#[test]
fn scheduler_promotes_exhausted_jobs_to_fatal() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (graph, configs, _) = two_tier_fixture(&base);
    let plan = Plan::build(&graph, &configs, 500, 500, 500).unwrap();

    let workers: Vec<Box<dyn Worker>> = vec![Box::new(AlwaysFailingWorker)];
    let scheduler = Scheduler::new(SchedulerConfig {
        max_job_retries: 2,
        ..SchedulerConfig::default()
    });

    let err = scheduler.run(plan, workers, |_, _| {}).unwrap_err();
    match err {
        EngineError::JobExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(scheduler.cancel_signal().load(Ordering::Acquire));
}

/// A deterministic module failure must surface on the first attempt.
#[test]
fn module_execution_failures_are_not_retried() {
    struct TrappingWorker {
        calls: Arc<Mutex<HashMap<(String, u64), usize>>>,
    }
    impl Worker for TrappingWorker {
        fn work(&self, job: &Job) -> EngineResult<Vec<BlockRange>> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry((job.module_name.clone(), job.range.start_block))
                .or_insert(0) += 1;
            Err(EngineError::ModuleExecution {
                module: job.module_name.clone(),
                reason: "wasm trap: unreachable".to_string(),
                logs: vec!["about to fail".to_string()],
            })
        }
    }

    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (graph, configs, _) = two_tier_fixture(&base);
    let plan = Plan::build(&graph, &configs, 500, 500, 500).unwrap();

    let calls = Arc::new(Mutex::new(HashMap::new()));
    let workers: Vec<Box<dyn Worker>> = vec![Box::new(TrappingWorker {
        calls: calls.clone(),
    })];
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let err = scheduler.run(plan, workers, |_, _| {}).unwrap_err();

    assert!(matches!(err, EngineError::ModuleExecution { .. }));
    // No job ran more than once.
    assert!(calls.lock().unwrap().values().all(|count| *count == 1));
}

/// Worker running a real windowed pipeline: scheduled backfill plus
/// composition equals one uninterrupted run.
struct PipelineWorker {
    config: StoreConfig,
    set: tierstream::ModuleSet,
    graph: Arc<ModuleGraph>,
}

impl Worker for PipelineWorker {
    fn work(&self, job: &Job) -> EngineResult<Vec<BlockRange>> {
        let mut stores = StoreMap::new();
        stores.set(StoreUnit::Partial(
            self.config.new_partial(job.range.start_block),
        ));
        let handle = stores.get("total").unwrap().clone();
        let executor: Box<dyn ModuleExecutor> = Box::new(NativeStoreExecutor::new(
            "total",
            handle,
            Box::new(|buffer, base| {
                let value = payload_num(buffer).to_string();
                base.add(0, b"total", value.as_bytes())
            }),
        ));
        let mut pipeline = Pipeline::new(
            Arc::new(subrequest_details(
                &self.set,
                "total",
                job.range.start_block,
                job.range.exclusive_end_block,
            )),
            &self.graph,
            vec![executor],
            stores,
            Caches::new(),
            PipelineConfig {
                save_interval: 5,
                ..PipelineConfig::default()
            },
            |_| Ok(()),
        )?;
        pipeline.run(&MemoryBlockSource::chain(
            job.range.start_block,
            job.range.exclusive_end_block,
        ))?;
        Ok(pipeline.partials_written().to_vec())
    }
}

#[test]
fn scheduled_backfill_composes_to_linear_result() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let total = store_module(
        "total",
        0,
        UpdatePolicy::Add,
        ValueType::Int64,
        vec![source_input()],
    );
    let set = module_set(vec![total.clone()]);
    let config = StoreConfig::new(&total, "testhash-total", &base, false)
        .unwrap()
        .unwrap();
    let graph = Arc::new(ModuleGraph::new(set.modules.clone()).unwrap());

    let plan = Plan::build(&graph, std::slice::from_ref(&config), 5, 10, 20).unwrap();
    assert_eq!(plan.jobs().len(), 2); // [0,10) and [10,20)

    let workers: Vec<Box<dyn Worker>> = (0..2)
        .map(|_| {
            Box::new(PipelineWorker {
                config: config.clone(),
                set: set.clone(),
                graph: Arc::clone(&graph),
            }) as Box<dyn Worker>
        })
        .collect();

    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.run(plan, workers, |_, _| {}).unwrap();

    let full = compose_store(&config, 5, 20).unwrap();
    // Sum of 0..20.
    assert_eq!(full.base().get_last(b"total"), Some(b"190".as_slice()));
    assert_eq!(full.covered_through(), 20);

    // The composed snapshot was persisted for future runs.
    let files = config.state_store().list().unwrap();
    assert!(files.contains(&"0000000020-0000000000.kv".to_string()));
}
