//! Pipeline behavior: execution order, emission order, save-interval
//! checkpoints, reorg unwinding, and debug output modes.

mod common;

use std::sync::Arc;

use common::support::{
    block, block_id, execution_log, linear_details, map_input, map_module, module_set, new_event,
    payload_num, source_input, store_module, subrequest_details, tempdir, undo_event,
    MemoryBlockSource, NativeMapExecutor, NativeStoreExecutor,
};
use tierstream::execout::Caches;
use tierstream::manifest::module::{UpdatePolicy, ValueType};
use tierstream::pipeline::{Pipeline, PipelineConfig};
use tierstream::store::{StoreConfig, StoreMap, StoreUnit};
use tierstream::{
    FsObjectStore, ModuleExecutor, ModuleGraph, ObjectStore, Response, SourceBlock,
};

fn registry_config(base: &Arc<dyn ObjectStore>) -> (tierstream::Module, StoreConfig) {
    let module = store_module(
        "registry",
        0,
        UpdatePolicy::Set,
        ValueType::String,
        vec![source_input()],
    );
    let config = StoreConfig::new(&module, "testhash-registry", base, false)
        .unwrap()
        .expect("store module yields a config");
    (module, config)
}

/// Every edge u→v of the graph executes u before v at every block, and
/// block data is emitted in strict block order.
#[test]
fn topological_execution_and_emission_order() {
    let set = module_set(vec![
        map_module("extract", 0, vec![source_input()]),
        map_module("enrich", 0, vec![map_input("extract")]),
        map_module("report", 0, vec![map_input("enrich")]),
    ]);
    let graph = ModuleGraph::new(set.modules.clone()).unwrap();
    let log = execution_log();

    let executors: Vec<Box<dyn ModuleExecutor>> = vec![
        Box::new(
            NativeMapExecutor::new(
                "extract",
                Box::new(|buffer| Ok(payload_num(buffer).to_string().into_bytes())),
            )
            .with_log(log.clone()),
        ),
        Box::new(
            NativeMapExecutor::new(
                "enrich",
                Box::new(|buffer| {
                    let upstream = buffer.get("extract")?.to_vec();
                    Ok([b"enriched:", upstream.as_slice()].concat())
                }),
            )
            .with_log(log.clone()),
        ),
        Box::new(
            NativeMapExecutor::new(
                "report",
                Box::new(|buffer| Ok(buffer.get("enrich")?.to_vec())),
            )
            .with_log(log.clone()),
        ),
    ];

    let mut emitted_blocks = Vec::new();
    let mut outputs = Vec::new();
    {
        let mut pipeline = Pipeline::new(
            Arc::new(linear_details(&set, "report", 0, 5, true)),
            &graph,
            executors,
            StoreMap::new(),
            Caches::new(),
            PipelineConfig::default(),
            |response| {
                if let Response::BlockScopedData(data) = response {
                    emitted_blocks.push(data.clock.number);
                    outputs.push(data.output.expect("requested module output present").data);
                }
                Ok(())
            },
        )
        .unwrap();
        pipeline.run(&MemoryBlockSource::chain(0, 5)).unwrap();
    }

    assert_eq!(emitted_blocks, vec![0, 1, 2, 3, 4]);
    assert_eq!(outputs[3], b"enriched:3");

    let recorded = log.lock().unwrap();
    for num in 0..5 {
        let per_block: Vec<&str> = recorded
            .iter()
            .filter(|(block, _)| *block == num)
            .map(|(_, name)| name.as_str())
            .collect();
        assert_eq!(per_block, vec!["extract", "enrich", "report"]);
    }
}

/// Full snapshots appear exactly at multiples of the save interval.
#[test]
fn save_interval_flushes_on_boundaries_only() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (module, config) = registry_config(&base);
    let set = module_set(vec![module]);
    let graph = ModuleGraph::new(set.modules.clone()).unwrap();

    let mut stores = StoreMap::new();
    stores.set(StoreUnit::Full(config.new_full()));
    let handle = stores.get("registry").unwrap().clone();
    let executor: Box<dyn ModuleExecutor> = Box::new(NativeStoreExecutor::new(
        "registry",
        handle,
        Box::new(|buffer, base| {
            base.set(0, b"latest", payload_num(buffer).to_string().as_bytes())
        }),
    ));

    struct CountingHook(Arc<std::sync::Mutex<u64>>);
    impl tierstream::pipeline::BlockHook for CountingHook {
        fn on_block(&mut self, _clock: &tierstream::Clock) -> tierstream::EngineResult<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }
    let hook_count = Arc::new(std::sync::Mutex::new(0u64));

    let mut pipeline = Pipeline::new(
        Arc::new(linear_details(&set, "registry", 0, 12, true)),
        &graph,
        vec![executor],
        stores,
        Caches::new(),
        PipelineConfig {
            save_interval: 5,
            ..PipelineConfig::default()
        },
        |_| Ok(()),
    )
    .unwrap();
    pipeline.add_post_block_hook(Box::new(CountingHook(hook_count.clone())));
    pipeline.run(&MemoryBlockSource::chain(0, 14)).unwrap();

    assert_eq!(*hook_count.lock().unwrap(), 12);

    let files = config.state_store().list().unwrap();
    // Boundaries 5 and 10 produced snapshots; the unaligned stop at 12 did
    // not.
    assert_eq!(
        files,
        vec![
            "0000000005-0000000000.kv".to_string(),
            "0000000010-0000000000.kv".to_string(),
        ]
    );
}

/// Undo signals roll stores back so that re-delivered canonical blocks
/// produce exactly the state of a clean run.
#[test]
fn reorg_unwinds_to_canonical_chain() {
    let run = |events: Vec<tierstream::BlockEvent>| -> Vec<(Vec<u8>, Vec<u8>)> {
        let tmp = tempdir();
        let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
        let (module, config) = registry_config(&base);
        let set = module_set(vec![module]);
        let graph = ModuleGraph::new(set.modules.clone()).unwrap();

        let mut stores = StoreMap::new();
        stores.set(StoreUnit::Full(config.new_full()));
        let handle = stores.get("registry").unwrap().clone();
        let executor: Box<dyn ModuleExecutor> = Box::new(NativeStoreExecutor::new(
            "registry",
            handle.clone(),
            Box::new(|buffer, base| {
                let num = payload_num(buffer);
                base.set(0, format!("seen:{num}").as_bytes(), buffer.clock().id.as_bytes())?;
                base.set(1, b"tip", buffer.clock().id.as_bytes())
            }),
        ));

        let mut pipeline = Pipeline::new(
            Arc::new(linear_details(&set, "registry", 10, 0, true)),
            &graph,
            vec![executor],
            stores,
            Caches::new(),
            PipelineConfig::default(),
            |_| Ok(()),
        )
        .unwrap();
        pipeline.run(&MemoryBlockSource::new(events)).unwrap();
        let entries = handle.read().base().sorted_entries();
        entries
    };

    // Reversible blocks 10, 11, 12 (LIB 9), then a two-block reorg
    // replacing 11 and 12.
    let fork_11 = SourceBlock {
        id: "11bb".to_string(),
        parent_id: block_id(10),
        number: 11,
        final_block_height: 9,
        payload: 11u64.to_le_bytes().to_vec(),
    };
    let fork_12 = SourceBlock {
        id: "12bb".to_string(),
        parent_id: "11bb".to_string(),
        number: 12,
        final_block_height: 9,
        payload: 12u64.to_le_bytes().to_vec(),
    };

    let reorged = run(vec![
        new_event(block(10, 9)),
        new_event(block(11, 9)),
        new_event(block(12, 9)),
        undo_event(12, &block_id(12), 9),
        undo_event(11, &block_id(11), 9),
        new_event(fork_11.clone()),
        new_event(fork_12.clone()),
    ]);
    let clean = run(vec![
        new_event(block(10, 9)),
        new_event(fork_11),
        new_event(fork_12),
    ]);

    assert_eq!(reorged, clean);
}

/// Production mode emits only the requested output; development mode also
/// carries debug outputs for the other executed modules.
#[test]
fn production_mode_suppresses_debug_outputs() {
    let run = |production: bool| -> (usize, usize) {
        let tmp = tempdir();
        let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
        let store_mod = store_module(
            "totals",
            0,
            UpdatePolicy::Add,
            ValueType::Int64,
            vec![map_input("extract")],
        );
        let set = module_set(vec![
            map_module("extract", 0, vec![source_input()]),
            store_mod.clone(),
            map_module("report", 0, vec![map_input("extract")]),
        ]);
        let graph = ModuleGraph::new(set.modules.clone()).unwrap();
        let config = StoreConfig::new(&store_mod, "testhash-totals", &base, false)
            .unwrap()
            .unwrap();

        let mut stores = StoreMap::new();
        stores.set(StoreUnit::Full(config.new_full()));
        let handle = stores.get("totals").unwrap().clone();

        let executors: Vec<Box<dyn ModuleExecutor>> = vec![
            Box::new(NativeMapExecutor::new(
                "extract",
                Box::new(|buffer| Ok(payload_num(buffer).to_string().into_bytes())),
            )),
            Box::new(NativeStoreExecutor::new(
                "totals",
                handle,
                Box::new(|buffer, base| {
                    let value = buffer.get("extract")?.to_vec();
                    base.add(0, b"total", &value)
                }),
            )),
            Box::new(NativeMapExecutor::new(
                "report",
                Box::new(|buffer| Ok(buffer.get("extract")?.to_vec())),
            )),
        ];

        let mut debug_maps = 0;
        let mut debug_stores = 0;
        {
            let mut pipeline = Pipeline::new(
                Arc::new(linear_details(&set, "report", 0, 3, production)),
                &graph,
                executors,
                stores,
                Caches::new(),
                PipelineConfig::default(),
                |response| {
                    if let Response::BlockScopedData(data) = response {
                        assert_eq!(
                            data.output.as_ref().map(|o| o.name.as_str()),
                            Some("report")
                        );
                        debug_maps += data.debug_map_outputs.len();
                        debug_stores += data.debug_store_outputs.len();
                    }
                    Ok(())
                },
            )
            .unwrap();
            pipeline.run(&MemoryBlockSource::chain(0, 4)).unwrap();
        }
        (debug_maps, debug_stores)
    };

    assert_eq!(run(true), (0, 0));
    let (debug_maps, debug_stores) = run(false);
    assert_eq!(debug_maps, 3); // extract at blocks 0..3
    assert_eq!(debug_stores, 3); // totals at blocks 0..3
}

/// An empty range completes instantly with no partials and an empty
/// trailer.
#[test]
fn empty_subrequest_completes_without_partials() {
    let tmp = tempdir();
    let base: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(tmp.path()).unwrap());
    let (module, config) = registry_config(&base);
    let set = module_set(vec![module]);
    let graph = ModuleGraph::new(set.modules.clone()).unwrap();

    let mut stores = StoreMap::new();
    stores.set(StoreUnit::Partial(config.new_partial(5)));
    let handle = stores.get("registry").unwrap().clone();
    let executor: Box<dyn ModuleExecutor> = Box::new(NativeStoreExecutor::new(
        "registry",
        handle,
        Box::new(|_, base| base.set(0, b"k", b"v")),
    ));

    let mut trailer = None;
    let mut blocks_seen = 0usize;
    {
        let mut pipeline = Pipeline::new(
            Arc::new(subrequest_details(&set, "registry", 5, 5)),
            &graph,
            vec![executor],
            stores,
            Caches::new(),
            PipelineConfig::default(),
            |response| {
                match response {
                    Response::PartialsWritten { trailer: t } => trailer = Some(t),
                    Response::BlockScopedData(_) => blocks_seen += 1,
                    _ => {}
                }
                Ok(())
            },
        )
        .unwrap();
        pipeline.run(&MemoryBlockSource::chain(0, 20)).unwrap();
        assert!(pipeline.partials_written().is_empty());
    }

    assert_eq!(trailer.as_deref(), Some(""));
    assert_eq!(blocks_seen, 0);
    assert!(config.state_store().list().unwrap().is_empty());
}
