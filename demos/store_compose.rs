//! Store engine walkthrough: accumulate two partial windows, then compose
//! them into a full snapshot.
//!
//! Run with: cargo run --example store_compose

use std::sync::Arc;

use tierstream::manifest::module::{ModuleInput, UpdatePolicy, ValueType};
use tierstream::store::partial::read_partial;
use tierstream::store::StoreConfig;
use tierstream::{BlockRange, FsObjectStore, Module, ObjectStore};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let module = Module {
        name: "total".to_string(),
        binary_index: 0,
        binary_entrypoint: "total".to_string(),
        initial_block: 0,
        kind: tierstream::manifest::ModuleKind::Store {
            update_policy: UpdatePolicy::Add,
            value_type: ValueType::Int64,
        },
        inputs: vec![ModuleInput::Source {
            kind: "demo.Block".to_string(),
        }],
    };

    let base: Arc<dyn ObjectStore> =
        Arc::new(FsObjectStore::new("./data/store_compose_demo")?);
    let config = StoreConfig::new(&module, "demo-hash", &base, false)?
        .expect("store module yields a config");

    // First window [0, 5): each block k adds k.
    let mut partial = config.new_partial(0);
    for block in 0u64..5 {
        partial
            .base_mut()
            .add(0, b"total", block.to_string().as_bytes())?;
        partial.end_block(block);
    }
    partial.save(5)?;

    // Second window [5, 10).
    let mut partial = config.new_partial(5);
    for block in 5u64..10 {
        partial
            .base_mut()
            .add(0, b"total", block.to_string().as_bytes())?;
        partial.end_block(block);
    }
    partial.save(10)?;

    // Compose both windows into the authoritative state at block 10.
    let mut full = config.new_full();
    for range in [BlockRange::new(0, 5), BlockRange::new(5, 10)] {
        let payload = read_partial(config.state_store(), "total", &range)?;
        println!("merging partial {range}");
        full.merge(&payload)?;
    }
    full.save(10)?;

    let total = full
        .base()
        .get_last(b"total")
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();
    println!("total after block 10: {total}");
    println!("artifacts: {:?}", config.state_store().list()?);
    Ok(())
}
