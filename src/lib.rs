//! # Tierstream
//!
//! A tiered, parallelizable streaming-data processing engine. Operators
//! describe a DAG of sandboxed modules (pure mappers and stateful
//! key-value stores); the engine replays a linear stream of per-block
//! events through the DAG, checkpoints store state at save-interval
//! boundaries, and streams per-block results to clients.
//!
//! Cold history is backfilled in parallel: the orchestrator plans the
//! missing ranges from persisted snapshots, dispatches them as bounded
//! subrequests to tier-2 workers, composes the resulting partial stores
//! into full ones at the handoff block, then tails the live tip linearly —
//! unwinding store state when the source reorganizes.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tierstream::{FileReplaySource, FsObjectStore, Request, Response, RuntimeConfig, Tier1Service};
//!
//! let service = Tier1Service::new(
//!     RuntimeConfig::default(),
//!     Arc::new(FsObjectStore::new("./data")?),
//!     Arc::new(FileReplaySource::new("./blocks.jsonl")),
//! )?;
//! service.blocks(&request, Some(latest_final_block), |response| {
//!     if let Response::BlockScopedData(data) = response {
//!         println!("block {}", data.clock.number);
//!     }
//!     Ok(())
//! })?;
//! # Ok::<(), tierstream::error::EngineError>(())
//! ```

pub mod api;
pub mod block;
pub mod execout;
pub mod executor;
pub mod manifest;
pub mod orchestrator;
pub mod pipeline;
pub mod service;
pub mod source;
pub mod storage;
pub mod store;
pub mod wasm;

pub use crate::api::error;

pub use api::error::{EngineError, EngineResult};
pub use api::request::{Request, RequestDetails, SubRequest};
pub use api::types::{
    BlockRef, BlockScopedData, Clock, Cursor, ForkStep, MapModuleOutput, ModuleProgress, Response,
    StoreModuleOutput, SubResponse,
};
pub use block::BlockRange;
pub use executor::{ModuleExecutor, ModuleOutput, OutputData};
pub use manifest::{Module, ModuleGraph, ModuleHashes, ModuleSet};
pub use orchestrator::{Plan, Scheduler, Worker};
pub use pipeline::Pipeline;
pub use service::{RuntimeConfig, Tier1Service, Tier2Service};
pub use source::{BlockEvent, BlockSource, FileReplaySource, SourceBlock};
pub use storage::{FsObjectStore, ModuleStorageState, ObjectStore, StorageState};
pub use store::{StoreConfig, StoreMap, StoreUnit};
