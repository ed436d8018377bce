pub mod graph;
pub mod module;

pub use graph::ModuleGraph;
pub use module::{
    Binary, Module, ModuleHashes, ModuleInput, ModuleKind, ModuleSet, StoreMode, UpdatePolicy,
    ValueType,
};
