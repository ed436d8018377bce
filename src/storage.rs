pub mod filename;
pub mod objstore;
pub mod state;

pub use objstore::{FsObjectStore, ObjectStore};
pub use state::{ModuleStorageState, StorageState};
