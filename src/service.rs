pub mod tier1;
pub mod tier2;

pub use tier1::{RuntimeConfig, Tier1Service};
pub use tier2::{LocalWorker, Tier2Service};
