use thiserror::Error;

use crate::block::BlockRange;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid start cursor {token:?}: {reason}")]
    InvalidCursor { token: String, reason: String },

    #[error("module {module:?} participates in a dependency cycle")]
    ManifestCycle { module: String },

    #[error("module {module:?} input references unknown module {input:?}")]
    ManifestDanglingInput { module: String, input: String },

    #[error(
        "module {module:?} starts at block {module_initial} but its input {input:?} starts later at {input_initial}"
    )]
    ManifestInitialBlock {
        module: String,
        input: String,
        module_initial: u64,
        input_initial: u64,
    },

    #[error("module {module:?} input {input:?} must reference a {expected} module")]
    ManifestKindMismatch {
        module: String,
        input: String,
        expected: &'static str,
    },

    #[error("unknown module {name:?}")]
    UnknownModule { name: String },

    #[error("invalid store key for module {module:?}: {reason}")]
    InvalidStoreKey { module: String, reason: String },

    #[error("store {module:?} became too big at {size} bytes, maximum size: {limit}")]
    StoreSizeExceeded { module: String, size: u64, limit: u64 },

    #[error("append on store {module:?} exceeds the {limit}-byte per-key limit ({size} bytes)")]
    AppendLimitExceeded {
        module: String,
        size: usize,
        limit: usize,
    },

    #[error("value coercion failed for store {module:?}: {source}")]
    ValueCoercion {
        module: String,
        #[source]
        source: ValueError,
    },

    #[error("module {module:?} execution failed: {reason}")]
    ModuleExecution {
        module: String,
        reason: String,
        logs: Vec<String>,
    },

    #[error("sandbox error: {reason}")]
    Sandbox { reason: String },

    #[error("storage state not reported for module {module:?}")]
    MissingStorageState { module: String },

    #[error("artifact {name:?} corrupted: {reason}")]
    ArtifactCorrupted { name: String, reason: &'static str },

    #[error("missing snapshot for module {module:?} at block {block}")]
    MissingSnapshot { module: String, block: u64 },

    #[error("cannot merge partial {range} into store {module:?} covered through {covered}")]
    StoreMergeMismatch {
        module: String,
        range: BlockRange,
        covered: u64,
    },

    #[error(
        "job for module {module:?} over range {range} failed after {attempts} attempts: {reason}"
    )]
    JobExhausted {
        module: String,
        range: BlockRange,
        attempts: usize,
        reason: String,
    },

    #[error("request canceled")]
    Canceled,
}

impl EngineError {
    /// Transient I/O and worker crashes are retried at the job level, up
    /// to the scheduler's bound. Deterministic failures (bad requests,
    /// manifest violations, module execution faults) never are.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::InvalidRequest { .. }
                | EngineError::InvalidCursor { .. }
                | EngineError::ManifestCycle { .. }
                | EngineError::ManifestDanglingInput { .. }
                | EngineError::ManifestInitialBlock { .. }
                | EngineError::ManifestKindMismatch { .. }
                | EngineError::UnknownModule { .. }
                | EngineError::InvalidStoreKey { .. }
                | EngineError::StoreSizeExceeded { .. }
                | EngineError::AppendLimitExceeded { .. }
                | EngineError::ValueCoercion { .. }
                | EngineError::ModuleExecution { .. }
        )
    }
}

/// Parse or arithmetic failure on a typed store value. Always a caller bug,
/// promoted to a fatal [`EngineError::ValueCoercion`] by the store layer.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot parse {got:?} as {value_type}")]
    Parse {
        value_type: &'static str,
        got: String,
    },

    #[error("operation {op} is not defined for value type {value_type}")]
    UnsupportedOperation {
        op: &'static str,
        value_type: &'static str,
    },
}
