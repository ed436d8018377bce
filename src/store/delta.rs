//! Store deltas: the unit of state change, ordered within a block and
//! reversible without loss.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// First byte reserved for internal keys; user writes must never produce it.
pub const RESERVED_KEY_PREFIX: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One state change. Carries both the old and the new value so a sequence
/// of deltas can be undone exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub operation: Operation,
    /// Orders deltas within a single block.
    pub ordinal: u64,
    pub key: Vec<u8>,
    pub old_value: Vec<u8>,
    pub new_value: Vec<u8>,
}

/// The delta log of one block, kept in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeltas {
    pub block_num: u64,
    pub deltas: Vec<Delta>,
    /// Prefix deletions issued during the block, at their ordinal position.
    /// Replayed against states the producing window never saw.
    pub deleted_prefixes: Vec<(u64, Vec<u8>)>,
}

pub fn validate_key(module: &str, key: &[u8]) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::InvalidStoreKey {
            module: module.to_string(),
            reason: "key must be at least 1 byte".to_string(),
        });
    }
    if key[0] == RESERVED_KEY_PREFIX {
        return Err(EngineError::InvalidStoreKey {
            module: module.to_string(),
            reason: "key must not start with the reserved byte 0xFF".to_string(),
        });
    }
    Ok(())
}
