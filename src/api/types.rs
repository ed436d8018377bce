use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::block::BlockRange;
use crate::error::{EngineError, EngineResult};
use crate::store::delta::Delta;

/// Block sequence number.
pub type BlockNum = u64;

/// Identity of one block of the input stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: String,
    pub num: BlockNum,
}

impl BlockRef {
    pub fn new(id: impl Into<String>, num: BlockNum) -> Self {
        Self { id: id.into(), num }
    }
}

/// Per-block clock attached to every emitted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    pub id: String,
    pub number: BlockNum,
}

/// Position of a cursor relative to the fork-aware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkStep {
    New,
    Undo,
    Irreversible,
}

impl ForkStep {
    fn tag(&self) -> &'static str {
        match self {
            ForkStep::New => "n",
            ForkStep::Undo => "u",
            ForkStep::Irreversible => "i",
        }
    }

    fn from_tag(tag: &str) -> Option<ForkStep> {
        match tag {
            "n" => Some(ForkStep::New),
            "u" => Some(ForkStep::Undo),
            "i" => Some(ForkStep::Irreversible),
            _ => None,
        }
    }
}

/// Opaque resume token: the last delivered block, the last irreversible
/// block, and the step the delivery was made under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub block: BlockRef,
    pub lib: BlockRef,
    pub step: ForkStep,
}

impl Cursor {
    pub fn to_opaque(&self) -> String {
        let plain = format!(
            "c1:{}:{}:{}:{}:{}",
            self.step.tag(),
            self.block.num,
            self.block.id,
            self.lib.num,
            self.lib.id,
        );
        URL_SAFE_NO_PAD.encode(plain.as_bytes())
    }

    pub fn from_opaque(token: &str) -> EngineResult<Cursor> {
        let invalid = |reason: &str| EngineError::InvalidCursor {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| invalid("not base64"))?;
        let plain = String::from_utf8(raw).map_err(|_| invalid("not utf-8"))?;

        let parts: Vec<&str> = plain.split(':').collect();
        if parts.len() != 6 || parts[0] != "c1" {
            return Err(invalid("unexpected layout"));
        }
        let step = ForkStep::from_tag(parts[1]).ok_or_else(|| invalid("unknown step"))?;
        let block_num = parts[2].parse().map_err(|_| invalid("bad block number"))?;
        let lib_num = parts[4].parse().map_err(|_| invalid("bad lib number"))?;

        Ok(Cursor {
            block: BlockRef::new(parts[3], block_num),
            lib: BlockRef::new(parts[5], lib_num),
            step,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputDebugInfo {
    pub logs: Vec<String>,
    pub logs_truncated: bool,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapModuleOutput {
    pub name: String,
    pub data: Vec<u8>,
    pub debug_info: OutputDebugInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreModuleOutput {
    pub name: String,
    pub debug_deltas: Vec<Delta>,
    pub debug_info: OutputDebugInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockScopedData {
    pub clock: Clock,
    pub output: Option<MapModuleOutput>,
    pub debug_map_outputs: Vec<MapModuleOutput>,
    pub debug_store_outputs: Vec<StoreModuleOutput>,
    pub cursor: String,
    pub final_block_height: BlockNum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub name: String,
    pub processed_ranges: Vec<BlockRange>,
}

/// One message of the tier-1 response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    BlockScopedData(BlockScopedData),
    ModulesProgress { modules: Vec<ModuleProgress> },
    /// Initial content of a store requested through
    /// `debug_initial_store_snapshot_for_modules` (development mode only).
    DebugStoreSnapshot {
        module_name: String,
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Terminal trailer: comma-separated `<start>-<end>` list of every
    /// partial range written by the request.
    PartialsWritten { trailer: String },
}

/// One message of the internal tier-2 response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubResponse {
    ProcessedRange {
        module_name: String,
        range: BlockRange,
    },
    Completed {
        all_processed_ranges: Vec<BlockRange>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_opaque_round_trip() {
        let cursor = Cursor {
            block: BlockRef::new("deadbeef", 1234),
            lib: BlockRef::new("cafe", 1200),
            step: ForkStep::New,
        };
        let token = cursor.to_opaque();
        assert_eq!(Cursor::from_opaque(&token).unwrap(), cursor);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!(matches!(
            Cursor::from_opaque("definitely not a cursor"),
            Err(EngineError::InvalidCursor { .. })
        ));
        let truncated = URL_SAFE_NO_PAD.encode(b"c1:n:12");
        assert!(Cursor::from_opaque(&truncated).is_err());
    }
}
