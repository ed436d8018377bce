//! Block-source seam: ordered, labeled block events with fork
//! notifications. Transports live behind this trait; the crate ships a
//! replay-file implementation for local runs and tooling.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::api::types::{BlockNum, BlockRef, Cursor, ForkStep};
use crate::error::EngineResult;

/// One unit of the input event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBlock {
    pub id: String,
    pub parent_id: String,
    pub number: BlockNum,
    /// Last irreversible block at the time this block was delivered.
    pub final_block_height: BlockNum,
    pub payload: Vec<u8>,
}

impl SourceBlock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.id.clone(), self.number)
    }

    pub fn lib_ref(&self) -> BlockRef {
        BlockRef::new(self.id.clone(), self.final_block_height)
    }
}

#[derive(Debug, Clone)]
pub enum BlockEvent {
    New {
        block: SourceBlock,
        cursor: Cursor,
    },
    /// The source retracted `target` and everything above it was already
    /// retracted by earlier undo events. The stream resumes with the new
    /// canonical blocks.
    Undo {
        target: BlockRef,
        cursor: Cursor,
    },
}

pub trait BlockSource: Send + Sync {
    /// Streams events from `start_block` onward. The caller stops reading
    /// once its stop block is reached; sources may also simply run dry.
    fn stream(
        &self,
        start_block: BlockNum,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<BlockEvent>> + Send + '_>>;
}

/// Replays newline-delimited JSON [`SourceBlock`] records from a file, in
/// file order. Cursors are synthesized from each block's own LIB height.
pub struct FileReplaySource {
    path: PathBuf,
}

impl FileReplaySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl BlockSource for FileReplaySource {
    fn stream(
        &self,
        start_block: BlockNum,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<BlockEvent>> + Send + '_>> {
        let file = std::fs::File::open(&self.path)?;
        let reader = std::io::BufReader::new(file);

        let iter = reader.lines().filter_map(move |line| {
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            if line.trim().is_empty() {
                return None;
            }
            let block: SourceBlock = match serde_json::from_str(&line) {
                Ok(block) => block,
                Err(err) => {
                    return Some(Err(crate::error::EngineError::InvalidRequest {
                        reason: format!("malformed replay block: {err}"),
                    }))
                }
            };
            if block.number < start_block {
                return None;
            }
            let cursor = Cursor {
                block: block.block_ref(),
                lib: BlockRef::new(block.id.clone(), block.final_block_height),
                step: if block.number <= block.final_block_height {
                    ForkStep::Irreversible
                } else {
                    ForkStep::New
                },
            };
            Some(Ok(BlockEvent::New { block, cursor }))
        });

        Ok(Box::new(iter))
    }
}
