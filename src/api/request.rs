//! Request resolution: effective start block, linear-handoff block and
//! relative stop blocks.

use serde::{Deserialize, Serialize};

use crate::api::types::{BlockNum, Cursor, ForkStep};
use crate::error::{EngineError, EngineResult};
use crate::manifest::ModuleSet;

/// Client-facing request, one per response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Negative values are reserved and rejected for now.
    pub start_block_num: i64,
    pub start_cursor: Option<String>,
    /// 0 means open-ended.
    pub stop_block_num: BlockNum,
    pub modules: ModuleSet,
    pub output_module: String,
    pub production_mode: bool,
    pub debug_initial_store_snapshot_for_modules: Vec<String>,
}

/// Internal request executed by a tier-2 worker over one bounded range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    pub start_block_num: BlockNum,
    pub stop_block_num: BlockNum,
    pub modules: ModuleSet,
    pub output_module: String,
}

/// Resolved, immutable view of a request shared by every component for the
/// lifetime of the stream.
#[derive(Debug, Clone)]
pub struct RequestDetails {
    pub modules: ModuleSet,
    pub output_module: String,
    pub production_mode: bool,
    pub is_subrequest: bool,
    pub stop_block_num: BlockNum,
    pub debug_initial_store_snapshot_for_modules: Vec<String>,
    pub resolved_start_block_num: BlockNum,
    /// Block at which parallel backfill ends and linear processing begins.
    pub linear_handoff_block_num: BlockNum,
}

impl RequestDetails {
    /// `latest_final_block` is the most recent finalized block of the
    /// source, when one could be determined.
    pub fn build(request: &Request, latest_final_block: Option<BlockNum>) -> EngineResult<Self> {
        let resolved_start_block_num = resolve_start_block(request)?;
        let linear_handoff_block_num = compute_linear_handoff(
            request.production_mode,
            resolved_start_block_num,
            request.stop_block_num,
            latest_final_block,
        )?;

        Ok(Self {
            modules: request.modules.clone(),
            output_module: request.output_module.clone(),
            production_mode: request.production_mode,
            is_subrequest: false,
            stop_block_num: request.stop_block_num,
            debug_initial_store_snapshot_for_modules: request
                .debug_initial_store_snapshot_for_modules
                .clone(),
            resolved_start_block_num,
            linear_handoff_block_num,
        })
    }

    /// Subrequests always run in production mode and hand off at their stop
    /// block: there is no live segment below a tier-2 worker.
    pub fn for_subrequest(request: &SubRequest) -> Self {
        Self {
            modules: request.modules.clone(),
            output_module: request.output_module.clone(),
            production_mode: true,
            is_subrequest: true,
            stop_block_num: request.stop_block_num,
            debug_initial_store_snapshot_for_modules: Vec::new(),
            resolved_start_block_num: request.start_block_num,
            linear_handoff_block_num: request.stop_block_num,
        }
    }

    pub fn is_output_module(&self, name: &str) -> bool {
        self.output_module == name
    }
}

fn resolve_start_block(request: &Request) -> EngineResult<BlockNum> {
    let Some(token) = request.start_cursor.as_deref().filter(|t| !t.is_empty()) else {
        if request.start_block_num < 0 {
            return Err(EngineError::InvalidRequest {
                reason: "start block num must be positive".to_string(),
            });
        }
        return Ok(request.start_block_num as BlockNum);
    };

    let cursor = Cursor::from_opaque(token)?;
    match cursor.step {
        // The cursor's block was the last one delivered to the client.
        ForkStep::New | ForkStep::Irreversible => Ok(cursor.block.num + 1),
        // The client must re-see the forked-out block's replacement.
        ForkStep::Undo => Ok(cursor.block.num),
    }
}

fn compute_linear_handoff(
    production_mode: bool,
    start_block: BlockNum,
    stop_block: BlockNum,
    latest_final_block: Option<BlockNum>,
) -> EngineResult<BlockNum> {
    if production_mode {
        return match latest_final_block {
            Some(max_handoff) if stop_block == 0 => Ok(max_handoff),
            Some(max_handoff) => Ok(stop_block.min(max_handoff)),
            None if stop_block == 0 => Err(EngineError::InvalidRequest {
                reason: "cannot determine a recent finalized block for an open-ended request"
                    .to_string(),
            }),
            None => Ok(stop_block),
        };
    }

    match latest_final_block {
        Some(max_handoff) => Ok(start_block.min(max_handoff)),
        None => Ok(start_block),
    }
}

/// Resolves a `--stop-block` flag value. A leading `+` makes the value
/// relative to the start block, which must then be absolute.
pub fn resolve_stop_block(start_block_num: i64, raw: &str) -> EngineResult<BlockNum> {
    if let Some(relative) = raw.strip_prefix('+') {
        if start_block_num < 0 {
            return Err(EngineError::InvalidRequest {
                reason: "relative stop block requires an absolute start block".to_string(),
            });
        }
        let offset: BlockNum = relative.parse().map_err(|_| EngineError::InvalidRequest {
            reason: format!("invalid relative stop block {raw:?}"),
        })?;
        return Ok(start_block_num as BlockNum + offset);
    }

    raw.parse().map_err(|_| EngineError::InvalidRequest {
        reason: format!("invalid stop block {raw:?}"),
    })
}
