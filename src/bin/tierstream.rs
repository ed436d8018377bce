//! Thin CLI: runs a module from a JSON manifest against a replay source,
//! streaming block outputs to stdout.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use tierstream::api::request::resolve_stop_block;
use tierstream::error::{EngineError, EngineResult};
use tierstream::{
    FileReplaySource, FsObjectStore, ModuleSet, Request, Response, RuntimeConfig, Tier1Service,
};

const API_TOKEN_ENV: &str = "SUBSTREAMS_API_TOKEN";
const API_TOKEN_FALLBACK_ENV: &str = "SF_API_TOKEN";

#[derive(Parser)]
#[command(name = "tierstream", version, about = "Tiered streaming-data processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream the outputs of one module.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON module-set manifest.
    manifest: PathBuf,

    /// Module whose output is streamed.
    module_name: String,

    #[arg(short = 's', long = "start-block", default_value_t = 0, allow_hyphen_values = true)]
    start_block: i64,

    /// Stop block; `+N` is relative to the start block, 0 is open-ended.
    #[arg(short = 't', long = "stop-block", default_value = "0")]
    stop_block: String,

    /// Remote endpoint (requires an external transport; unused in local
    /// replay runs).
    #[arg(short = 'e', long = "substreams-endpoint")]
    endpoint: Option<String>,

    /// Skip TLS certificate verification against the endpoint.
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Connect to the endpoint without TLS.
    #[arg(short = 'p', long)]
    plaintext: bool,

    #[arg(long)]
    production_mode: bool,

    /// Resume cursor from a previous run.
    #[arg(long)]
    cursor: Option<String>,

    /// Newline-delimited JSON block file to replay.
    #[arg(long)]
    blocks_file: Option<PathBuf>,

    /// Root directory for snapshots and output caches.
    #[arg(long, default_value = "./tierstream-data")]
    state_dir: PathBuf,

    /// Emit these stores' initial content before streaming (development
    /// mode only).
    #[arg(long = "debug-modules-initial-snapshot", value_delimiter = ',')]
    debug_initial_snapshots: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(args: RunArgs) -> EngineResult<()> {
    let manifest = std::fs::read_to_string(&args.manifest)?;
    let modules: ModuleSet =
        serde_json::from_str(&manifest).map_err(|err| EngineError::InvalidRequest {
            reason: format!("malformed manifest: {err}"),
        })?;

    let stop_block_num = resolve_stop_block(args.start_block, &args.stop_block)?;

    if let Some(token) = api_token() {
        tracing::debug!(token_len = token.len(), "api token resolved from environment");
    }
    if args.insecure || args.plaintext {
        tracing::warn!("transport security flags are ignored in local replay mode");
    }
    if let (Some(endpoint), None) = (&args.endpoint, &args.blocks_file) {
        return Err(EngineError::InvalidRequest {
            reason: format!(
                "endpoint {endpoint:?} requires an external transport; \
                 pass --blocks-file to replay locally"
            ),
        });
    }
    let blocks_file = args.blocks_file.ok_or_else(|| EngineError::InvalidRequest {
        reason: "--blocks-file is required for local runs".to_string(),
    })?;

    let request = Request {
        start_block_num: args.start_block,
        start_cursor: args.cursor,
        stop_block_num,
        modules,
        output_module: args.module_name,
        production_mode: args.production_mode,
        debug_initial_store_snapshot_for_modules: args.debug_initial_snapshots,
    };

    let latest_final_block = scan_latest_final_block(&blocks_file)?;
    let service = Tier1Service::new(
        RuntimeConfig::default(),
        Arc::new(FsObjectStore::new(&args.state_dir)?),
        Arc::new(FileReplaySource::new(&blocks_file)),
    )?;

    service.blocks(&request, latest_final_block, |response| {
        match response {
            Response::BlockScopedData(data) => {
                let output_len = data.output.as_ref().map(|o| o.data.len()).unwrap_or(0);
                println!(
                    "block #{} ({}) output_bytes={} cursor={}",
                    data.clock.number, data.clock.id, output_len, data.cursor
                );
            }
            Response::ModulesProgress { modules } => {
                for progress in modules {
                    tracing::info!(
                        module = %progress.name,
                        ranges = progress.processed_ranges.len(),
                        "progress"
                    );
                }
            }
            Response::DebugStoreSnapshot {
                module_name,
                entries,
            } => {
                println!("initial snapshot {module_name}: {} keys", entries.len());
            }
            Response::PartialsWritten { trailer } => {
                println!("partials written: {trailer}");
            }
        }
        Ok(())
    })
}

fn api_token() -> Option<String> {
    std::env::var(API_TOKEN_ENV)
        .or_else(|_| std::env::var(API_TOKEN_FALLBACK_ENV))
        .ok()
        .filter(|token| !token.is_empty())
}

/// The replay file stands in for the block source's head tracker: the
/// highest LIB it mentions is the most recent finalized block.
fn scan_latest_final_block(path: &PathBuf) -> EngineResult<Option<u64>> {
    let file = std::fs::File::open(path)?;
    let mut latest: Option<u64> = None;
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(block) = serde_json::from_str::<tierstream::SourceBlock>(&line) {
            latest = Some(latest.map_or(block.final_block_height, |l| {
                l.max(block.final_block_height)
            }));
        }
    }
    Ok(latest)
}
