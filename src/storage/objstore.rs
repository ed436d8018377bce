//! Object-store abstraction and the filesystem implementation backing it.
//!
//! Artifacts are write-once: writes go through a temporary file and a
//! rename, and the containing directory is synced so a crash never leaves a
//! half-written snapshot behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

pub trait ObjectStore: Send + Sync {
    /// All object names in this area, lexicographically sorted.
    fn list(&self) -> EngineResult<Vec<String>>;

    fn read(&self, name: &str) -> EngineResult<Option<Vec<u8>>>;

    fn write(&self, name: &str, payload: &[u8]) -> EngineResult<()>;

    /// A nested area of this store.
    fn sub_store(&self, prefix: &str) -> EngineResult<Arc<dyn ObjectStore>>;
}

pub struct FsObjectStore {
    root_dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(root_dir: impl AsRef<Path>) -> EngineResult<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }
}

impl ObjectStore for FsObjectStore {
    fn list(&self) -> EngineResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // In-flight writes are invisible to readers.
                if name.ends_with(".tmp") {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> EngineResult<Option<Vec<u8>>> {
        match std::fs::read(self.root_dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, name: &str, payload: &[u8]) -> EngineResult<()> {
        let final_path = self.root_dir.join(name);
        let tmp_path = self.root_dir.join(format!("{name}.tmp"));

        std::fs::write(&tmp_path, payload)?;
        std::fs::rename(&tmp_path, &final_path)?;
        sync_directory(&self.root_dir)?;
        Ok(())
    }

    fn sub_store(&self, prefix: &str) -> EngineResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(FsObjectStore::new(self.root_dir.join(prefix))?))
    }
}

/// Sync directory entries to disk to guarantee rename durability. Opening
/// directories works on Linux and macOS as long as the path exists.
fn sync_directory(path: &Path) -> EngineResult<()> {
    let dir = std::fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

const ARTIFACT_MAGIC: &[u8; 4] = b"TSA1";
const ARTIFACT_VERSION: u16 = 1;
const ARTIFACT_FLAG_COMPRESSED: u16 = 0x0001;
const ARTIFACT_HEADER_SIZE: usize = 16;
const ZSTD_LEVEL: i32 = 3;

/// Frames a serialized payload with magic, version, flags and a truncated
/// blake3 checksum. All snapshot, partial and output-cache files go through
/// this framing.
pub fn encode_artifact(payload: &[u8], compress: bool) -> EngineResult<Vec<u8>> {
    let (body, flags) = if compress {
        (zstd::encode_all(payload, ZSTD_LEVEL)?, ARTIFACT_FLAG_COMPRESSED)
    } else {
        (payload.to_vec(), 0)
    };

    let mut out = Vec::with_capacity(ARTIFACT_HEADER_SIZE + body.len());
    out.extend_from_slice(ARTIFACT_MAGIC);
    out.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&checksum_to_u64(blake3::hash(&body)).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_artifact(name: &str, raw: &[u8]) -> EngineResult<Vec<u8>> {
    let corrupted = |reason: &'static str| EngineError::ArtifactCorrupted {
        name: name.to_string(),
        reason,
    };

    if raw.len() < ARTIFACT_HEADER_SIZE {
        return Err(corrupted("truncated header"));
    }
    if &raw[0..4] != ARTIFACT_MAGIC {
        return Err(corrupted("invalid magic"));
    }
    let version = u16::from_le_bytes([raw[4], raw[5]]);
    if version != ARTIFACT_VERSION {
        return Err(corrupted("unsupported version"));
    }
    let flags = u16::from_le_bytes([raw[6], raw[7]]);
    let stored_checksum = u64::from_le_bytes(raw[8..16].try_into().expect("8 bytes"));

    let body = &raw[ARTIFACT_HEADER_SIZE..];
    if checksum_to_u64(blake3::hash(body)) != stored_checksum {
        return Err(corrupted("checksum mismatch"));
    }

    if flags & ARTIFACT_FLAG_COMPRESSED != 0 {
        Ok(zstd::decode_all(body)?)
    } else {
        Ok(body.to_vec())
    }
}

fn checksum_to_u64(hash: blake3::Hash) -> u64 {
    u64::from_le_bytes(hash.as_bytes()[0..8].try_into().expect("8 bytes"))
}
