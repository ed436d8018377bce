//! Module descriptors and content hashing.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

use std::collections::HashMap;

/// Write policy of a store module, fixed for the module's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    Set,
    SetIfNotExists,
    Add,
    Min,
    Max,
    Append,
}

impl UpdatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePolicy::Set => "set",
            UpdatePolicy::SetIfNotExists => "set_if_not_exists",
            UpdatePolicy::Add => "add",
            UpdatePolicy::Min => "min",
            UpdatePolicy::Max => "max",
            UpdatePolicy::Append => "append",
        }
    }
}

/// Declared type of a store's values; drives numeric policy arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bytes,
    String,
    Int64,
    BigInt,
    Float64,
    BigFloat,
    Proto(String),
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bytes => "bytes",
            ValueType::String => "string",
            ValueType::Int64 => "int64",
            ValueType::BigInt => "bigint",
            ValueType::Float64 => "float64",
            ValueType::BigFloat => "bigfloat",
            ValueType::Proto(_) => "proto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    Get,
    Deltas,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Map {
        output_type: String,
    },
    Store {
        update_policy: UpdatePolicy,
        value_type: ValueType,
    },
}

impl ModuleKind {
    pub fn is_store(&self) -> bool {
        matches!(self, ModuleKind::Store { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleInput {
    /// Raw block payload from the source.
    Source { kind: String },
    /// Current-block output of an upstream map module.
    Map { module_name: String },
    /// Upstream store, either read (`get`) or its current-block delta log.
    Store { module_name: String, mode: StoreMode },
    /// Static bytes baked into the request.
    Params {
        #[serde(with = "bytes_b64")]
        value: Vec<u8>,
    },
}

impl ModuleInput {
    /// Name of the referenced module, if the input references one.
    pub fn module_name(&self) -> Option<&str> {
        match self {
            ModuleInput::Map { module_name } | ModuleInput::Store { module_name, .. } => {
                Some(module_name)
            }
            ModuleInput::Source { .. } | ModuleInput::Params { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub binary_index: usize,
    pub binary_entrypoint: String,
    pub initial_block: u64,
    pub kind: ModuleKind,
    pub inputs: Vec<ModuleInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binary {
    #[serde(with = "bytes_b64")]
    pub content: Vec<u8>,
}

/// Complete module universe of one request: descriptors plus the sandbox
/// binaries they index into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSet {
    pub binaries: Vec<Binary>,
    pub modules: Vec<Module>,
}

impl ModuleSet {
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn binary_for(&self, module: &Module) -> EngineResult<&Binary> {
        self.binaries
            .get(module.binary_index)
            .ok_or_else(|| EngineError::InvalidRequest {
                reason: format!(
                    "module {:?} references missing binary index {}",
                    module.name, module.binary_index
                ),
            })
    }
}

/// Stable content hashes for every module of a set, computed once per
/// request. A module's hash covers its own code and wiring plus the hashes
/// of every transitively referenced module, so a cached artifact keyed by
/// hash never goes stale.
#[derive(Debug, Default)]
pub struct ModuleHashes {
    hashes: HashMap<String, String>,
}

impl ModuleHashes {
    pub fn compute(set: &ModuleSet) -> EngineResult<ModuleHashes> {
        let mut out = ModuleHashes::default();
        for module in &set.modules {
            out.hash_module(set, module)?;
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> EngineResult<&str> {
        self.hashes
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| EngineError::UnknownModule {
                name: name.to_string(),
            })
    }

    fn hash_module(&mut self, set: &ModuleSet, module: &Module) -> EngineResult<String> {
        if let Some(existing) = self.hashes.get(&module.name) {
            return Ok(existing.clone());
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(set.binary_for(module)?.content.as_slice());
        hasher.update(module.binary_entrypoint.as_bytes());
        hasher.update(&module.initial_block.to_le_bytes());
        match &module.kind {
            ModuleKind::Map { output_type } => {
                hasher.update(b"map");
                hasher.update(output_type.as_bytes());
            }
            ModuleKind::Store {
                update_policy,
                value_type,
            } => {
                hasher.update(b"store");
                hasher.update(update_policy.as_str().as_bytes());
                hasher.update(value_type.as_str().as_bytes());
                if let ValueType::Proto(message) = value_type {
                    hasher.update(message.as_bytes());
                }
            }
        }
        for input in &module.inputs {
            match input {
                ModuleInput::Source { kind } => {
                    hasher.update(b"source");
                    hasher.update(kind.as_bytes());
                }
                ModuleInput::Params { value } => {
                    hasher.update(b"params");
                    hasher.update(value);
                }
                ModuleInput::Map { module_name } => {
                    hasher.update(b"map_input");
                    let referenced = set.get(module_name).ok_or_else(|| {
                        EngineError::ManifestDanglingInput {
                            module: module.name.clone(),
                            input: module_name.clone(),
                        }
                    })?;
                    let dep_hash = self.hash_module(set, referenced)?;
                    hasher.update(dep_hash.as_bytes());
                }
                ModuleInput::Store { module_name, mode } => {
                    hasher.update(b"store_input");
                    hasher.update(match mode {
                        StoreMode::Get => b"get".as_slice(),
                        StoreMode::Deltas => b"deltas".as_slice(),
                    });
                    let referenced = set.get(module_name).ok_or_else(|| {
                        EngineError::ManifestDanglingInput {
                            module: module.name.clone(),
                            input: module_name.clone(),
                        }
                    })?;
                    let dep_hash = self.hash_module(set, referenced)?;
                    hasher.update(dep_hash.as_bytes());
                }
            }
        }

        let hash = hasher.finalize().to_hex().to_string();
        self.hashes.insert(module.name.clone(), hash.clone());
        Ok(hash)
    }
}

/// Base64 (standard alphabet) encoding for binary payloads inside JSON
/// manifests.
mod bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let raw = String::deserialize(deserializer)?;
            STANDARD
                .decode(raw.as_bytes())
                .map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}
