//! Live in-memory store state shared by the full and partial variants.

use hashbrown::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::manifest::{UpdatePolicy, ValueType};
use crate::store::delta::{validate_key, BlockDeltas, Delta, Operation};
use crate::store::value;

/// Hard ceiling on a store's resident size (keys + values).
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 1 << 30;

/// Per-key ceiling for the `append` policy.
pub const DEFAULT_APPEND_LIMIT: usize = 8192;

pub struct BaseStore {
    name: String,
    module_hash: String,
    initial_block: u64,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    kv: HashMap<Vec<u8>, Vec<u8>>,
    /// Delta log of the current block, cleared at every block boundary.
    deltas: Vec<Delta>,
    deleted_prefixes: Vec<(u64, Vec<u8>)>,
    total_size_bytes: u64,
    size_limit: u64,
    append_limit: usize,
}

impl BaseStore {
    pub fn new(
        name: impl Into<String>,
        module_hash: impl Into<String>,
        initial_block: u64,
        update_policy: UpdatePolicy,
        value_type: ValueType,
    ) -> Self {
        Self {
            name: name.into(),
            module_hash: module_hash.into(),
            initial_block,
            update_policy,
            value_type,
            kv: HashMap::new(),
            deltas: Vec::new(),
            deleted_prefixes: Vec::new(),
            total_size_bytes: 0,
            size_limit: DEFAULT_MAX_TOTAL_SIZE,
            append_limit: DEFAULT_APPEND_LIMIT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    pub fn initial_block(&self) -> u64 {
        self.initial_block
    }

    pub fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    /// Current value of `key`, after every delta applied so far.
    pub fn get_last(&self, key: &[u8]) -> Option<&[u8]> {
        self.kv.get(key).map(Vec::as_slice)
    }

    /// Value of `key` as seen before any delta of the current block.
    pub fn get_first(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_at(key, 0)
    }

    /// Value of `key` as seen before any delta with `ordinal' >= ordinal`.
    pub fn get_at(&self, key: &[u8], ordinal: u64) -> Option<Vec<u8>> {
        let mut current = self.kv.get(key).cloned();
        for delta in self.deltas.iter().rev() {
            if delta.ordinal < ordinal || delta.key != key {
                continue;
            }
            current = match delta.operation {
                Operation::Create => None,
                Operation::Update | Operation::Delete => Some(delta.old_value.clone()),
            };
        }
        current
    }

    /// Deltas recorded so far for the current block, in execution order.
    pub fn current_deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Closes the current block: hands the delta log out and resets it.
    pub fn end_block(&mut self, block_num: u64) -> BlockDeltas {
        BlockDeltas {
            block_num,
            deltas: std::mem::take(&mut self.deltas),
            deleted_prefixes: std::mem::take(&mut self.deleted_prefixes),
        }
    }

    pub fn set(&mut self, ordinal: u64, key: &[u8], new_value: &[u8]) -> EngineResult<()> {
        let (operation, old_value) = match self.get_last(key) {
            Some(old) => (Operation::Update, old.to_vec()),
            None => (Operation::Create, Vec::new()),
        };
        self.push_delta(Delta {
            operation,
            ordinal,
            key: key.to_vec(),
            old_value,
            new_value: new_value.to_vec(),
        })
    }

    pub fn set_if_not_exists(
        &mut self,
        ordinal: u64,
        key: &[u8],
        new_value: &[u8],
    ) -> EngineResult<()> {
        if self.get_last(key).is_some() {
            return Ok(());
        }
        self.push_delta(Delta {
            operation: Operation::Create,
            ordinal,
            key: key.to_vec(),
            old_value: Vec::new(),
            new_value: new_value.to_vec(),
        })
    }

    pub fn add(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let old = self.get_last(key).map(<[u8]>::to_vec);
        let summed = value::add(&self.value_type, old.as_deref(), value)
            .map_err(|source| self.coercion_error(source))?;
        let (operation, old_value) = match old {
            Some(old) => (Operation::Update, old),
            None => (Operation::Create, Vec::new()),
        };
        self.push_delta(Delta {
            operation,
            ordinal,
            key: key.to_vec(),
            old_value,
            new_value: summed,
        })
    }

    pub fn set_min(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.set_extremum(ordinal, key, value, std::cmp::Ordering::Less)
    }

    pub fn set_max(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.set_extremum(ordinal, key, value, std::cmp::Ordering::Greater)
    }

    fn set_extremum(
        &mut self,
        ordinal: u64,
        key: &[u8],
        value: &[u8],
        keep_when: std::cmp::Ordering,
    ) -> EngineResult<()> {
        match self.get_last(key) {
            None => self.push_delta(Delta {
                operation: Operation::Create,
                ordinal,
                key: key.to_vec(),
                old_value: Vec::new(),
                new_value: value.to_vec(),
            }),
            Some(old) => {
                let ordering = value::compare(&self.value_type, value, old)
                    .map_err(|source| self.coercion_error(source))?;
                if ordering != keep_when {
                    return Ok(());
                }
                let old_value = old.to_vec();
                self.push_delta(Delta {
                    operation: Operation::Update,
                    ordinal,
                    key: key.to_vec(),
                    old_value,
                    new_value: value.to_vec(),
                })
            }
        }
    }

    pub fn append(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> EngineResult<()> {
        let (operation, old_value) = match self.get_last(key) {
            Some(old) => (Operation::Update, old.to_vec()),
            None => (Operation::Create, Vec::new()),
        };
        let mut new_value = old_value.clone();
        new_value.extend_from_slice(value);
        if new_value.len() > self.append_limit {
            return Err(EngineError::AppendLimitExceeded {
                module: self.name.clone(),
                size: new_value.len(),
                limit: self.append_limit,
            });
        }
        self.push_delta(Delta {
            operation,
            ordinal,
            key: key.to_vec(),
            old_value,
            new_value,
        })
    }

    /// Deletes every key starting with `prefix`, recording one delta per
    /// removed key plus the prefix itself for later replay against states
    /// this store never saw.
    pub fn delete_prefix(&mut self, ordinal: u64, prefix: &[u8]) -> EngineResult<()> {
        let matching: Vec<Vec<u8>> = self
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in matching {
            let old_value = self.kv.get(&key).cloned().unwrap_or_default();
            self.push_delta(Delta {
                operation: Operation::Delete,
                ordinal,
                key,
                old_value,
                new_value: Vec::new(),
            })?;
        }
        self.deleted_prefixes.push((ordinal, prefix.to_vec()));
        Ok(())
    }

    fn push_delta(&mut self, delta: Delta) -> EngineResult<()> {
        self.apply_delta(&delta)?;
        self.deltas.push(delta);
        Ok(())
    }

    /// Applies one delta to the live state, maintaining the size counter.
    pub fn apply_delta(&mut self, delta: &Delta) -> EngineResult<()> {
        validate_key(&self.name, &delta.key)?;

        let key_size = delta.key.len() as u64;
        let old_size = delta.old_value.len() as u64;
        let new_size = delta.new_value.len() as u64;

        match delta.operation {
            Operation::Create => {
                self.kv.insert(delta.key.clone(), delta.new_value.clone());
                self.total_size_bytes += key_size + new_size;
            }
            Operation::Update => {
                self.kv.insert(delta.key.clone(), delta.new_value.clone());
                if new_size > old_size {
                    self.total_size_bytes += new_size - old_size;
                } else {
                    self.total_size_bytes =
                        self.total_size_bytes.saturating_sub(old_size - new_size);
                }
            }
            Operation::Delete => {
                self.kv.remove(&delta.key);
                self.total_size_bytes =
                    self.total_size_bytes.saturating_sub(key_size + old_size);
                return Ok(());
            }
        }

        if self.total_size_bytes > self.size_limit {
            return Err(EngineError::StoreSizeExceeded {
                module: self.name.clone(),
                size: self.total_size_bytes,
                limit: self.size_limit,
            });
        }
        Ok(())
    }

    pub fn apply_deltas(&mut self, deltas: &[Delta]) -> EngineResult<()> {
        for delta in deltas {
            self.apply_delta(delta)?;
        }
        Ok(())
    }

    /// Undoes a delta sequence, newest first. The exact inverse of
    /// [`BaseStore::apply_deltas`].
    pub fn apply_deltas_reverse(&mut self, deltas: &[Delta]) {
        for delta in deltas.iter().rev() {
            let key_size = delta.key.len() as u64;
            let old_size = delta.old_value.len() as u64;
            let new_size = delta.new_value.len() as u64;

            match delta.operation {
                Operation::Create => {
                    self.kv.remove(&delta.key);
                    self.total_size_bytes =
                        self.total_size_bytes.saturating_sub(key_size + new_size);
                }
                Operation::Update => {
                    self.kv.insert(delta.key.clone(), delta.old_value.clone());
                    if new_size > old_size {
                        self.total_size_bytes =
                            self.total_size_bytes.saturating_sub(new_size - old_size);
                    } else {
                        self.total_size_bytes += old_size - new_size;
                    }
                }
                Operation::Delete => {
                    self.kv.insert(delta.key.clone(), delta.old_value.clone());
                    self.total_size_bytes += key_size + old_size;
                }
            }
        }
    }

    /// Sorted view of the live state, for deterministic serialization.
    pub fn sorted_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .kv
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Replaces the live state wholesale, recomputing the size counter.
    /// Used when loading a snapshot.
    pub fn replace_entries(&mut self, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        self.kv.clear();
        self.total_size_bytes = 0;
        for (key, val) in entries {
            self.total_size_bytes += (key.len() + val.len()) as u64;
            self.kv.insert(key, val);
        }
        self.deltas.clear();
        self.deleted_prefixes.clear();
    }

    /// Direct state mutation used by the merge path; maintains the size
    /// counter but records no delta.
    pub(crate) fn upsert_raw(&mut self, key: &[u8], value: Vec<u8>) -> EngineResult<()> {
        match self.kv.insert(key.to_vec(), value.clone()) {
            Some(previous) => {
                let (old_size, new_size) = (previous.len() as u64, value.len() as u64);
                if new_size > old_size {
                    self.total_size_bytes += new_size - old_size;
                } else {
                    self.total_size_bytes =
                        self.total_size_bytes.saturating_sub(old_size - new_size);
                }
            }
            None => self.total_size_bytes += (key.len() + value.len()) as u64,
        }
        if self.total_size_bytes > self.size_limit {
            return Err(EngineError::StoreSizeExceeded {
                module: self.name.clone(),
                size: self.total_size_bytes,
                limit: self.size_limit,
            });
        }
        Ok(())
    }

    pub(crate) fn remove_raw(&mut self, key: &[u8]) {
        if let Some(previous) = self.kv.remove(key) {
            self.total_size_bytes = self
                .total_size_bytes
                .saturating_sub((key.len() + previous.len()) as u64);
        }
    }

    pub(crate) fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn coercion_error(&self, source: crate::error::ValueError) -> EngineError {
        EngineError::ValueCoercion {
            module: self.name.clone(),
            source,
        }
    }
}
