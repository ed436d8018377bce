//! Dependency graph over module descriptors.
//!
//! The graph owns the modules; every other component refers to them by
//! integer index or by name. Validation happens once at construction so the
//! rest of the engine can assume a well-formed, acyclic graph.

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::manifest::module::{Module, ModuleInput};

pub struct ModuleGraph {
    modules: Vec<Module>,
    index_by_name: HashMap<String, usize>,
    /// `dependencies[i]` lists the indices module `i` consumes from.
    dependencies: Vec<Vec<usize>>,
    /// Indices in execution order, ties broken by module name.
    topological: Vec<usize>,
}

impl ModuleGraph {
    pub fn new(modules: Vec<Module>) -> EngineResult<Self> {
        let mut index_by_name = HashMap::with_capacity(modules.len());
        for (index, module) in modules.iter().enumerate() {
            index_by_name.insert(module.name.clone(), index);
        }

        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
        for (index, module) in modules.iter().enumerate() {
            for input in &module.inputs {
                let Some(input_name) = input.module_name() else {
                    continue;
                };
                let dep_index = *index_by_name.get(input_name).ok_or_else(|| {
                    EngineError::ManifestDanglingInput {
                        module: module.name.clone(),
                        input: input_name.to_string(),
                    }
                })?;
                validate_input_kind(module, input, &modules[dep_index])?;

                let dep = &modules[dep_index];
                if dep.initial_block > module.initial_block {
                    return Err(EngineError::ManifestInitialBlock {
                        module: module.name.clone(),
                        input: dep.name.clone(),
                        module_initial: module.initial_block,
                        input_initial: dep.initial_block,
                    });
                }
                if !dependencies[index].contains(&dep_index) {
                    dependencies[index].push(dep_index);
                }
            }
        }

        let topological = topological_sort(&modules, &dependencies)?;

        Ok(Self {
            modules,
            index_by_name,
            dependencies,
            topological,
        })
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> EngineResult<&Module> {
        self.index(name).map(|i| &self.modules[i])
    }

    fn index(&self, name: &str) -> EngineResult<usize> {
        self.index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownModule {
                name: name.to_string(),
            })
    }

    /// Execution order: every module appears after all of its inputs.
    pub fn topological_order(&self) -> Vec<&Module> {
        self.topological.iter().map(|&i| &self.modules[i]).collect()
    }

    /// All transitive inputs of `name`, in topological order.
    pub fn ancestors_of(&self, name: &str) -> EngineResult<Vec<&Module>> {
        let start = self.index(name)?;
        let mut seen = HashSet::new();
        self.collect_ancestors(start, &mut seen);
        seen.remove(&start);
        Ok(self
            .topological
            .iter()
            .filter(|i| seen.contains(i))
            .map(|&i| &self.modules[i])
            .collect())
    }

    /// Transitive inputs of `name` that are store modules.
    pub fn ancestor_stores_of(&self, name: &str) -> EngineResult<Vec<&Module>> {
        Ok(self
            .ancestors_of(name)?
            .into_iter()
            .filter(|m| m.kind.is_store())
            .collect())
    }

    /// Earliest block at which `name` can produce output: the maximum
    /// initial block across the module and its transitive inputs.
    pub fn module_start_block(&self, name: &str) -> EngineResult<u64> {
        let module = self.get(name)?;
        let mut start = module.initial_block;
        for ancestor in self.ancestors_of(name)? {
            start = start.max(ancestor.initial_block);
        }
        Ok(start)
    }

    /// Requested outputs plus everything they transitively depend on, in
    /// execution order.
    pub fn used_modules(&self, outputs: &[&str]) -> EngineResult<Vec<&Module>> {
        let mut seen = HashSet::new();
        for name in outputs {
            let index = self.index(name)?;
            self.collect_ancestors(index, &mut seen);
        }
        Ok(self
            .topological
            .iter()
            .filter(|i| seen.contains(i))
            .map(|&i| &self.modules[i])
            .collect())
    }

    /// Longest dependency chain ending at `name`. Used by the planner to
    /// schedule shallow modules before the work they unblock.
    pub fn dependency_depth(&self, name: &str) -> EngineResult<usize> {
        let index = self.index(name)?;
        let mut depth = vec![0usize; self.modules.len()];
        // The topological order guarantees dependencies are visited first.
        for &i in &self.topological {
            depth[i] = self.dependencies[i]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        Ok(depth[index])
    }

    fn collect_ancestors(&self, index: usize, seen: &mut HashSet<usize>) {
        if !seen.insert(index) {
            return;
        }
        for &dep in &self.dependencies[index] {
            self.collect_ancestors(dep, seen);
        }
    }
}

fn validate_input_kind(module: &Module, input: &ModuleInput, dep: &Module) -> EngineResult<()> {
    match input {
        ModuleInput::Map { .. } if dep.kind.is_store() => Err(EngineError::ManifestKindMismatch {
            module: module.name.clone(),
            input: dep.name.clone(),
            expected: "map",
        }),
        ModuleInput::Store { .. } if !dep.kind.is_store() => {
            Err(EngineError::ManifestKindMismatch {
                module: module.name.clone(),
                input: dep.name.clone(),
                expected: "store",
            })
        }
        _ => Ok(()),
    }
}

/// Kahn's algorithm with a name-ordered frontier so the order is stable
/// across runs and platforms.
fn topological_sort(modules: &[Module], dependencies: &[Vec<usize>]) -> EngineResult<Vec<usize>> {
    let mut in_degree = vec![0usize; modules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (index, deps) in dependencies.iter().enumerate() {
        in_degree[index] = deps.len();
        for &dep in deps {
            dependents[dep].push(index);
        }
    }

    let mut frontier: Vec<usize> = (0..modules.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut out = Vec::with_capacity(modules.len());

    while !frontier.is_empty() {
        frontier.sort_by(|&a, &b| modules[a].name.cmp(&modules[b].name));
        let next = frontier.remove(0);
        out.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                frontier.push(dependent);
            }
        }
    }

    if out.len() != modules.len() {
        let stuck = (0..modules.len())
            .find(|&i| in_degree[i] > 0)
            .expect("some module must be stuck when the sort is incomplete");
        return Err(EngineError::ManifestCycle {
            module: modules[stuck].name.clone(),
        });
    }

    Ok(out)
}
