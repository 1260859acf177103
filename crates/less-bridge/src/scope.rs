//! Plugin registrations per nesting level of a stylesheet.
//!
//! Functions are looked up innermost first, so a local registration shadows the same name
//! in every ancestor. Visitors, processors and file managers accumulate instead: a nested
//! scope sees its own entries together with all of its ancestors'.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use itertools::Itertools;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::dispatch::{CallArg, DispatchError, EvalContext, PluginFunction, ResultNode};

/// Position of a scope in the hierarchy. `sequence` is unique among scopes sharing a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub depth: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub name: String,
    #[serde(default)]
    pub is_replacing: bool,
    #[serde(default)]
    pub is_pre_eval_visitor: bool,
}

/// A pre- or post-processor. Lower priorities run first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Processor {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManager {
    pub name: String,
    #[serde(default)]
    pub extensions: Vec<String>,
}

/// A function found by [`Scope::lookup_function`], with the key of the scope that registered it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundFunction {
    pub function: PluginFunction,
    pub origin: ScopeKey,
}

impl BoundFunction {
    pub fn name(&self) -> &str {
        self.function.name()
    }

    pub fn call(&self, args: &[CallArg]) -> Result<ResultNode, DispatchError> {
        self.function.call(self.origin, args)
    }

    pub fn call_with_context(&self, args: &[CallArg], ctx: Arc<dyn EvalContext>) -> Result<ResultNode, DispatchError> {
        self.function.call_with_context(self.origin, args, ctx)
    }
}

#[derive(Debug, Default)]
struct Registrations {
    functions: FxHashMap<String, PluginFunction>,
    visitors: Vec<Visitor>,
    pre_processors: Vec<Processor>,
    post_processors: Vec<Processor>,
    file_managers: Vec<FileManager>,
}

#[derive(Debug)]
struct ScopeInner {
    key: ScopeKey,
    parent: Option<Scope>,
    sequence: Arc<AtomicU64>,
    local: RwLock<Registrations>,
}

#[derive(Debug, Clone)]
pub struct Scope(Arc<ScopeInner>);

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}

impl Scope {
    pub fn root() -> Self {
        Self(Arc::new(ScopeInner {
            key: ScopeKey::default(),
            parent: None,
            sequence: Arc::new(AtomicU64::new(0)),
            local: RwLock::new(Registrations::default()),
        }))
    }

    /// A scope nested in this one. Drop it when leaving the nesting boundary.
    pub fn create_child(&self) -> Self {
        let sequence = Arc::clone(&self.0.sequence);
        let key = ScopeKey {
            depth: self.0.key.depth + 1,
            sequence: sequence.fetch_add(1, Ordering::Relaxed) + 1,
        };
        Self(Arc::new(ScopeInner {
            key,
            parent: Some(self.clone()),
            sequence,
            local: RwLock::new(Registrations::default()),
        }))
    }

    pub fn key(&self) -> ScopeKey {
        self.0.key
    }

    pub fn depth(&self) -> u32 {
        self.0.key.depth
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    /// Registers `function` locally, returning any local registration it replaces.
    pub fn add_function(&self, function: PluginFunction) -> Option<PluginFunction> {
        self.write().functions.insert(function.name().to_string(), function)
    }

    pub fn get_local(&self, name: &str) -> Option<PluginFunction> {
        self.read().functions.get(name).cloned()
    }

    pub fn lookup_function(&self, name: &str) -> Option<BoundFunction> {
        self.chain().find_map(|scope| {
            scope.get_local(name).map(|function| BoundFunction {
                function,
                origin: scope.key(),
            })
        })
    }

    /// Every function name visible from this scope.
    pub fn function_names(&self) -> Vec<String> {
        self.chain()
            .flat_map(|scope| scope.read().functions.keys().cloned().collect::<Vec<_>>())
            .sorted()
            .dedup()
            .collect()
    }

    pub fn add_visitor(&self, visitor: Visitor) {
        self.write().visitors.push(visitor);
    }

    /// Ancestors' visitors first, then this scope's.
    pub fn get_visitors(&self) -> Vec<Visitor> {
        self.accumulate(|local| local.visitors.clone())
    }

    pub fn add_pre_processor(&self, processor: Processor) {
        self.write().pre_processors.push(processor);
    }

    pub fn get_pre_processors(&self) -> Vec<Processor> {
        by_priority(self.accumulate(|local| local.pre_processors.clone()))
    }

    pub fn add_post_processor(&self, processor: Processor) {
        self.write().post_processors.push(processor);
    }

    pub fn get_post_processors(&self) -> Vec<Processor> {
        by_priority(self.accumulate(|local| local.post_processors.clone()))
    }

    pub fn add_file_manager(&self, manager: FileManager) {
        self.write().file_managers.push(manager);
    }

    /// This scope's file managers first, so the innermost one gets the first chance to load.
    pub fn get_file_managers(&self) -> Vec<FileManager> {
        self.chain()
            .flat_map(|scope| scope.read().file_managers.clone())
            .collect()
    }

    /// Clears local registrations so the scope can be reused.
    pub fn reset(&self) {
        *self.write() = Registrations::default();
    }

    /// This scope followed by its ancestors.
    fn chain(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |scope| scope.parent())
    }

    fn accumulate<T>(&self, f: impl Fn(&Registrations) -> Vec<T>) -> Vec<T> {
        let scopes = self.chain().collect::<Vec<_>>();
        scopes.into_iter().rev().flat_map(|scope| f(&scope.read())).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registrations> {
        self.0.local.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registrations> {
        self.0.local.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stable, so equal priorities keep outer-before-inner registration order.
fn by_priority(mut processors: Vec<Processor>) -> Vec<Processor> {
    processors.sort_by_key(|processor| processor.priority);
    processors
}
