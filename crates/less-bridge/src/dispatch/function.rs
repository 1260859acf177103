use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::EvalContext;
use super::{CallArg, DispatchError, Dispatcher, ResultNode};
use crate::config::CallMode;
use crate::scope::ScopeKey;

/// A function as declared by a plugin manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub name: String,
    /// Overrides the process-wide call mode for this function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CallMode>,
    #[serde(default)]
    pub needs_context: bool,
    #[serde(default)]
    pub cacheable: bool,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: None,
            needs_context: false,
            cacheable: false,
        }
    }
}

/// A plugin function bound to the dispatcher that carries its calls.
#[derive(Clone)]
pub struct PluginFunction {
    spec: FunctionSpec,
    dispatcher: Arc<Dispatcher>,
}

impl fmt::Debug for PluginFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFunction").field("spec", &self.spec).finish()
    }
}

impl PartialEq for PluginFunction {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec && Arc::ptr_eq(&self.dispatcher, &other.dispatcher)
    }
}

impl PluginFunction {
    pub fn new(spec: FunctionSpec, dispatcher: Arc<Dispatcher>) -> Self {
        Self { spec, dispatcher }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    /// The strategy this function's calls use.
    pub fn mode(&self) -> CallMode {
        self.spec.mode.unwrap_or(self.dispatcher.config().mode)
    }

    pub fn call(&self, scope: ScopeKey, args: &[CallArg]) -> Result<ResultNode, DispatchError> {
        self.dispatcher.call(&self.spec, scope, args, None)
    }

    pub fn call_with_context(
        &self,
        scope: ScopeKey,
        args: &[CallArg],
        ctx: Arc<dyn EvalContext>,
    ) -> Result<ResultNode, DispatchError> {
        self.dispatcher.call(&self.spec, scope, args, Some(ctx))
    }
}
