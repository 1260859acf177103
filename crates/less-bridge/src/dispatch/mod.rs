//! Routes plugin function calls to the peer.
//!
//! A call takes one of three routes. The persistent binary protocol serves simple value
//! arguments without any stream message. Other binary-mode calls flatten their arguments into
//! a fresh shared region and send only its path. Everything else, including any call whose
//! region cannot be set up, goes over the command stream as structural JSON.
mod arg;
mod cache;
pub mod context;
mod function;
mod result;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use less_flat::{CodecError, FlatAst, unflatten};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{CallMode, Config};
use crate::mux::{CommandMux, MuxError};
use crate::protocol::layout::MAX_ARGS;
use crate::protocol::{BinaryProtocol, PreloadedVariable, ProtocolError, WireValue};
use crate::scope::ScopeKey;
use crate::shm::{SharedRegion, ShmError, ShmManager};

pub use arg::CallArg;
pub use cache::{CacheKey, ResultCache};
pub use context::{ContextFingerprint, EvalContext, FrameStack, Variable, resolve_from};
pub use function::{FunctionSpec, PluginFunction};
pub use result::{ChildSlot, ResultNode};

pub const GET_VARIABLE_CALLBACK: &str = "getVariable";

/// Smallest region allocated for a FlatAST call.
const MIN_CALL_REGION: usize = 4096;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Mux(MuxError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Plugin error: {0}")]
    Peer(String),
    #[error("Invalid response from peer: {0}")]
    InvalidResponse(String),
}

impl From<MuxError> for DispatchError {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Remote(message) => DispatchError::Peer(message),
            other => DispatchError::Mux(other),
        }
    }
}

/// Counts of how calls were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub json_calls: u64,
    pub shm_calls: u64,
    pub protocol_calls: u64,
    pub fallbacks: u64,
    pub cache_hits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    json: AtomicU64,
    shm: AtomicU64,
    protocol: AtomicU64,
    fallbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Contexts of the calls in flight, keyed by the `contextId` sent with each call.
type ActiveContexts = Arc<Mutex<FxHashMap<u64, Arc<dyn EvalContext>>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariableRequest {
    name: String,
    #[serde(default)]
    depth: usize,
    #[serde(default)]
    context_id: Option<u64>,
}

pub struct Dispatcher {
    config: Config,
    mux: Arc<CommandMux>,
    shm: Arc<ShmManager>,
    protocol: Mutex<Option<BinaryProtocol>>,
    cache: ResultCache,
    active: ActiveContexts,
    next_context: AtomicU64,
    preload_state: Mutex<Option<ContextFingerprint>>,
    callback_regions: Arc<Mutex<Vec<String>>>,
    in_flight: AtomicUsize,
    counters: Counters,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.config.mode)
            .field("protocol", &self.has_protocol())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher and registers the `getVariable` callback on `mux`.
    pub fn new(config: Config, mux: Arc<CommandMux>, shm: Arc<ShmManager>) -> Self {
        let active: ActiveContexts = Arc::new(Mutex::new(FxHashMap::default()));
        let callback_regions = Arc::new(Mutex::new(Vec::new()));

        {
            let shm = Arc::clone(&shm);
            let active = Arc::clone(&active);
            let regions = Arc::clone(&callback_regions);
            mux.register_callback(GET_VARIABLE_CALLBACK, move |data| {
                serve_variable(data, &shm, &active, &regions)
            });
        }

        Self {
            config,
            mux,
            shm,
            protocol: Mutex::new(None),
            cache: ResultCache::new(),
            active,
            next_context: AtomicU64::new(0),
            preload_state: Mutex::new(None),
            callback_regions,
            in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn has_protocol(&self) -> bool {
        lock(&self.protocol).is_some()
    }

    /// Allocates the persistent protocol region and hands its layout to the peer.
    ///
    /// Returns whether the peer started polling it. A peer that declines leaves calls on the
    /// per-call region and JSON routes.
    pub fn init_protocol(&self) -> Result<bool, DispatchError> {
        let protocol = BinaryProtocol::create(&self.shm, self.config.protocol_timeout, self.config.poll_interval)?;
        let region = Arc::clone(protocol.region());
        let data = json!({
            "path": region.path().to_string_lossy(),
            "size": region.size(),
            "layout": serde_json::to_value(protocol.layout())?,
        });

        let polling = match self.mux.send("initProtocol", data, self.config.call_timeout) {
            Ok(response) => response.get("polling").and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                self.destroy_region(region.key());
                return Err(e.into());
            }
        };

        if polling {
            info!(path = %region.path().display(), "Binary protocol ready");
            *lock(&self.protocol) = Some(protocol);
        } else {
            debug!("Peer declined the binary protocol");
            self.destroy_region(region.key());
        }
        Ok(polling)
    }

    /// Asks the peer's polling thread to stop and releases the protocol region.
    pub fn shutdown_protocol(&self) {
        let protocol = lock(&self.protocol).take();
        if let Some(protocol) = protocol {
            self.retire_protocol(protocol);
        }
    }

    /// Starts a new compilation: cached results and preloaded values are discarded.
    pub fn begin_compilation(&self) {
        self.cache.clear();
        *lock(&self.preload_state) = None;
        trace!("Dispatcher reset for a new compilation");
    }

    pub fn invalidate(&self, function: &str) -> usize {
        self.cache.invalidate_function(function)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            json_calls: self.counters.json.load(Ordering::Relaxed),
            shm_calls: self.counters.shm.load(Ordering::Relaxed),
            protocol_calls: self.counters.protocol.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
        }
    }

    /// Calls `function` with `args`, serving it from the result cache when allowed.
    ///
    /// `scope` is the key of the scope that registered the function. `ctx` is made visible
    /// to the peer's variable callbacks for the duration of the call.
    pub fn call(
        &self,
        function: &FunctionSpec,
        scope: ScopeKey,
        args: &[CallArg],
        ctx: Option<Arc<dyn EvalContext>>,
    ) -> Result<ResultNode, DispatchError> {
        let key = (self.config.cache_results && function.cacheable && !function.needs_context)
            .then(|| CacheKey::new(&function.name, scope, args));

        if let Some(key) = &key
            && let Some(hit) = self.cache.get(key)
        {
            trace!(function = %function.name, "Cache hit");
            return Ok(hit);
        }

        let result = self.invoke(function, args, ctx)?;
        if let Some(key) = key {
            self.cache.insert(key, result.clone());
        }
        Ok(result)
    }

    fn invoke(
        &self,
        function: &FunctionSpec,
        args: &[CallArg],
        ctx: Option<Arc<dyn EvalContext>>,
    ) -> Result<ResultNode, DispatchError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _finish = scopeguard::guard((), |()| self.finish_call());

        let context = ctx.map(|ctx| {
            let id = self.next_context.fetch_add(1, Ordering::Relaxed) + 1;
            lock(&self.active).insert(id, Arc::clone(&ctx));
            (id, ctx)
        });
        let _release = scopeguard::guard(context.as_ref().map(|(id, _)| *id), |id| {
            if let Some(id) = id {
                lock(&self.active).remove(&id);
            }
        });
        let ctx = context.as_ref().map(|(id, ctx)| (*id, ctx.as_ref()));

        // The preload section holds one context; concurrent context calls use callbacks instead.
        let preloaded = match ctx {
            Some((_, ctx)) if function.needs_context && lock(&self.active).len() == 1 => self.ensure_preloaded(ctx),
            _ => false,
        };

        match function.mode.unwrap_or(self.config.mode) {
            CallMode::Json => self.call_json(function, args, ctx),
            CallMode::Binary => {
                if !function.needs_context
                    && let Some(result) = self.call_protocol(function, args)?
                {
                    return Ok(result);
                }

                // Only failures before the peer sees the call may be retried over JSON.
                let outcome = match self.write_call_region(args) {
                    Ok((region, data_size)) => {
                        let _cleanup = scopeguard::guard(region.key().to_string(), |key| self.destroy_region(&key));
                        let outcome = self.call_shm(function, args.len(), &region, data_size, preloaded, ctx)?;
                        if outcome.is_none() {
                            debug!(function = %function.name, "Peer could not use the call region, retrying as JSON");
                        }
                        outcome
                    }
                    Err(e @ (DispatchError::Shm(_) | DispatchError::Codec(_))) => {
                        warn!(function = %function.name, error = %e, "Shared memory unavailable, falling back to JSON");
                        None
                    }
                    Err(e) => return Err(e),
                };

                match outcome {
                    Some(result) => Ok(result),
                    None => {
                        Counters::bump(&self.counters.fallbacks);
                        self.call_json(function, args, ctx)
                    }
                }
            }
        }
    }

    fn call_json(
        &self,
        function: &FunctionSpec,
        args: &[CallArg],
        ctx: Option<(u64, &dyn EvalContext)>,
    ) -> Result<ResultNode, DispatchError> {
        Counters::bump(&self.counters.json);
        let mut data = json!({
            "name": function.name,
            "args": args.iter().map(CallArg::to_json).collect::<Vec<_>>(),
            "needsContext": function.needs_context,
        });
        if function.needs_context
            && let Some((id, ctx)) = ctx
        {
            data["contextId"] = json!(id);
            data["context"] = self.context_json(ctx);
        }

        let result = self.mux.send("callFunction", data, self.config.call_timeout)?;
        Ok(ResultNode::from_json(&result))
    }

    /// Fast path through the persistent protocol. `None` means the call should take another route.
    fn call_protocol(&self, function: &FunctionSpec, args: &[CallArg]) -> Result<Option<ResultNode>, DispatchError> {
        let mut guard = lock(&self.protocol);
        let Some(protocol) = guard.as_mut() else {
            return Ok(None);
        };
        if args.len() > MAX_ARGS {
            return Ok(None);
        }
        let Some(wire) = args.iter().map(CallArg::to_wire).collect::<Option<Vec<_>>>() else {
            return Ok(None);
        };

        let (id, first_use) = protocol.register_function(&function.name);
        if first_use {
            let data = json!({ "name": function.name, "id": id });
            if let Err(e) = self.mux.send("registerFunction", data, self.config.call_timeout) {
                warn!(function = %function.name, error = %e, "Function registration failed");
                protocol.unregister_function(&function.name);
                return Ok(None);
            }
            debug!(function = %function.name, id, "Registered function with the peer");
        }

        // Nothing has reached the peer yet, so any staging failure can take another route.
        match protocol.stage_call(id, &wire) {
            Ok(()) => {}
            Err(
                e @ (ProtocolError::SectionFull { .. } | ProtocolError::TooManyArguments { .. } | ProtocolError::Codec(_)),
            ) => {
                debug!(function = %function.name, error = %e, "Arguments do not fit the protocol region");
                Counters::bump(&self.counters.fallbacks);
                return Ok(None);
            }
            Err(e) => {
                warn!(function = %function.name, error = %e, "Protocol region unusable, disabling the protocol");
                Counters::bump(&self.counters.fallbacks);
                self.disable_protocol(guard);
                return Ok(None);
            }
        }

        Counters::bump(&self.counters.protocol);
        match protocol.finish_call() {
            Ok(value) => Ok(Some(ResultNode::from_wire(&value))),
            Err(ProtocolError::Peer(message)) => Err(DispatchError::Peer(message)),
            Err(ProtocolError::Timeout(timeout)) => {
                // A late response would be read as the answer to the next call.
                warn!(function = %function.name, ?timeout, "Protocol call timed out, disabling the protocol");
                self.disable_protocol(guard);
                Err(ProtocolError::Timeout(timeout).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the protocol from `guard` and retires it once the lock is released.
    fn disable_protocol(&self, mut guard: MutexGuard<'_, Option<BinaryProtocol>>) {
        let retired = guard.take();
        drop(guard);
        if let Some(protocol) = retired {
            self.retire_protocol(protocol);
        }
    }

    fn write_call_region(&self, args: &[CallArg]) -> Result<(Arc<SharedRegion>, usize), DispatchError> {
        let bytes = arg::flatten_args(args)?.to_bytes()?;
        let region = self.shm.create((bytes.len() * 2).max(MIN_CALL_REGION))?;
        if let Err(e) = region.write(0, &bytes).and_then(|()| region.sync()) {
            self.destroy_region(region.key());
            return Err(e.into());
        }
        Ok((region, bytes.len()))
    }

    /// `None` when the peer asks for the call to be retried over JSON.
    fn call_shm(
        &self,
        function: &FunctionSpec,
        arg_count: usize,
        region: &SharedRegion,
        data_size: usize,
        preloaded: bool,
        ctx: Option<(u64, &dyn EvalContext)>,
    ) -> Result<Option<ResultNode>, DispatchError> {
        Counters::bump(&self.counters.shm);
        let mut data = json!({
            "name": function.name,
            "shmPath": region.path().to_string_lossy(),
            "shmKey": region.key(),
            "shmSize": region.size(),
            "dataSize": data_size,
            "argCount": arg_count,
            "needsContext": function.needs_context,
            "preloaded": preloaded,
        });
        if function.needs_context
            && let Some((id, _)) = ctx
        {
            data["contextId"] = json!(id);
        }
        let response = self.mux.send("callFunctionShm", data, self.config.call_timeout)?;

        if let Some(reason) = response.get("fallback") {
            debug!(function = %function.name, %reason, "Peer requested JSON fallback");
            return Ok(None);
        }
        if let Some(value) = response.get("json") {
            return Ok(Some(ResultNode::from_json(value)));
        }

        let offset = usize_field(&response, "resultOffset")?;
        let size = usize_field(&response, "resultSize")?;
        let invalid = |e: &dyn std::fmt::Display| DispatchError::InvalidResponse(format!("unreadable result: {e}"));
        let ast = region
            .view(offset, size, FlatAst::from_bytes)
            .map_err(|e| invalid(&e))?
            .map_err(|e| invalid(&e))?;
        let root = unflatten(&ast).map_err(|e| invalid(&e))?;
        Ok(Some(ResultNode::from_generic(&root)))
    }

    /// Pushes the configured common variables into the preload section unless the context is
    /// unchanged since the last push. Returns whether the section is current.
    fn ensure_preloaded(&self, ctx: &dyn EvalContext) -> bool {
        let fingerprint = ContextFingerprint::of(ctx);
        let mut state = lock(&self.preload_state);
        if *state == Some(fingerprint) {
            return true;
        }

        let protocol = lock(&self.protocol);
        let Some(protocol) = protocol.as_ref() else {
            return false;
        };

        let vars = self
            .config
            .preload_variables
            .iter()
            .filter_map(|name| resolve_from(ctx, 0, name))
            .filter(|var| WireValue::supports(&var.value))
            .map(|var| PreloadedVariable {
                value: WireValue::from_node(&var.value),
                name: var.name,
                important: var.important,
            })
            .collect::<Vec<_>>();

        match protocol.preload(&vars) {
            Ok(()) => {
                debug!(count = vars.len(), "Preloaded variables");
                *state = Some(fingerprint);
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to preload variables");
                *state = None;
                false
            }
        }
    }

    /// The common variables as JSON, for calls that travel over the command stream.
    fn context_json(&self, ctx: &dyn EvalContext) -> Value {
        let variables = self
            .config
            .preload_variables
            .iter()
            .filter_map(|name| resolve_from(ctx, 0, name))
            .map(|var| (var.name.clone(), variable_json(&var)))
            .collect::<Map<_, _>>();
        json!({ "variables": variables })
    }

    fn retire_protocol(&self, protocol: BinaryProtocol) {
        if let Err(e) = protocol.request_shutdown() {
            warn!(error = %e, "Failed to signal protocol shutdown");
        }
        self.destroy_region(protocol.region().key());
        *lock(&self.preload_state) = None;
    }

    fn finish_call(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let keys = std::mem::take(&mut *lock(&self.callback_regions));
        for key in keys {
            self.destroy_region(&key);
        }
    }

    fn destroy_region(&self, key: &str) {
        if let Err(e) = self.shm.destroy(key) {
            warn!(key, error = %e, "Failed to destroy shared region");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.mux.unregister_callback(GET_VARIABLE_CALLBACK);
        self.shutdown_protocol();
    }
}

/// Answers a peer's `getVariable` callback from the context of the call named by `contextId`.
/// A request without one is served only while exactly one call has a context.
///
/// Values with a tagged-union form are written to a fresh region in preload entry format;
/// anything else, or a region failure, is answered inline.
fn serve_variable(
    data: Value,
    shm: &ShmManager,
    active: &Mutex<FxHashMap<u64, Arc<dyn EvalContext>>>,
    regions: &Mutex<Vec<String>>,
) -> Result<Value, String> {
    let request = VariableRequest::deserialize(&data).map_err(|e| e.to_string())?;
    let ctx = {
        let active = lock(active);
        match request.context_id {
            Some(id) => active.get(&id).cloned(),
            None if active.len() == 1 => active.values().next().cloned(),
            None => None,
        }
    };
    let Some(ctx) = ctx else {
        debug!(name = %request.name, "Variable requested with no active context");
        return Ok(Value::Null);
    };
    let Some(var) = resolve_from(ctx.as_ref(), request.depth, &request.name) else {
        return Ok(Value::Null);
    };

    if WireValue::supports(&var.value) {
        let entry = PreloadedVariable {
            name: var.name.clone(),
            important: var.important,
            value: WireValue::from_node(&var.value),
        };
        match write_variable(shm, &entry) {
            Ok((region, size)) => {
                lock(regions).push(region.key().to_string());
                return Ok(json!({
                    "shmPath": region.path().to_string_lossy(),
                    "offset": 0,
                    "size": size,
                }));
            }
            Err(e) => warn!(name = %var.name, error = %e, "Answering variable inline"),
        }
    }

    Ok(json!({ "json": variable_json(&var) }))
}

fn write_variable(shm: &ShmManager, entry: &PreloadedVariable) -> Result<(Arc<SharedRegion>, usize), DispatchError> {
    let bytes = entry.to_bytes()?;
    let region = shm.create(bytes.len())?;
    if let Err(e) = region.write(0, &bytes).and_then(|()| region.sync()) {
        let _ = shm.destroy(region.key());
        return Err(e.into());
    }
    Ok((region, bytes.len()))
}

fn variable_json(var: &Variable) -> Value {
    json!({
        "name": var.name,
        "important": var.important,
        "value": ResultNode::from_node(&var.value).to_json(),
    })
}

fn usize_field(response: &Value, key: &str) -> Result<usize, DispatchError> {
    response
        .get(key)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| DispatchError::InvalidResponse(format!("missing \"{key}\" in {response}")))
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
