//! A small plugin host that serves built-in functions instead of loading plugin files.
//!
//! It speaks the full peer side of the bridge: the command stream on stdio, per-call FlatAST
//! regions, variable callbacks and the persistent protocol region. The integration tests
//! run against it.
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use less_bridge::Config;
use less_bridge::dispatch::{GET_VARIABLE_CALLBACK, ResultNode};
use less_bridge::message::Request;
use less_bridge::peer::{PeerChannel, ShmCall};
use less_bridge::protocol::{Layout, PreloadedVariable, ProtocolPeer, WireValue};
use less_bridge::shm::SharedRegion;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tracing::{debug, error, info};

type VariableLookup<'a> = &'a mut dyn FnMut(&str) -> Result<Option<(ResultNode, &'static str)>, String>;

/// The built-in function table.
#[derive(Debug, Default)]
struct Functions {
    calls: AtomicU64,
}

impl Functions {
    fn manifest(path: &str, options: &Value) -> Result<Value, String> {
        if path.contains("missing") {
            return Err(format!("Cannot find plugin {path}"));
        }
        let priority = options.get("priority").and_then(Value::as_i64).unwrap_or(1);
        let label = path.rsplit('/').next().unwrap_or(path);
        Ok(json!({
            "functions": [
                {"name": "add"},
                {"name": "jsonadd", "mode": "json"},
                {"name": "echo"},
                {"name": "fail"},
                {"name": "calls", "cacheable": true},
                {"name": "var", "needsContext": true},
                {"name": "varsource", "needsContext": true},
            ],
            "visitors": [{"name": format!("{label}-visitor")}],
            "preProcessors": [{"name": format!("{label}-pre"), "priority": priority}],
            "postProcessors": [{"name": format!("{label}-post"), "priority": priority}],
            "fileManagers": [{"name": format!("{label}-files"), "extensions": [".mem"]}],
        }))
    }

    fn call(&self, name: &str, args: &[ResultNode], lookup: VariableLookup<'_>) -> Result<ResultNode, String> {
        match name {
            "add" | "jsonadd" => {
                let unit = args
                    .iter()
                    .filter_map(|arg| arg.field("unit").and_then(Value::as_str))
                    .find(|unit| !unit.is_empty())
                    .unwrap_or_default();
                Ok(ResultNode::dimension(args.iter().filter_map(ResultNode::as_f64).sum(), unit))
            }
            "echo" => Ok(args.first().cloned().unwrap_or_else(ResultNode::null)),
            "fail" => Err("fail was called".to_string()),
            "calls" => {
                let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ResultNode::dimension(count as f64, ""))
            }
            "var" | "varsource" => {
                let variable = args
                    .first()
                    .and_then(ResultNode::as_str)
                    .ok_or_else(|| format!("{name} expects a variable name"))?;
                Ok(match (lookup(variable)?, name) {
                    (Some((value, _)), "var") => value,
                    (Some((_, source)), _) => ResultNode::keyword(source),
                    (None, _) => ResultNode::null(),
                })
            }
            other => Err(format!("Unknown function: {other}")),
        }
    }
}

/// Protocol polling thread and what it shares with the command loop.
struct ProtocolState {
    peer: Arc<ProtocolPeer>,
    names: Arc<Mutex<FxHashMap<u32, String>>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct EchoPeer {
    functions: Arc<Functions>,
    protocol: Option<ProtocolState>,
}

impl EchoPeer {
    fn handle<R: BufRead, W: Write>(&mut self, request: &Request, channel: &mut PeerChannel<R, W>) -> Result<Value, String> {
        let data = &request.data;
        match request.cmd.as_str() {
            "ping" => Ok(json!("pong")),
            "initProtocol" => self.init_protocol(data),
            "registerFunction" => {
                let (Some(name), Some(id)) = (data["name"].as_str(), data["id"].as_u64()) else {
                    return Err("registerFunction expects a name and an id".to_string());
                };
                let protocol = self.protocol.as_ref().ok_or("protocol is not initialized")?;
                lock(&protocol.names).insert(id as u32, name.to_string());
                debug!(name, id, "Registered protocol function");
                Ok(Value::Null)
            }
            "loadPlugin" => Functions::manifest(data["path"].as_str().unwrap_or_default(), &data["options"]),
            "callFunction" => {
                let name = data["name"].as_str().unwrap_or_default();
                let args = data["args"]
                    .as_array()
                    .map(|args| args.iter().map(ResultNode::from_json).collect::<Vec<_>>())
                    .unwrap_or_default();
                let context = &data["context"]["variables"];
                let context_id = data["contextId"].as_u64();
                let mut lookup = |variable: &str| match context.get(variable) {
                    Some(var) => Ok(Some((ResultNode::from_json(&var["value"]), "context"))),
                    None => request_variable(channel, variable, context_id),
                };
                let result = self.functions.call(name, &args, &mut lookup)?;
                Ok(result.to_json())
            }
            "callFunctionShm" => {
                let call = match ShmCall::open(data) {
                    Ok(call) => call,
                    Err(e) => return Ok(json!({ "fallback": e.to_string() })),
                };
                let preloaded = match (&self.protocol, call.preloaded) {
                    (Some(protocol), true) => protocol.peer.preloaded().map_err(|e| e.to_string())?,
                    _ => Vec::new(),
                };
                let mut lookup = |variable: &str| match preloaded.iter().find(|var| var.name == variable) {
                    Some(var) => Ok(Some((ResultNode::from_wire(&var.value), "preload"))),
                    None => request_variable(channel, variable, call.context_id),
                };
                let result = self.functions.call(&call.name, &call.result_nodes(), &mut lookup)?;
                call.reply(&result.to_node()).map_err(|e| e.to_string())
            }
            "shutdown" => {
                self.stop();
                Ok(Value::Null)
            }
            other => Err(format!("Unknown command: {other}")),
        }
    }

    fn init_protocol(&mut self, data: &Value) -> Result<Value, String> {
        self.stop();
        let layout: Layout = serde_json::from_value(data["layout"].clone()).map_err(|e| e.to_string())?;
        let path = data["path"].as_str().ok_or("initProtocol expects a path")?;
        let peer = Arc::new(ProtocolPeer::attach(path, layout).map_err(|e| e.to_string())?);
        peer.mark_ready().map_err(|e| e.to_string())?;

        let names = Arc::new(Mutex::new(FxHashMap::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (peer, names, stop) = (Arc::clone(&peer), Arc::clone(&names), Arc::clone(&stop));
            let functions = Arc::clone(&self.functions);
            thread::spawn(move || serve_protocol(&peer, &names, &functions, &stop))
        };
        info!(path, "Polling protocol region");

        self.protocol = Some(ProtocolState {
            peer,
            names,
            stop,
            handle,
        });
        Ok(json!({ "polling": true }))
    }

    fn stop(&mut self) {
        if let Some(protocol) = self.protocol.take() {
            protocol.stop.store(true, Ordering::SeqCst);
            if protocol.handle.join().is_err() {
                error!("Protocol thread panicked");
            }
        }
    }
}

fn serve_protocol(peer: &ProtocolPeer, names: &Mutex<FxHashMap<u32, String>>, functions: &Functions, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        let request = match peer.wait_request(Duration::from_millis(50), Duration::from_micros(50)) {
            Ok(Some(request)) => request,
            Ok(None) if peer.shutdown_requested().unwrap_or(true) => break,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Protocol polling failed");
                break;
            }
        };

        let name = lock(names).get(&request.function_id).cloned();
        let outcome = match name {
            Some(name) => {
                let args = request.args.iter().map(ResultNode::from_wire).collect::<Vec<_>>();
                let mut no_variables = |_: &str| -> Result<Option<(ResultNode, &'static str)>, String> {
                    Err("variables are not available on the protocol path".to_string())
                };
                functions.call(&name, &args, &mut no_variables)
            }
            None => Err(format!("Unknown function id {}", request.function_id)),
        };

        let sent = match outcome {
            Ok(result) => {
                let node = result.to_node();
                if WireValue::supports(&node) {
                    peer.respond(&WireValue::from_node(&node))
                } else {
                    peer.respond_error("result has no wire form")
                }
            }
            Err(message) => peer.respond_error(&message),
        };
        if let Err(e) = sent {
            error!(error = %e, "Failed to answer protocol request");
            break;
        }
    }
    debug!("Protocol polling stopped");
}

/// Asks the host for `name` and decodes whichever form it answers in.
fn request_variable<R: BufRead, W: Write>(
    channel: &mut PeerChannel<R, W>,
    name: &str,
    context_id: Option<u64>,
) -> Result<Option<(ResultNode, &'static str)>, String> {
    let answer = channel
        .callback(
            GET_VARIABLE_CALLBACK,
            json!({ "name": name, "depth": 0, "contextId": context_id }),
        )
        .map_err(|e| e.to_string())??;

    if let Some(path) = answer.get("shmPath").and_then(Value::as_str) {
        let offset = answer["offset"].as_u64().unwrap_or_default() as usize;
        let size = answer["size"].as_u64().unwrap_or_default() as usize;
        let region = SharedRegion::open_read_only(path).map_err(|e| e.to_string())?;
        let var = region
            .view(offset, size, |bytes| PreloadedVariable::decode(bytes, &mut 0))
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        return Ok(Some((ResultNode::from_wire(&var.value), "callback")));
    }

    Ok(answer
        .get("json")
        .map(|var| (ResultNode::from_json(&var["value"]), "callback")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn main() -> ExitCode {
    less_bridge::log::init(&Config::from_env());

    let mut peer = EchoPeer::default();
    let mut channel = PeerChannel::stdio();
    loop {
        let request = match channel.next_request() {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read command");
                peer.stop();
                return ExitCode::FAILURE;
            }
        };

        let result = peer.handle(&request, &mut channel);
        if let Err(e) = channel.respond(request.id, result) {
            error!(error = %e, "Failed to answer command");
            break;
        }
        if request.cmd == "shutdown" {
            break;
        }
    }

    peer.stop();
    ExitCode::SUCCESS
}
