//! Peer-side building blocks: the stdio command loop and shared-memory call decoding.
//!
//! These are what a plugin host process links against; the host side of the bridge only
//! uses them in tests and in the `echo-peer` binary.
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use less_flat::{CodecError, FlatAst, GenericNode, Node, NodeKind, flatten, unflatten};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::ResultNode;
use crate::message::{Callback, Incoming, Request, Response};
use crate::mux::MuxError;
use crate::protocol::ProtocolError;
use crate::shm::{SharedRegion, ShmError};

#[derive(Error, Debug)]
pub enum PeerError {
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Line-oriented peer end of the command stream.
pub struct PeerChannel<R, W> {
    reader: R,
    writer: W,
    next_callback_id: u64,
    queued: VecDeque<Request>,
}

impl PeerChannel<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> PeerChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            next_callback_id: 0,
            queued: VecDeque::new(),
        }
    }

    /// Next command from the host, or `None` once the host closes the stream.
    pub fn next_request(&mut self) -> Result<Option<Request>, MuxError> {
        if let Some(request) = self.queued.pop_front() {
            return Ok(Some(request));
        }
        loop {
            let Some(incoming) = self.read_incoming()? else {
                return Ok(None);
            };
            match incoming {
                Incoming::Request(request) => return Ok(Some(request)),
                Incoming::Response(response) => debug!(id = response.id, "Ignoring stray response"),
                Incoming::Callback(callback) => {
                    self.write_line(&Response::err(callback.id, "peer does not serve callbacks"))?;
                }
            }
        }
    }

    pub fn respond(&mut self, id: u64, result: Result<Value, String>) -> Result<(), MuxError> {
        self.write_line(&Response::from_result(id, result))
    }

    /// Asks the host for something mid-command and waits for the answer.
    ///
    /// Commands that arrive while waiting are queued for [`PeerChannel::next_request`].
    pub fn callback(&mut self, name: &str, data: Value) -> Result<Result<Value, String>, MuxError> {
        self.next_callback_id += 1;
        let id = self.next_callback_id;
        self.write_line(&Callback {
            id,
            callback: name.to_string(),
            data,
        })?;

        loop {
            match self.read_incoming()?.ok_or(MuxError::Disconnected)? {
                Incoming::Response(response) if response.id == id => return Ok(response.into_result()),
                Incoming::Response(response) => debug!(id = response.id, "Ignoring stray response"),
                Incoming::Request(request) => self.queued.push_back(request),
                Incoming::Callback(callback) => {
                    self.write_line(&Response::err(callback.id, "peer does not serve callbacks"))?;
                }
            }
        }
    }

    fn read_incoming(&mut self) -> Result<Option<Incoming>, MuxError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Incoming::parse(trimmed) {
                Ok(incoming) => return Ok(Some(incoming)),
                Err(e) => warn!(error = %e, "Ignoring malformed line from host"),
            }
        }
    }

    fn write_line<T: serde::Serialize>(&mut self, message: &T) -> Result<(), MuxError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShmCallRequest {
    name: String,
    shm_path: String,
    data_size: usize,
    #[serde(default)]
    preloaded: bool,
    #[serde(default)]
    needs_context: bool,
    #[serde(default)]
    context_id: Option<u64>,
}

/// A decoded `callFunctionShm` command: the arguments read from the host's region, plus the
/// means to write a FlatAST result back after them.
pub struct ShmCall {
    pub name: String,
    pub args: Vec<GenericNode>,
    pub preloaded: bool,
    pub needs_context: bool,
    /// Names the host-side context that `getVariable` callbacks for this call resolve against.
    pub context_id: Option<u64>,
    region: SharedRegion,
    data_size: usize,
}

impl ShmCall {
    pub fn open(data: &Value) -> Result<Self, PeerError> {
        let request = ShmCallRequest::deserialize(data).map_err(|e| PeerError::InvalidRequest(e.to_string()))?;
        let region = SharedRegion::attach(&request.shm_path)?;
        let ast = region.view(0, request.data_size, FlatAst::from_bytes)??;
        let root = unflatten(&ast)?;
        let args = if root.kind == Some(NodeKind::Arguments) {
            root.children
        } else {
            vec![root]
        };

        Ok(Self {
            name: request.name,
            args,
            preloaded: request.preloaded,
            needs_context: request.needs_context,
            context_id: request.context_id,
            region,
            data_size: request.data_size,
        })
    }

    pub fn result_nodes(&self) -> Vec<ResultNode> {
        self.args.iter().map(ResultNode::from_generic).collect()
    }

    /// Writes `result` after the argument data. Falls back to inline JSON when it does not fit.
    pub fn reply(&self, result: &Node) -> Result<Value, PeerError> {
        let bytes = flatten(result)?.to_bytes()?;
        let offset = self.data_size.next_multiple_of(8);
        if offset.checked_add(bytes.len()).is_some_and(|end| end <= self.region.size()) {
            self.region.write(offset, &bytes)?;
            self.region.sync()?;
            Ok(json!({ "resultOffset": offset, "resultSize": bytes.len() }))
        } else {
            debug!(size = bytes.len(), "Result does not fit in the call region, replying inline");
            Ok(json!({ "json": ResultNode::from_node(result).to_json() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    use serde_json::json;

    use super::*;
    use crate::testing::pipe;

    #[test]
    fn test_callback_queues_interleaved_requests() {
        let (mut host_out, peer_in) = pipe();
        let (peer_out, host_in) = pipe();
        let mut channel = PeerChannel::new(BufReader::new(peer_in), peer_out);

        writeln!(host_out, "{}", json!({"id": 5, "cmd": "ping"})).unwrap();
        writeln!(host_out, "{}", json!({"id": 1, "success": true, "result": "red"})).unwrap();
        assert_eq!(channel.callback("getVariable", json!({"name": "@c"})).unwrap(), Ok(json!("red")));
        assert_eq!(channel.next_request().unwrap().unwrap().id, 5);

        drop(host_out);
        assert!(channel.next_request().unwrap().is_none());

        drop(channel);
        let mut sent = String::new();
        BufReader::new(host_in).read_line(&mut sent).unwrap();
        let callback: Callback = serde_json::from_str(&sent).unwrap();
        assert_eq!(callback.callback, "getVariable");
        assert_eq!(callback.id, 1);
    }

    #[test]
    fn test_callback_without_answer_disconnects() {
        let (host_out, peer_in) = pipe();
        let (peer_out, _host_in) = pipe();
        let mut channel = PeerChannel::new(BufReader::new(peer_in), peer_out);
        drop(host_out);
        assert!(matches!(channel.callback("x", Value::Null), Err(MuxError::Disconnected)));
    }

    #[test]
    fn test_shm_call_reads_arguments_and_writes_result() {
        let manager = crate::shm::ShmManager::new();
        let args = Node::arguments(vec![Node::dimension(1.0, "px"), Node::keyword("auto")]);
        let bytes = flatten(&args).unwrap().to_bytes().unwrap();
        let region = manager.create(4096).unwrap();
        region.write_all(&bytes).unwrap();

        let call = ShmCall::open(&json!({
            "name": "f",
            "shmPath": region.path(),
            "shmSize": 4096,
            "dataSize": bytes.len(),
            "argCount": 2,
        }))
        .unwrap();
        assert_eq!(call.name, "f");
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.result_nodes()[1].type_name(), "Keyword");

        let reply = call.reply(&Node::dimension(2.0, "em")).unwrap();
        let offset = reply["resultOffset"].as_u64().unwrap() as usize;
        let size = reply["resultSize"].as_u64().unwrap() as usize;
        assert_eq!(offset % 8, 0);
        assert!(offset >= bytes.len());
        let result = unflatten(&FlatAst::from_bytes(&region.read(offset, size).unwrap()).unwrap()).unwrap();
        assert_eq!(result.kind, Some(NodeKind::Dimension));
    }

    #[test]
    fn test_shm_call_inline_fallback_when_region_is_full() {
        let manager = crate::shm::ShmManager::new();
        let bytes = flatten(&Node::keyword("a")).unwrap().to_bytes().unwrap();
        let region = manager.create(bytes.len()).unwrap();
        region.write_all(&bytes).unwrap();

        let call = ShmCall::open(&json!({"name": "f", "shmPath": region.path(), "dataSize": bytes.len()})).unwrap();
        let reply = call.reply(&Node::keyword("b")).unwrap();
        assert_eq!(reply["json"]["_type"], "Keyword");
        assert_eq!(reply["json"]["value"], "b");
    }

    #[test]
    fn test_shm_call_rejects_bad_requests() {
        assert!(matches!(ShmCall::open(&json!({"name": "f"})), Err(PeerError::InvalidRequest(_))));
        assert!(matches!(
            ShmCall::open(&json!({"name": "f", "shmPath": "/nonexistent/region", "dataSize": 1})),
            Err(PeerError::Shm(_))
        ));
    }
}
