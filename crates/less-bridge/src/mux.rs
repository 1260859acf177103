//! Request/response multiplexing over a single line-delimited JSON stream.
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::message::{Callback, Incoming, Request, Response};

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("I/O error on command stream: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Command \"{cmd}\" timed out after {timeout:?}")]
    Timeout { cmd: String, timeout: Duration },
    #[error("Peer disconnected")]
    Disconnected,
    #[error("{0}")]
    Remote(String),
}

/// Handler for a callback issued by the peer. Runs on the reader thread.
pub type CallbackHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

type Writer = Box<dyn Write + Send>;

struct Shared {
    writer: Mutex<Option<Writer>>,
    next_id: AtomicU64,
    pending: Mutex<FxHashMap<u64, Sender<Result<Value, MuxError>>>>,
    callbacks: RwLock<FxHashMap<String, CallbackHandler>>,
    closed: AtomicBool,
}

impl Shared {
    fn write_line<T: serde::Serialize>(&self, message: &T) -> Result<(), MuxError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or(MuxError::Disconnected)?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    fn handle_callback(&self, callback: Callback) {
        let handler = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&callback.callback)
            .cloned();
        let result = match handler {
            Some(handler) => handler(callback.data),
            None => Err(format!("Unknown callback: {}", callback.callback)),
        };
        trace!(id = callback.id, callback = %callback.callback, ok = result.is_ok(), "Answering callback");
        if let Err(e) = self.write_line(&Response::from_result(callback.id, result)) {
            warn!(error = %e, "Failed to answer callback");
        }
    }

    fn handle_response(&self, response: Response) {
        let id = response.id;
        self.complete(id, response.into_result().map_err(MuxError::Remote));
    }

    fn complete(&self, id: u64, result: Result<Value, MuxError>) {
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id, "Dropping response with unknown id"),
        }
    }

    fn close(&self) {
        let mut pending = lock(&self.pending);
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a disconnect.
        pending.clear();
    }
}

/// Correlates concurrent commands with their responses and serves peer callbacks.
///
/// A background thread owns the read half. Responses are routed to the waiting caller by id;
/// callback messages are answered synchronously on that thread while the original command
/// is still outstanding.
pub struct CommandMux {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CommandMux {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(Box::new(writer))),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(FxHashMap::default()),
            callbacks: RwLock::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("less-bridge-mux".to_string())
            .spawn(move || read_loop(reader, &reader_shared));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to spawn command reader");
                shared.close();
                None
            }
        };

        Self {
            shared,
            reader: Mutex::new(handle),
        }
    }

    pub fn register_callback<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), Arc::new(handler));
    }

    pub fn unregister_callback(&self, name: &str) -> bool {
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    /// Sends `cmd` and blocks until its response arrives, the peer disconnects or `timeout` elapses.
    pub fn send(&self, cmd: &str, data: Value, timeout: Duration) -> Result<Value, MuxError> {
        let id = self.next_id();
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            let mut pending = lock(&self.shared.pending);
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(MuxError::Disconnected);
            }
            pending.insert(id, tx);
        }

        let request = Request {
            id,
            cmd: cmd.to_string(),
            data,
        };
        trace!(id, cmd, "Sending command");
        if let Err(e) = self.shared.write_line(&request) {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.shared.pending).remove(&id);
                Err(MuxError::Timeout {
                    cmd: cmd.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(MuxError::Disconnected),
        }
    }

    /// Writes a command without waiting for its response. Returns the id used.
    pub fn notify(&self, cmd: &str, data: Value) -> Result<u64, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Disconnected);
        }
        let id = self.next_id();
        self.shared.write_line(&Request {
            id,
            cmd: cmd.to_string(),
            data,
        })?;
        Ok(id)
    }

    /// Drops the write half so the peer sees end of input.
    pub fn close_writer(&self) {
        lock(&self.shared.writer).take();
    }

    /// Waits for the reader thread to observe end of stream.
    pub fn join_reader(&self) {
        if let Some(handle) = lock(&self.reader).take()
            && handle.join().is_err()
        {
            warn!("Command reader thread panicked");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Drop for CommandMux {
    fn drop(&mut self) {
        self.close_writer();
    }
}

fn read_loop<R: BufRead>(reader: R, shared: &Shared) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Command stream read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Incoming::parse(&line) {
            Ok(Incoming::Response(response)) => shared.handle_response(response),
            Ok(Incoming::Callback(callback)) => shared.handle_callback(callback),
            Ok(Incoming::Request(request)) => {
                warn!(id = request.id, cmd = %request.cmd, "Ignoring command sent by peer");
                let _ = shared.write_line(&Response::err(request.id, "host does not accept commands"));
            }
            Err(e) => match Incoming::response_id(&line) {
                Some(id) => {
                    warn!(id, error = %e, "Malformed response from peer");
                    shared.complete(id, Err(MuxError::Json(e)));
                }
                None => warn!(error = %e, line = %line, "Ignoring malformed line from peer"),
            },
        }
    }

    debug!("Command stream closed");
    shared.close();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::time::Instant;

    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::peer::PeerChannel;
    use crate::testing::{FakePeer, pipe};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_ids_are_strictly_increasing() {
        let peer = FakePeer::spawn(|request, _| Ok(json!(request.id)));
        let a = peer.mux.send("ping", json!({}), TIMEOUT).unwrap();
        let b = peer.mux.send("ping", json!({}), TIMEOUT).unwrap();
        assert_eq!(a, json!(1));
        assert_eq!(b, json!(2));
    }

    #[test]
    fn test_concurrent_commands_are_correlated() {
        let peer = FakePeer::spawn(|request, _| Ok(request.data.clone()));
        let mux = Arc::clone(&peer.mux);
        let handles = (0..8)
            .map(|i| {
                let mux = Arc::clone(&mux);
                thread::spawn(move || mux.send("echo", json!({ "n": i }), TIMEOUT).unwrap())
            })
            .collect::<Vec<_>>();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), json!({ "n": i }));
        }
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_remote_error() {
        let peer = FakePeer::spawn(|_, _| Err("plugin exploded".to_string()));
        let err = peer.mux.send("callFunction", json!({}), TIMEOUT).unwrap_err();
        assert!(matches!(err, MuxError::Remote(msg) if msg == "plugin exploded"));
    }

    #[test]
    fn test_callback_round_trip() {
        let peer = FakePeer::spawn(|request, channel| {
            let answer = channel
                .callback("double", request.data.clone())
                .map_err(|e| e.to_string())?;
            answer.map_err(|e| format!("callback failed: {e}"))
        });
        peer.mux.register_callback("double", |data| {
            let n = data.as_i64().ok_or("not a number")?;
            Ok(json!(n * 2))
        });
        assert_eq!(peer.mux.send("work", json!(21), TIMEOUT).unwrap(), json!(42));

        let err = peer.mux.send("work", json!("x"), TIMEOUT).unwrap_err();
        assert!(matches!(err, MuxError::Remote(msg) if msg.contains("not a number")));
    }

    #[test]
    fn test_unknown_callback() {
        let peer = FakePeer::spawn(|_, channel| channel.callback("missing", Value::Null).map_err(|e| e.to_string())?);
        let err = peer.mux.send("work", Value::Null, TIMEOUT).unwrap_err();
        assert!(matches!(err, MuxError::Remote(msg) if msg.contains("Unknown callback")));
    }

    #[test]
    fn test_timeout_cleans_up() {
        let (_to_host, host_reader) = pipe();
        let (host_writer, _from_host) = pipe();
        let mux = CommandMux::new(BufReader::new(host_reader), host_writer);
        let err = mux.send("ping", json!({}), Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, MuxError::Timeout { .. }));
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_disconnect_fails_waiters() {
        let (to_host, host_reader) = pipe();
        let (host_writer, from_host) = pipe();
        let mux = Arc::new(CommandMux::new(BufReader::new(host_reader), host_writer));

        let waiter = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.send("ping", json!({}), TIMEOUT))
        };
        // Read the request, then hang up without answering.
        let mut channel = PeerChannel::new(BufReader::new(from_host), to_host);
        assert!(channel.next_request().unwrap().is_some());
        drop(channel);

        assert!(matches!(waiter.join().unwrap(), Err(MuxError::Disconnected)));
        mux.join_reader();
        assert!(mux.is_closed());
        assert!(matches!(mux.send("ping", json!({}), TIMEOUT), Err(MuxError::Disconnected)));
    }

    #[test]
    fn test_unknown_response_ids_and_garbage_are_ignored() {
        let (mut to_host, host_reader) = pipe();
        let (host_writer, from_host) = pipe();
        let mux = Arc::new(CommandMux::new(BufReader::new(host_reader), host_writer));

        let waiter = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || mux.send("ping", json!({}), TIMEOUT))
        };
        let mut channel = PeerChannel::new(BufReader::new(from_host), to_host.clone());
        let request = channel.next_request().unwrap().unwrap();
        writeln!(to_host, "garbage").unwrap();
        writeln!(to_host, "{}", json!({"id": 999, "success": true, "result": 0})).unwrap();
        channel.respond(request.id, Ok(json!("pong"))).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), json!("pong"));
    }

    #[rstest]
    #[case::truncated("\"success\": \"yes\"")]
    #[case::wrong_types("\"success\": \"yes\"}")]
    #[case::missing_success("\"result\": 1}")]
    fn test_malformed_response_fails_its_waiter(#[case] tail: &str) {
        let (mut to_host, host_reader) = pipe();
        let (host_writer, from_host) = pipe();
        let mux = Arc::new(CommandMux::new(BufReader::new(host_reader), host_writer));

        let waiter = {
            let mux = Arc::clone(&mux);
            thread::spawn(move || {
                let started = Instant::now();
                (mux.send("ping", json!({}), TIMEOUT), started.elapsed())
            })
        };
        let mut channel = PeerChannel::new(BufReader::new(from_host), to_host.clone());
        let request = channel.next_request().unwrap().unwrap();
        writeln!(to_host, "{{\"id\": {}, {tail}", request.id).unwrap();

        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(MuxError::Json(_))));
        assert!(elapsed < TIMEOUT);
        assert_eq!(mux.pending_count(), 0);
        assert!(!mux.is_closed());
    }
}
