//! In-memory pipes and an in-process fake peer for unit tests.
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;

use crate::message::Request;
use crate::mux::CommandMux;
use crate::peer::PeerChannel;

#[derive(Clone)]
pub(crate) struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A unidirectional byte pipe; the reader sees end of input once every writer is dropped.
pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

pub(crate) type FakeChannel = PeerChannel<BufReader<PipeReader>, PipeWriter>;

/// A peer running on a thread, answering every command with `handler`.
pub(crate) struct FakePeer {
    pub mux: Arc<CommandMux>,
    handle: Option<JoinHandle<()>>,
}

impl FakePeer {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&Request, &mut FakeChannel) -> Result<Value, String> + Send + 'static,
    {
        let (host_writer, peer_reader) = pipe();
        let (peer_writer, host_reader) = pipe();

        let handle = thread::spawn(move || {
            let mut channel = PeerChannel::new(BufReader::new(peer_reader), peer_writer);
            while let Ok(Some(request)) = channel.next_request() {
                let result = handler(&request, &mut channel);
                if channel.respond(request.id, result).is_err() {
                    break;
                }
            }
        });

        Self {
            mux: Arc::new(CommandMux::new(BufReader::new(host_reader), host_writer)),
            handle: Some(handle),
        }
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.mux.close_writer();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
