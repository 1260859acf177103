//! Persistent shared-memory call protocol.
//!
//! One region holds a control block of `u32` flags plus fixed sections for preloaded
//! variables, arguments, results and error text. The host writes a request, raises
//! `requestReady` and busy-polls `responseReady`; a polling thread in the peer does the
//! mirror image. No message travels over the command stream per call.
pub mod layout;
pub mod peer;
mod preload;
mod value;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use less_flat::CodecError;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{trace, warn};

use crate::shm::{SharedRegion, ShmError, ShmManager};

pub use layout::Layout;
pub use peer::{ProtocolPeer, ProtocolRequest};
pub use preload::{PreloadedVariable, decode_preload, encode_preload};
pub use value::WireValue;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Unknown value tag {0}")]
    UnknownTag(u8),
    #[error("Malformed protocol data: {0}")]
    Malformed(String),
    #[error("Too many arguments: {count} (maximum {max})")]
    TooManyArguments { count: usize, max: usize },
    #[error("Argument index {index} out of range for a call with {count} arguments")]
    ArgumentIndex { index: usize, count: usize },
    #[error("The {section} section is full: {needed} bytes needed, {available} available")]
    SectionFull {
        section: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("Inconsistent protocol layout")]
    InconsistentLayout,
    #[error("No response from peer within {0:?}")]
    Timeout(Duration),
    #[error("Peer error: {0}")]
    Peer(String),
}

pub(crate) fn read_field(region: &SharedRegion, layout: &Layout, field: usize) -> Result<u32, ProtocolError> {
    Ok(region.read_u32(layout.control(field))?)
}

pub(crate) fn write_field(region: &SharedRegion, layout: &Layout, field: usize, value: u32) -> Result<(), ProtocolError> {
    Ok(region.write_u32(layout.control(field), value)?)
}

pub(crate) fn sync_control(region: &SharedRegion, layout: &Layout) -> Result<(), ProtocolError> {
    Ok(region.sync_range(layout.control_offset, layout.control_size)?)
}

/// Checks that `offset..offset + len` lies inside the section starting at `start`.
pub(crate) fn within(section: &'static str, offset: usize, len: usize, start: usize, size: usize) -> Result<(), ProtocolError> {
    let inside = offset >= start && offset.checked_add(len).is_some_and(|end| end <= start + size);
    if inside {
        Ok(())
    } else {
        Err(ProtocolError::Malformed(format!(
            "{section} range {offset}+{len} outside {start}+{size}"
        )))
    }
}

fn to_u32(value: usize) -> Result<u32, ProtocolError> {
    Ok(less_flat::io::to_u32(value)?)
}

/// Host end of the protocol.
pub struct BinaryProtocol {
    region: Arc<SharedRegion>,
    layout: Layout,
    arg_count: usize,
    arg_cursor: usize,
    functions: FxHashMap<String, u32>,
    timeout: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for BinaryProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryProtocol")
            .field("region", &self.region)
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl BinaryProtocol {
    /// Allocates a region sized for the default layout.
    pub fn create(manager: &ShmManager, timeout: Duration, poll_interval: Duration) -> Result<Self, ProtocolError> {
        let layout = Layout::default();
        let region = manager.create(layout.total_size)?;
        Self::new(region, layout, timeout, poll_interval)
    }

    pub fn new(
        region: Arc<SharedRegion>,
        layout: Layout,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ProtocolError> {
        if !layout.is_consistent() || region.size() < layout.total_size {
            return Err(ProtocolError::InconsistentLayout);
        }
        Ok(Self {
            region,
            layout,
            arg_count: 0,
            arg_cursor: 0,
            functions: FxHashMap::default(),
            timeout,
            poll_interval,
        })
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Assigns a numeric id to `name`. The flag is `true` the first time a name is seen.
    pub fn register_function(&mut self, name: &str) -> (u32, bool) {
        if let Some(id) = self.functions.get(name) {
            return (*id, false);
        }
        let id = self.functions.len() as u32 + 1;
        self.functions.insert(name.to_string(), id);
        (id, true)
    }

    pub fn function_id(&self, name: &str) -> Option<u32> {
        self.functions.get(name).copied()
    }

    /// Forgets `name` so the next [`BinaryProtocol::register_function`] reports it as new.
    ///
    /// Ids are never reused.
    pub fn unregister_function(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    /// Resets the control block for a new call.
    pub fn prepare_call(&mut self, function_id: u32, arg_count: usize) -> Result<(), ProtocolError> {
        let fields = self.layout.fields;
        if arg_count > fields.max_args {
            return Err(ProtocolError::TooManyArguments {
                count: arg_count,
                max: fields.max_args,
            });
        }

        for field in [
            fields.request_ready,
            fields.response_ready,
            fields.error_flag,
            fields.result_offset,
            fields.result_size,
        ] {
            self.set(field, 0)?;
        }
        self.set(fields.function_id, function_id)?;
        self.set(fields.arg_count, to_u32(arg_count)?)?;
        for index in 0..fields.max_args {
            self.region.write_u32(self.layout.arg_offset_slot(index), 0)?;
        }

        self.arg_count = arg_count;
        self.arg_cursor = 0;
        Ok(())
    }

    pub fn write_arg(&mut self, index: usize, value: &WireValue) -> Result<(), ProtocolError> {
        if index >= self.arg_count {
            return Err(ProtocolError::ArgumentIndex {
                index,
                count: self.arg_count,
            });
        }

        let bytes = value.to_bytes()?;
        let available = self.layout.args_size - self.arg_cursor;
        if bytes.len() > available {
            return Err(ProtocolError::SectionFull {
                section: "arguments",
                needed: bytes.len(),
                available,
            });
        }

        let offset = self.layout.args_offset + self.arg_cursor;
        self.region.write(offset, &bytes)?;
        self.region.write_u32(self.layout.arg_offset_slot(index), to_u32(offset)?)?;
        self.arg_cursor += bytes.len();
        Ok(())
    }

    pub fn signal_request(&self) -> Result<(), ProtocolError> {
        if self.arg_cursor > 0 {
            self.region.sync_range(self.layout.args_offset, self.arg_cursor)?;
        }
        self.set(self.layout.fields.request_ready, 1)?;
        sync_control(&self.region, &self.layout)
    }

    /// Busy-polls `responseReady`, sleeping `poll_interval` between checks.
    pub fn wait_for_response(&self, timeout: Option<Duration>) -> Result<(), ProtocolError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let deadline = Instant::now() + timeout;
        loop {
            sync_control(&self.region, &self.layout)?;
            if self.get(self.layout.fields.response_ready)? == 1 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout(timeout));
            }
            thread::sleep(self.poll_interval);
        }
    }

    pub fn read_result(&self) -> Result<WireValue, ProtocolError> {
        let fields = self.layout.fields;
        if self.get(fields.error_flag)? == 1 {
            let offset = self.get(fields.error_offset)? as usize;
            let size = self.get(fields.error_size)? as usize;
            within("error", offset, size, self.layout.error_offset, self.layout.error_size)?;
            let message = self
                .region
                .view(offset, size, |bytes| String::from_utf8_lossy(bytes).into_owned())?;
            return Err(ProtocolError::Peer(message));
        }

        let offset = self.get(fields.result_offset)? as usize;
        let size = self.get(fields.result_size)? as usize;
        within("result", offset, size, self.layout.results_offset, self.layout.results_size)?;
        self.region.view(offset, size, WireValue::from_bytes)?
    }

    pub fn clear_response(&self) -> Result<(), ProtocolError> {
        self.set(self.layout.fields.request_ready, 0)?;
        self.set(self.layout.fields.response_ready, 0)?;
        sync_control(&self.region, &self.layout)
    }

    /// Runs a complete call and always leaves the ready flags cleared.
    pub fn call(&mut self, function_id: u32, args: &[WireValue]) -> Result<WireValue, ProtocolError> {
        self.stage_call(function_id, args)?;
        self.finish_call()
    }

    /// Prepares the control block and writes every argument. The peer sees nothing until
    /// [`finish_call`](Self::finish_call) raises `requestReady`.
    pub fn stage_call(&mut self, function_id: u32, args: &[WireValue]) -> Result<(), ProtocolError> {
        self.prepare_call(function_id, args.len())?;
        for (index, arg) in args.iter().enumerate() {
            self.write_arg(index, arg)?;
        }
        Ok(())
    }

    /// Signals a staged request and waits for its result.
    pub fn finish_call(&self) -> Result<WireValue, ProtocolError> {
        self.signal_request()?;
        trace!(args = self.arg_count, "Signalled protocol request");

        let outcome = self.wait_for_response(None).and_then(|()| self.read_result());
        if let Err(e) = self.clear_response() {
            warn!(error = %e, "Failed to clear protocol response flags");
        }
        outcome
    }

    /// Replaces the preload section with `vars`.
    pub fn preload(&self, vars: &[PreloadedVariable]) -> Result<(), ProtocolError> {
        let bytes = encode_preload(vars)?;
        if bytes.len() > self.layout.preload_size {
            return Err(ProtocolError::SectionFull {
                section: "preload",
                needed: bytes.len(),
                available: self.layout.preload_size,
            });
        }
        self.region.write(self.layout.preload_offset, &bytes)?;
        self.region.sync_range(self.layout.preload_offset, bytes.len())?;
        Ok(())
    }

    pub fn read_preloaded(&self) -> Result<Vec<PreloadedVariable>, ProtocolError> {
        self.region
            .view(self.layout.preload_offset, self.layout.preload_size, decode_preload)?
    }

    pub fn peer_ready(&self) -> Result<bool, ProtocolError> {
        sync_control(&self.region, &self.layout)?;
        Ok(self.get(self.layout.fields.peer_ready)? == 1)
    }

    pub fn request_shutdown(&self) -> Result<(), ProtocolError> {
        self.set(self.layout.fields.shutdown, 1)?;
        sync_control(&self.region, &self.layout)
    }

    fn get(&self, field: usize) -> Result<u32, ProtocolError> {
        read_field(&self.region, &self.layout, field)
    }

    fn set(&self, field: usize, value: u32) -> Result<(), ProtocolError> {
        write_field(&self.region, &self.layout, field, value)
    }
}
