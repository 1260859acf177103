use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::{
    Layout, PreloadedVariable, ProtocolError, WireValue, decode_preload, read_field, sync_control, to_u32, within,
    write_field,
};
use crate::shm::SharedRegion;

/// A request picked up from the control block.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRequest {
    pub function_id: u32,
    pub args: Vec<WireValue>,
}

/// Peer end of the protocol: attaches to the host's region and serves requests from a polling loop.
pub struct ProtocolPeer {
    region: SharedRegion,
    layout: Layout,
}

impl ProtocolPeer {
    pub fn attach(path: impl AsRef<Path>, layout: Layout) -> Result<Self, ProtocolError> {
        let region = SharedRegion::attach(path)?;
        if !layout.is_consistent() || region.size() < layout.total_size {
            return Err(ProtocolError::InconsistentLayout);
        }
        Ok(Self { region, layout })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn mark_ready(&self) -> Result<(), ProtocolError> {
        write_field(&self.region, &self.layout, self.layout.fields.peer_ready, 1)?;
        sync_control(&self.region, &self.layout)
    }

    pub fn shutdown_requested(&self) -> Result<bool, ProtocolError> {
        sync_control(&self.region, &self.layout)?;
        Ok(read_field(&self.region, &self.layout, self.layout.fields.shutdown)? == 1)
    }

    /// Takes the pending request, if any, and clears `requestReady`.
    pub fn poll_request(&self) -> Result<Option<ProtocolRequest>, ProtocolError> {
        let fields = self.layout.fields;
        sync_control(&self.region, &self.layout)?;
        if read_field(&self.region, &self.layout, fields.request_ready)? != 1 {
            return Ok(None);
        }

        let function_id = read_field(&self.region, &self.layout, fields.function_id)?;
        let arg_count = read_field(&self.region, &self.layout, fields.arg_count)? as usize;
        let outcome = if arg_count > fields.max_args {
            Err(ProtocolError::TooManyArguments {
                count: arg_count,
                max: fields.max_args,
            })
        } else {
            (0..arg_count).map(|index| self.read_arg(index)).collect()
        };
        write_field(&self.region, &self.layout, fields.request_ready, 0)?;

        Ok(Some(ProtocolRequest {
            function_id,
            args: outcome?,
        }))
    }

    /// Polls until a request arrives. Returns `None` on timeout or when the host asks to shut down.
    pub fn wait_request(&self, timeout: Duration, poll_interval: Duration) -> Result<Option<ProtocolRequest>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(request) = self.poll_request()? {
                return Ok(Some(request));
            }
            if self.shutdown_requested()? || Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(poll_interval);
        }
    }

    pub fn respond(&self, value: &WireValue) -> Result<(), ProtocolError> {
        let bytes = value.to_bytes()?;
        if bytes.len() > self.layout.results_size {
            return self.respond_error(&format!(
                "result of {} bytes exceeds the {} byte result section",
                bytes.len(),
                self.layout.results_size
            ));
        }

        let fields = self.layout.fields;
        self.region.write(self.layout.results_offset, &bytes)?;
        self.region.sync_range(self.layout.results_offset, bytes.len().max(1))?;
        write_field(&self.region, &self.layout, fields.result_offset, to_u32(self.layout.results_offset)?)?;
        write_field(&self.region, &self.layout, fields.result_size, to_u32(bytes.len())?)?;
        write_field(&self.region, &self.layout, fields.error_flag, 0)?;
        self.signal_response()
    }

    /// Reports a failure; messages longer than the error section are truncated.
    pub fn respond_error(&self, message: &str) -> Result<(), ProtocolError> {
        let fields = self.layout.fields;
        let bytes = &message.as_bytes()[..message.len().min(self.layout.error_size)];
        self.region.write(self.layout.error_offset, bytes)?;
        write_field(&self.region, &self.layout, fields.error_offset, to_u32(self.layout.error_offset)?)?;
        write_field(&self.region, &self.layout, fields.error_size, to_u32(bytes.len())?)?;
        write_field(&self.region, &self.layout, fields.error_flag, 1)?;
        self.signal_response()
    }

    pub fn preloaded(&self) -> Result<Vec<PreloadedVariable>, ProtocolError> {
        self.region
            .view(self.layout.preload_offset, self.layout.preload_size, decode_preload)?
    }

    fn read_arg(&self, index: usize) -> Result<WireValue, ProtocolError> {
        let offset = self.region.read_u32(self.layout.arg_offset_slot(index))? as usize;
        let end = self.layout.args_offset + self.layout.args_size;
        within("argument", offset, 1, self.layout.args_offset, self.layout.args_size)?;
        self.region.view(offset, end - offset, WireValue::from_bytes)?
    }

    fn signal_response(&self) -> Result<(), ProtocolError> {
        write_field(&self.region, &self.layout, self.layout.fields.response_ready, 1)?;
        sync_control(&self.region, &self.layout)
    }
}
