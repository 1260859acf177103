use serde::{Deserialize, Serialize};

pub const CONTROL_SIZE: usize = 4 * 1024;
pub const PRELOAD_SIZE: usize = 1024 * 1024;
pub const ARGS_SIZE: usize = 1024 * 1024;
pub const RESULTS_SIZE: usize = 1024 * 1024;
pub const ERROR_SIZE: usize = 64 * 1024;
pub const MAX_ARGS: usize = 16;

/// Byte offsets of the control-block fields. Every field is a little-endian `u32`.
pub mod field {
    pub const REQUEST_READY: usize = 0;
    pub const RESPONSE_READY: usize = 4;
    pub const FUNCTION_ID: usize = 8;
    pub const ARG_COUNT: usize = 12;
    pub const ARG_OFFSETS: usize = 16;
    pub const RESULT_OFFSET: usize = 80;
    pub const RESULT_SIZE: usize = 84;
    pub const ERROR_FLAG: usize = 88;
    pub const ERROR_OFFSET: usize = 92;
    pub const ERROR_SIZE: usize = 96;
    pub const SHUTDOWN: usize = 100;
    pub const PEER_READY: usize = 104;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFields {
    pub request_ready: usize,
    pub response_ready: usize,
    pub function_id: usize,
    pub arg_count: usize,
    pub arg_offsets: usize,
    pub max_args: usize,
    pub result_offset: usize,
    pub result_size: usize,
    pub error_flag: usize,
    pub error_offset: usize,
    pub error_size: usize,
    pub shutdown: usize,
    pub peer_ready: usize,
}

impl Default for ControlFields {
    fn default() -> Self {
        Self {
            request_ready: field::REQUEST_READY,
            response_ready: field::RESPONSE_READY,
            function_id: field::FUNCTION_ID,
            arg_count: field::ARG_COUNT,
            arg_offsets: field::ARG_OFFSETS,
            max_args: MAX_ARGS,
            result_offset: field::RESULT_OFFSET,
            result_size: field::RESULT_SIZE,
            error_flag: field::ERROR_FLAG,
            error_offset: field::ERROR_OFFSET,
            error_size: field::ERROR_SIZE,
            shutdown: field::SHUTDOWN,
            peer_ready: field::PEER_READY,
        }
    }
}

/// Where each section of the protocol region lives. Sent to the peer once at initialization
/// so neither side hard-codes offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layout {
    pub control_offset: usize,
    pub control_size: usize,
    pub preload_offset: usize,
    pub preload_size: usize,
    pub args_offset: usize,
    pub args_size: usize,
    pub results_offset: usize,
    pub results_size: usize,
    pub error_offset: usize,
    pub error_size: usize,
    pub total_size: usize,
    pub fields: ControlFields,
}

impl Default for Layout {
    fn default() -> Self {
        let control_offset = 0;
        let preload_offset = control_offset + CONTROL_SIZE;
        let args_offset = preload_offset + PRELOAD_SIZE;
        let results_offset = args_offset + ARGS_SIZE;
        let error_offset = results_offset + RESULTS_SIZE;
        Self {
            control_offset,
            control_size: CONTROL_SIZE,
            preload_offset,
            preload_size: PRELOAD_SIZE,
            args_offset,
            args_size: ARGS_SIZE,
            results_offset,
            results_size: RESULTS_SIZE,
            error_offset,
            error_size: ERROR_SIZE,
            total_size: error_offset + ERROR_SIZE,
            fields: ControlFields::default(),
        }
    }
}

impl Layout {
    /// Absolute offset of a control-block field.
    #[inline]
    pub fn control(&self, field: usize) -> usize {
        self.control_offset + field
    }

    /// Absolute offset of the `index`th argument-offset slot.
    #[inline]
    pub fn arg_offset_slot(&self, index: usize) -> usize {
        self.control(self.fields.arg_offsets) + index * 4
    }

    /// Checks that every section fits inside `total_size` and that sections do not overlap.
    pub fn is_consistent(&self) -> bool {
        let sections = [
            (self.control_offset, self.control_size),
            (self.preload_offset, self.preload_size),
            (self.args_offset, self.args_size),
            (self.results_offset, self.results_size),
            (self.error_offset, self.error_size),
        ];
        let fits = sections
            .iter()
            .all(|(offset, size)| offset.checked_add(*size).is_some_and(|end| end <= self.total_size));
        let mut sorted = sections.to_vec();
        sorted.sort_unstable();
        let disjoint = sorted.windows(2).all(|w| w[0].0.saturating_add(w[0].1) <= w[1].0);
        let control_fits = self.fields.peer_ready.saturating_add(4) <= self.control_size
            && self.fields.arg_offsets.saturating_add(self.fields.max_args.saturating_mul(4)) <= self.control_size;
        fits && disjoint && control_fits
    }
}
