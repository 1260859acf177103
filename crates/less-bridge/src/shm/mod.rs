//! Named shared-memory regions backed by memory-mapped files in a private temporary directory.
mod manager;
mod region;

use std::path::PathBuf;

use thiserror::Error;

pub use manager::ShmManager;
pub use region::SharedRegion;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("I/O error on shared region {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to map shared region {}: {source}", path.display())]
    Map {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Shared region size must be non-zero")]
    InvalidSize,
    #[error("Write of {len} bytes at offset {offset} exceeds region size {size}")]
    WriteOutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Read of {len} bytes at offset {offset} exceeds region size {size}")]
    ReadOutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Shared region \"{0}\" is mapped read-only")]
    ReadOnly(String),
    #[error("Shared region \"{0}\" has been destroyed")]
    Destroyed(String),
    #[error("Shared region \"{0}\" not found")]
    NotFound(String),
    #[error("Shared memory capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: usize, available: usize },
}
