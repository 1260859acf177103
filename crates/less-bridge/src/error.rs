use less_flat::CodecError;
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::host::HostError;
use crate::mux::MuxError;
use crate::peer::PeerError;
use crate::protocol::ProtocolError;
use crate::shm::ShmError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub type Result<T> = std::result::Result<T, Error>;
