//! Error types for tessel-mesh.
//!
//! Errors carry strings rather than source errors so they are `Clone` (one
//! dropped connection fails every future waiting on it) and serialisable
//! (a worker reports failures back to the coordinator as-is).

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use tessel_array::{Extent, ExtentError, TileError};

use crate::cluster::WorkerId;

/// Socket-level failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    /// Could not bind a server endpoint (port in use, bad host).
    Bind { addr: String, reason: String },
    /// Could not reach a peer.
    Connect { addr: String, reason: String },
    /// The socket or connection has been closed.
    Closed(String),
    /// I/O failure on an established connection.
    Io(String),
    /// A reply did not arrive in time.
    Timeout(String),
}

/// Violations of the message protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    /// A request payload was read twice.
    AlreadyConsumed,
    /// A multi-frame message had the wrong structure.
    MalformedGroup(String),
    /// Peer speaks a different wire version.
    VersionMismatch { expected: u32, got: u32 },
    /// Payload could not be encoded or decoded.
    Serde(String),
    /// A reply of the wrong kind for its request.
    UnexpectedResponse(String),
}

/// A user kernel failed while processing one tile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelError {
    pub kernel: String,
    pub extent: Extent,
    pub worker: WorkerId,
    pub message: String,
}

/// Placement and shape bookkeeping failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingError {
    /// A tile names a worker the cluster does not have.
    UnknownOwner { extent: Extent, worker: WorkerId },
    /// A worker id outside the cluster.
    UnknownWorker(WorkerId),
    /// A write or input does not match the shape computed for it.
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    /// A region does not line up with the array's tiles.
    InvalidRegion(String),
    /// No expression node with this id.
    UnknownNode(u32),
    /// The cluster is empty.
    NoWorkers,
    /// A worker was asked to act before it was initialised.
    NotInitialized,
}

/// Any failure surfaced by the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    Transport(TransportError),
    Protocol(ProtocolError),
    Kernel(KernelError),
    Scheduling(SchedulingError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, reason } => write!(f, "failed to bind {addr}: {reason}"),
            Self::Connect { addr, reason } => write!(f, "failed to connect to {addr}: {reason}"),
            Self::Closed(what) => write!(f, "{what} is closed"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
            Self::Timeout(what) => write!(f, "timed out waiting for {what}"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyConsumed => write!(f, "request payload already consumed"),
            Self::MalformedGroup(msg) => write!(f, "malformed message: {msg}"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "protocol version mismatch: expected {expected}, got {got}")
            }
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
            Self::UnexpectedResponse(msg) => write!(f, "unexpected response: {msg}"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kernel `{}` failed on {} at {}: {}",
            self.kernel, self.worker, self.extent, self.message
        )
    }
}

impl fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOwner { extent, worker } => {
                write!(f, "tile {extent} is owned by unknown {worker}")
            }
            Self::UnknownWorker(worker) => write!(f, "{worker} is not part of the cluster"),
            Self::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {expected:?}, got {got:?}")
            }
            Self::InvalidRegion(msg) => write!(f, "invalid region: {msg}"),
            Self::UnknownNode(id) => write!(f, "no expression node e{id}"),
            Self::NoWorkers => write!(f, "no workers available"),
            Self::NotInitialized => write!(f, "worker has not been initialized"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Kernel(e) => write!(f, "{e}"),
            Self::Scheduling(e) => write!(f, "scheduling error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}
impl std::error::Error for ProtocolError {}
impl std::error::Error for KernelError {}
impl std::error::Error for SchedulingError {}
impl std::error::Error for Error {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<postcard::Error> for ProtocolError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<ExtentError> for SchedulingError {
    fn from(e: ExtentError) -> Self {
        Self::InvalidRegion(e.to_string())
    }
}

impl From<TileError> for SchedulingError {
    fn from(e: TileError) -> Self {
        Self::InvalidRegion(e.to_string())
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<KernelError> for Error {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

impl From<SchedulingError> for Error {
    fn from(e: SchedulingError) -> Self {
        Self::Scheduling(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(e.into())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Protocol(e.into())
    }
}

impl From<ExtentError> for Error {
    fn from(e: ExtentError) -> Self {
        Self::Scheduling(e.into())
    }
}

impl From<TileError> for Error {
    fn from(e: TileError) -> Self {
        Self::Scheduling(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_names_tile_and_worker() {
        let err = Error::from(KernelError {
            kernel: "outer_dot".into(),
            extent: Extent::new(vec![5], vec![10], vec![10]).unwrap(),
            worker: WorkerId(1),
            message: "boom".into(),
        });
        let text = err.to_string();
        assert!(text.contains("outer_dot"));
        assert!(text.contains("worker-1"));
        assert!(text.contains("5:10"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn errors_survive_the_wire() {
        let err = Error::Protocol(ProtocolError::VersionMismatch { expected: 1, got: 7 });
        let bytes = postcard::to_allocvec(&err).unwrap();
        let back: Error = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn io_errors_map_to_transport() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, Error::Transport(TransportError::Io(_))));
    }
}
