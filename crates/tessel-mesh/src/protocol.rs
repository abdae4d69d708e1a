//! Wire protocol between coordinator and workers.
//!
//! Every message is an [`Envelope`] encoded with postcard. The version is
//! the first field and is checked before the body is decoded, so a peer
//! on another wire version is reported as such rather than as garbage.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessel_array::{DType, Extent, ReduceOp, Tile};

use crate::array::{ArrayId, DistArray};
use crate::cluster::{Cluster, WorkerId};
use crate::error::{Error, ProtocolError};
use crate::kernel::Kwargs;

/// Protocol version. Incremented on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request id plus body, tagged with the protocol version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub id: u64,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: u64, body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            body,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (version, _) = postcard::take_from_bytes::<u32>(bytes)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Operations a worker performs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Tell a worker who it is and who its peers are.
    Initialize { worker: WorkerId, cluster: Cluster },
    /// Read `region` (global coordinates) out of the tile keyed by `tile`.
    Fetch {
        array: ArrayId,
        tile: Extent,
        region: Extent,
        sparse: bool,
    },
    /// Combine `data` into `region` of the tile keyed by `tile`.
    Update {
        array: ArrayId,
        tile: Extent,
        region: Extent,
        data: Tile,
        reducer: ReduceOp,
        dtype: DType,
        sparse: bool,
    },
    /// Run a kernel over one locally owned tile.
    RunKernel(KernelTask),
    /// Drop every tile of these arrays.
    Destroy { arrays: Vec<ArrayId> },
    Ping(u64),
    Shutdown,
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Initialize { .. } => "initialize",
            Request::Fetch { .. } => "fetch",
            Request::Update { .. } => "update",
            Request::RunKernel(_) => "run_kernel",
            Request::Destroy { .. } => "destroy",
            Request::Ping(_) => "ping",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Worker replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Tile(Tile),
    /// A kernel task finished; `updates` writes were applied to the target.
    KernelDone { updates: usize },
    Pong(u64),
    Error(Error),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Tile(_) => "tile",
            Response::KernelDone { .. } => "kernel_done",
            Response::Pong(_) => "pong",
            Response::Error(_) => "error",
        }
    }

    fn unexpected(self, wanted: &str) -> Error {
        match self {
            Response::Error(e) => e,
            other => ProtocolError::UnexpectedResponse(format!(
                "wanted {wanted}, got {}",
                other.kind()
            ))
            .into(),
        }
    }

    pub fn into_ack(self) -> Result<(), Error> {
        match self {
            Response::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }

    pub fn into_tile(self) -> Result<Tile, Error> {
        match self {
            Response::Tile(tile) => Ok(tile),
            other => Err(other.unexpected("tile")),
        }
    }

    pub fn into_kernel_done(self) -> Result<usize, Error> {
        match self {
            Response::KernelDone { updates } => Ok(updates),
            other => Err(other.unexpected("kernel_done")),
        }
    }

    pub fn into_pong(self) -> Result<u64, Error> {
        match self {
            Response::Pong(seq) => Ok(seq),
            other => Err(other.unexpected("pong")),
        }
    }
}

/// One tile's worth of kernel work, executed by the tile's owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelTask {
    /// The source tile this task covers.
    pub tile: Extent,
    /// Registered kernel name.
    pub kernel: String,
    pub kw: Kwargs,
    pub op: TaskOp,
    /// Array receiving the kernel's output.
    pub target: DistArray,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskOp {
    /// Same region of every input, one output tile at that region.
    Map { inputs: Vec<DistArray> },
    /// `a`'s tile against every distinct re-partitioned tile of `b`.
    Outer {
        a: DistArray,
        b: DistArray,
        axes: (usize, usize),
    },
    /// Partial reduction of one tile, combined at the reduced extent.
    Reduce {
        input: DistArray,
        axis: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(
            7,
            Request::Destroy {
                arrays: vec![ArrayId(1), ArrayId(2)],
            },
        );
        let bytes = env.to_bytes().unwrap();
        let back: Envelope<Request> = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn version_mismatch_is_detected_before_body() {
        let mut env = Envelope::new(1, Response::Pong(3));
        env.version = PROTOCOL_VERSION + 1;
        let bytes = env.to_bytes().unwrap();
        let err = Envelope::<Response>::from_bytes(&bytes).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: PROTOCOL_VERSION + 1
            }
        );
    }

    #[test]
    fn error_replies_unwrap_to_the_remote_error() {
        let remote: Error = TransportError::Closed("x".into()).into();
        assert_eq!(Response::Error(remote.clone()).into_ack(), Err(remote));
        let err = Response::Pong(1).into_tile().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedResponse(_))
        ));
    }
}
