//! tessel-mesh: distributed evaluation of tiled array expressions.
//!
//! One coordinator and N workers. Arrays are cut into tiles, each owned by
//! one worker. The coordinator builds a lazy [`ArrayGraph`] and the
//! [`Engine`] turns each node into per-tile kernel tasks sent to the tiles'
//! owners. Workers fetch whatever other tiles a kernel needs and push its
//! results to the target array's owners, where overlapping writes are
//! folded with the target's reducer.
//!
//! # Architecture
//!
//! ```text
//! Coordinator                           Workers
//! ┌────────────┐   RunKernel(task)   ┌──────────────┐
//! │ ArrayGraph │ ──────────────────→ │ poll thread  │
//! │   Engine   │                     │   ↓          │
//! │ EventLoop  │ ←────────────────── │ kernel pool  │ ←─ Fetch/Update ─→ peers
//! └────────────┘    KernelDone       │ TileStore    │
//!                                    └──────────────┘
//! ```
//!
//! Workers serve a router-style [`ServerSocket`] driven by one poll thread.
//! Everything that sends requests (the coordinator, every kernel thread)
//! owns an [`EventLoop`] and drives its [`ClientSocket`]s from that thread.
//!
//! # Quick start
//!
//! ```ignore
//! use tessel_mesh::{ArrayGraph, Cluster, Config, Coordinator, Engine, Kwargs};
//! use tessel_array::ReduceOp;
//!
//! let cluster = Cluster::builder()
//!     .worker("10.0.0.1", 9000, 4)
//!     .worker("10.0.0.2", 9000, 4)
//!     .build();
//! let mut engine = Engine::new(Coordinator::connect(Config::default(), cluster)?);
//!
//! let mut graph = ArrayGraph::new();
//! let x = graph.arange(&[1000], 0.0, 1.0)?;
//! let y = graph.outer(x, x, (0, 0), "outer_dot", Kwargs::new(), vec![1000], None, ReduceOp::Sum)?;
//! let result = engine.evaluate(&graph, y)?;
//! let values = engine.coordinator().glom(&result)?;
//! ```

pub mod array;
pub mod client;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod expr;
pub mod frame;
pub mod kernel;
pub mod peers;
pub mod placement;
pub mod poll;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod store;
pub mod worker;

// Re-exports
pub use array::{ArrayId, DistArray};
pub use client::{ClientEvent, ClientSocket, EventLoop};
pub use cluster::{Cluster, ClusterBuilder, WorkerId, WorkerSpec};
pub use config::{AssignMode, Config};
pub use coordinator::Coordinator;
pub use engine::{Engine, NodeState};
pub use error::{Error, KernelError, ProtocolError, SchedulingError, TransportError};
pub use expr::{ArrayExpr, ArrayGraph, ExprId};
pub use frame::{FrameCodec, Group};
pub use kernel::{KernelRegistry, KwValue, Kwargs, MapKernel, OuterKernel, ReduceKernel};
pub use placement::Placement;
pub use protocol::{Envelope, KernelTask, Request, Response, TaskOp, PROTOCOL_VERSION};
pub use rpc::{Future, FutureGroup, RpcClient};
pub use server::{Port, RequestContext, ServerSocket};
pub use store::TileStore;
pub use worker::Worker;
