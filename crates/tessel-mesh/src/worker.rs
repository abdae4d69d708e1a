//! Worker: owns tiles and runs kernels over them.
//!
//! A worker is a [`ServerSocket`] plus a [`TileStore`] plus a
//! [`KernelPool`]. Cheap requests (fetch, update, destroy, ping,
//! initialize, shutdown) are answered directly on the poll thread. Kernel
//! tasks are handed to the pool, whose threads fetch remote inputs, run
//! the kernel and push the results to the target array's owners before
//! replying.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tessel_array::Extent;
use tracing::{debug, info, warn};

use crate::cluster::WorkerId;
use crate::config::Config;
use crate::error::{Error, KernelError, SchedulingError, TransportError};
use crate::kernel::{run_guarded, KernelRegistry};
use crate::peers::{Membership, PeerSet, SharedMembership};
use crate::pool::{Job, KernelPool};
use crate::protocol::{Envelope, KernelTask, Request, Response, TaskOp};
use crate::rpc::FutureGroup;
use crate::server::{Port, RequestContext, ServerSocket};
use crate::store::TileStore;

struct WorkerState {
    addr: SocketAddr,
    store: Arc<TileStore>,
    membership: SharedMembership,
    pool: Mutex<Option<KernelPool>>,
    registry: Arc<KernelRegistry>,
    shutdown: Sender<()>,
}

impl WorkerState {
    fn handle(&self, mut ctx: RequestContext) {
        let bytes = match ctx.recv() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(addr = %self.addr, "{e}");
                return;
            }
        };
        let envelope = match Envelope::<Request>::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(addr = %self.addr, "rejecting request: {e}");
                reply(&ctx, 0, Response::Error(e.into()));
                return;
            }
        };

        let id = envelope.id;
        let response = match envelope.body {
            Request::RunKernel(task) => {
                self.submit(ctx, id, task);
                return;
            }
            Request::Initialize { worker, cluster } => {
                if cluster.contains(worker) {
                    info!(%worker, workers = cluster.len(), addr = %self.addr, "initialized");
                    *self.membership.write() = Some(Membership {
                        me: worker,
                        cluster,
                    });
                    Response::Ack
                } else {
                    Response::Error(SchedulingError::UnknownWorker(worker).into())
                }
            }
            Request::Fetch {
                array,
                tile,
                region,
                sparse,
            } => match self.store.read_region(array, &tile, &region, sparse) {
                Ok(data) => Response::Tile(data),
                Err(e) => Response::Error(e),
            },
            Request::Update {
                array,
                tile,
                region,
                data,
                reducer,
                dtype,
                sparse,
            } => match self
                .store
                .apply(array, &tile, &region, &data, reducer, dtype, sparse)
            {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e),
            },
            Request::Destroy { arrays } => {
                let removed = self.store.destroy(&arrays);
                debug!(addr = %self.addr, arrays = arrays.len(), removed, "destroyed tiles");
                Response::Ack
            }
            Request::Ping(seq) => Response::Pong(seq),
            Request::Shutdown => {
                info!(addr = %self.addr, "shutdown requested");
                let _ = self.shutdown.try_send(());
                Response::Ack
            }
        };
        reply(&ctx, id, response);
    }

    fn submit(&self, ctx: RequestContext, id: u64, task: KernelTask) {
        let registry = self.registry.clone();
        let pool = self.pool.lock();
        let Some(pool) = pool.as_ref() else {
            reply(
                &ctx,
                id,
                Response::Error(TransportError::Closed("kernel pool".into()).into()),
            );
            return;
        };
        // Shared with the job so a rejected job can still be answered.
        let ctx = Arc::new(ctx);
        let job_ctx = ctx.clone();
        let job: Job = Box::new(move |peers: &PeerSet| {
            let response = run_task(&registry, peers, &task);
            reply(&job_ctx, id, response);
        });
        if let Err(e) = pool.submit(job) {
            warn!(addr = %self.addr, "rejecting kernel task {id}: {e}");
            reply(&ctx, id, Response::Error(e.into()));
        }
    }
}

fn reply(ctx: &RequestContext, id: u64, response: Response) {
    let bytes = match Envelope::new(id, response).to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("cannot encode reply {id}: {e}");
            return;
        }
    };
    if let Err(e) = ctx.send(bytes) {
        debug!("reply {id} not sent: {e}");
    }
}

fn run_task(registry: &KernelRegistry, peers: &PeerSet, task: &KernelTask) -> Response {
    match execute(registry, peers, task) {
        Ok(updates) => Response::KernelDone { updates },
        Err(e) => {
            warn!(kernel = %task.kernel, tile = %task.tile, "task failed: {e}");
            Response::Error(e)
        }
    }
}

/// Run one task on the worker owning `task.tile`. Returns the number of
/// writes pushed to the target.
fn execute(registry: &KernelRegistry, peers: &PeerSet, task: &KernelTask) -> Result<usize, Error> {
    let me = peers.me().ok_or(SchedulingError::NotInitialized)?;
    let timeout = peers.rpc_timeout();
    let failed = |extent: &Extent, message: String| -> Error {
        KernelError {
            kernel: task.kernel.clone(),
            extent: extent.clone(),
            worker: me,
            message,
        }
        .into()
    };
    let missing = || failed(&task.tile, "no kernel registered under this name".into());

    match &task.op {
        TaskOp::Map { inputs } => {
            let kernel = registry.map(&task.kernel).ok_or_else(missing)?;
            let tiles = inputs
                .iter()
                .map(|input| input.fetch(peers, &task.tile))
                .collect::<Result<Vec<_>, _>>()?;
            let out = run_guarded(|| kernel(&task.tile, &tiles, &task.kw))
                .map_err(|m| failed(&task.tile, m))?;
            task.target
                .update(peers, &task.tile, &out)?
                .wait_all(peers.event_loop(), timeout)?;
            Ok(1)
        }
        TaskOp::Outer { a, b, axes } => {
            let kernel = registry.outer(&task.kernel).ok_or_else(missing)?;
            let a_region = task.tile.change_partition_axis(axes.0);
            let a_tile = a.fetch(peers, &task.tile)?;

            let mut pending = FutureGroup::new();
            let mut updates = 0;
            let mut seen = BTreeSet::new();
            let mut run = || -> Result<(), Error> {
                for b_tile in b.tiles.keys() {
                    let b_region = b_tile.change_partition_axis(axes.1);
                    if b_region.is_empty() || !seen.insert(b_region.clone()) {
                        continue;
                    }
                    let b_data = b.fetch(peers, &b_region)?;
                    let writes =
                        run_guarded(|| kernel(&a_region, &a_tile, &b_region, &b_data, &task.kw))
                            .map_err(|m| failed(&task.tile, m))?;
                    for (extent, value) in writes {
                        pending.extend(task.target.update(peers, &extent, &value)?);
                        updates += 1;
                    }
                }
                Ok(())
            };
            let outcome = run();
            debug!(tile = %task.tile, pairs = seen.len(), updates, "outer tile dispatched");

            // Writes already issued are settled even when a later pair failed.
            let settled = pending.settle_all(peers.event_loop(), timeout);
            outcome?;
            settled?;
            Ok(updates)
        }
        TaskOp::Reduce { input, axis } => {
            let kernel = registry.reduce(&task.kernel).ok_or_else(missing)?;
            let data = input.fetch(peers, &task.tile)?;
            let out = run_guarded(|| kernel(&task.tile, &data, *axis, &task.kw))
                .map_err(|m| failed(&task.tile, m))?;
            let region = match axis {
                Some(axis) => task.tile.drop_axis(*axis),
                None => Extent::scalar(),
            };
            task.target
                .update(peers, &region, &out)?
                .wait_all(peers.event_loop(), timeout)?;
            Ok(1)
        }
    }
}

/// A running worker process (or in-process worker, in tests).
pub struct Worker {
    socket: ServerSocket,
    state: Arc<WorkerState>,
    shutdown: Receiver<()>,
}

impl Worker {
    /// Bind the worker's endpoint and start its kernel pool.
    pub fn bind(
        host: &str,
        port: Port,
        config: Config,
        registry: Arc<KernelRegistry>,
    ) -> Result<Self, Error> {
        let socket = ServerSocket::bind(host, port, &config)?;
        let store = Arc::new(TileStore::new());
        let membership: SharedMembership = Arc::new(RwLock::new(None));
        let pool = KernelPool::spawn(
            &format!("worker-{}", socket.port()),
            membership.clone(),
            store.clone(),
            &config,
        )?;
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let state = Arc::new(WorkerState {
            addr: socket.local_addr(),
            store,
            membership,
            pool: Mutex::new(Some(pool)),
            registry,
            shutdown: shutdown_tx,
        });
        let handler_state = state.clone();
        socket.register_handler(move |ctx: RequestContext| handler_state.handle(ctx));

        info!(addr = %socket.local_addr(), threads = config.kernel_threads, "worker listening");
        Ok(Self {
            socket,
            state,
            shutdown: shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// The id assigned by the coordinator, once initialized.
    pub fn id(&self) -> Option<WorkerId> {
        self.state.membership.read().as_ref().map(|m| m.me)
    }

    pub fn store(&self) -> &TileStore {
        &self.state.store
    }

    /// Block until a `Shutdown` request arrives or `timeout` passes.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.recv_timeout(timeout).is_ok()
    }

    /// Stop serving and join the poll and kernel threads.
    pub fn close(&self) {
        self.socket.close();
        let pool = self.state.pool.lock().take();
        if let Some(mut pool) = pool {
            pool.shutdown();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}
