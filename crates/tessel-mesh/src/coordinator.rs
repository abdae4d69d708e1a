//! Coordinator: the master side of a cluster.
//!
//! The coordinator connects to every worker from the calling thread's
//! event loop, tells each worker who it is, creates arrays, moves data in
//! and out of them and dispatches kernel tasks. It owns no tiles itself.

use std::cell::Cell;
use std::collections::BTreeSet;

use tessel_array::{DType, ReduceOp, Tile};
use tracing::{debug, info};

use crate::array::{ArrayId, DistArray};
use crate::cluster::{Cluster, WorkerId};
use crate::config::Config;
use crate::error::{Error, ProtocolError, SchedulingError};
use crate::peers::PeerSet;
use crate::placement::Placement;
use crate::protocol::{KernelTask, Request, Response};
use crate::rpc::{Future, FutureGroup};

pub struct Coordinator {
    cluster: Cluster,
    config: Config,
    peers: PeerSet,
    next_array: Cell<u64>,
    next_ping: Cell<u64>,
}

impl Coordinator {
    /// Connect to every worker in `cluster` and initialize it.
    pub fn connect(config: Config, cluster: Cluster) -> Result<Self, Error> {
        if cluster.is_empty() {
            return Err(SchedulingError::NoWorkers.into());
        }
        let peers = PeerSet::coordinator(cluster.clone(), config.clone())?;
        let coordinator = Self {
            cluster,
            config,
            peers,
            next_array: Cell::new(1),
            next_ping: Cell::new(1),
        };

        let workers: Vec<WorkerId> = coordinator.cluster.ids().collect();
        let init = coordinator.broadcast(
            workers,
            |worker| Request::Initialize {
                worker,
                cluster: coordinator.cluster.clone(),
            },
            Response::into_ack,
        );
        coordinator.wait(init)?;
        info!(
            workers = coordinator.cluster.len(),
            slots = coordinator.cluster.total_slots(),
            "coordinator connected"
        );
        Ok(coordinator)
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    fn next_id(&self) -> ArrayId {
        let id = self.next_array.get();
        self.next_array.set(id + 1);
        ArrayId(id)
    }

    fn broadcast<T>(
        &self,
        workers: impl IntoIterator<Item = WorkerId>,
        request: impl Fn(WorkerId) -> Request,
        map: fn(Response) -> Result<T, Error>,
    ) -> FutureGroup<T> {
        workers
            .into_iter()
            .map(|worker| match self.peers.client(worker) {
                Ok(client) => client.call_map(request(worker), map),
                Err(e) => Future::failed(e),
            })
            .collect()
    }

    /// Wait for a group of replies with the configured timeout.
    pub fn wait<T>(&self, group: FutureGroup<T>) -> Result<Vec<T>, Error> {
        group.wait_all(self.peers.event_loop(), self.config.rpc_timeout)
    }

    /// Wait for every reply before reporting, so nothing issued from
    /// `group` is still writing when an error comes back.
    pub fn settle<T>(&self, group: FutureGroup<T>) -> Result<Vec<T>, Error> {
        group.settle_all(self.peers.event_loop(), self.config.rpc_timeout)
    }

    /// Create an empty array placed according to the configured assign mode.
    pub fn create_array(
        &self,
        shape: &[usize],
        dtype: DType,
        sparse: bool,
        reducer: ReduceOp,
        tile_hint: Option<&[usize]>,
    ) -> Result<DistArray, Error> {
        let plan = Placement::plan(shape, tile_hint, &self.cluster, self.config.assign_mode)?;
        let array = DistArray::new(self.next_id(), shape.to_vec(), dtype, sparse, reducer, plan.tiles)?;
        debug!(array = %array.id, ?shape, tiles = array.tiles.len(), "created array");
        Ok(array)
    }

    /// Create an empty array tiled and owned exactly like `template`.
    pub fn create_like(
        &self,
        template: &DistArray,
        dtype: DType,
        sparse: bool,
        reducer: ReduceOp,
    ) -> Result<DistArray, Error> {
        let array = DistArray::new(
            self.next_id(),
            template.shape.clone(),
            dtype,
            sparse,
            reducer,
            template.tiles.clone(),
        )?;
        debug!(array = %array.id, like = %template.id, "created array");
        Ok(array)
    }

    /// Write a whole array's worth of data, combined with its reducer.
    pub fn scatter(&self, array: &DistArray, data: &Tile) -> Result<(), Error> {
        let writes = array.update(&self.peers, &array.full_extent(), data)?;
        self.wait(writes)?;
        Ok(())
    }

    /// Gather a whole array.
    pub fn glom(&self, array: &DistArray) -> Result<Tile, Error> {
        array.fetch(&self.peers, &array.full_extent())
    }

    /// Drop the tiles of `arrays` on every worker that owns any of them.
    pub fn destroy(&self, arrays: &[&DistArray]) -> Result<(), Error> {
        if arrays.is_empty() {
            return Ok(());
        }
        let ids: Vec<ArrayId> = arrays.iter().map(|a| a.id).collect();
        let owners: BTreeSet<WorkerId> = arrays.iter().flat_map(|a| a.owners()).collect();
        let done = self.broadcast(
            owners,
            |_| Request::Destroy { arrays: ids.clone() },
            Response::into_ack,
        );
        self.wait(done)?;
        debug!(?ids, "destroyed arrays");
        Ok(())
    }

    /// Send kernel tasks without waiting for them.
    pub fn issue(&self, tasks: Vec<(WorkerId, KernelTask)>) -> FutureGroup<usize> {
        tasks
            .into_iter()
            .map(|(worker, task)| match self.peers.client(worker) {
                Ok(client) => client.call_map(Request::RunKernel(task), Response::into_kernel_done),
                Err(e) => Future::failed(e),
            })
            .collect()
    }

    /// Run kernel tasks and wait for all of them to finish. Returns the
    /// total number of writes they made.
    pub fn dispatch(&self, tasks: Vec<(WorkerId, KernelTask)>) -> Result<usize, Error> {
        let done = self.issue(tasks);
        Ok(self.settle(done)?.into_iter().sum())
    }

    /// Round-trip a ping through every worker.
    pub fn ping_all(&self) -> Result<(), Error> {
        let seq = self.next_ping.get();
        self.next_ping.set(seq + 1);
        let pongs = self.broadcast(self.cluster.ids(), |_| Request::Ping(seq), Response::into_pong);
        for pong in self.wait(pongs)? {
            if pong != seq {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "pong {pong} for ping {seq}"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Ask every worker to shut down.
    pub fn shutdown_all(&self) -> Result<(), Error> {
        let acks = self.broadcast(self.cluster.ids(), |_| Request::Shutdown, Response::into_ack);
        self.wait(acks)?;
        info!(workers = self.cluster.len(), "workers told to shut down");
        Ok(())
    }
}
