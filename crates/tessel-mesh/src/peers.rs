//! Per-thread view of the cluster: who we are, where our tiles live and
//! cached connections to everyone else.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::client::EventLoop;
use crate::cluster::{Cluster, WorkerId, WorkerSpec};
use crate::config::Config;
use crate::error::{Error, SchedulingError};
use crate::rpc::RpcClient;
use crate::store::TileStore;

/// A worker's identity, learned from the coordinator's `Initialize`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub me: WorkerId,
    pub cluster: Cluster,
}

/// Membership shared between a worker's poll thread and its kernel pool.
pub type SharedMembership = Arc<RwLock<Option<Membership>>>;

enum Directory {
    /// The coordinator knows the cluster up front and owns no tiles.
    Coordinator(Cluster),
    Worker(SharedMembership),
}

/// Everything a thread needs to read and write distributed arrays.
///
/// Not `Send`: it owns the thread's [`EventLoop`] and the connections
/// created on it.
pub struct PeerSet {
    directory: Directory,
    store: Option<Arc<TileStore>>,
    event_loop: EventLoop,
    clients: RefCell<HashMap<WorkerId, Rc<RpcClient>>>,
    config: Config,
}

impl PeerSet {
    pub fn coordinator(cluster: Cluster, config: Config) -> Result<Self, Error> {
        Ok(Self {
            directory: Directory::Coordinator(cluster),
            store: None,
            event_loop: EventLoop::new(&config)?,
            clients: RefCell::new(HashMap::new()),
            config,
        })
    }

    pub fn worker(
        membership: SharedMembership,
        store: Arc<TileStore>,
        config: Config,
    ) -> Result<Self, Error> {
        Ok(Self {
            directory: Directory::Worker(membership),
            store: Some(store),
            event_loop: EventLoop::new(&config)?,
            clients: RefCell::new(HashMap::new()),
            config,
        })
    }

    /// This thread's worker id; `None` on the coordinator or before
    /// initialisation.
    pub fn me(&self) -> Option<WorkerId> {
        match &self.directory {
            Directory::Coordinator(_) => None,
            Directory::Worker(m) => m.read().as_ref().map(|m| m.me),
        }
    }

    /// Whether tiles owned by `worker` can be read from the local store.
    pub fn is_local(&self, worker: WorkerId) -> bool {
        self.store.is_some() && self.me() == Some(worker)
    }

    pub fn store(&self) -> Option<&TileStore> {
        self.store.as_deref()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    fn spec(&self, worker: WorkerId) -> Result<WorkerSpec, Error> {
        let spec = match &self.directory {
            Directory::Coordinator(cluster) => cluster.get(worker).cloned(),
            Directory::Worker(m) => {
                let guard = m.read();
                let membership = guard.as_ref().ok_or(SchedulingError::NotInitialized)?;
                membership.cluster.get(worker).cloned()
            }
        };
        spec.ok_or_else(|| SchedulingError::UnknownWorker(worker).into())
    }

    /// Connection to `worker`, opened on first use and reopened if it dropped.
    pub fn client(&self, worker: WorkerId) -> Result<Rc<RpcClient>, Error> {
        if let Some(client) = self.clients.borrow().get(&worker) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }
        let spec = self.spec(worker)?;
        debug!(%worker, addr = %spec.addr(), "opening connection");
        let client = Rc::new(RpcClient::connect(&self.event_loop, worker, &spec)?);
        self.clients.borrow_mut().insert(worker, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_view_tracks_membership() {
        let membership: SharedMembership = Arc::new(RwLock::new(None));
        let peers = PeerSet::worker(
            membership.clone(),
            Arc::new(TileStore::new()),
            Config::default(),
        )
        .unwrap();
        assert_eq!(peers.me(), None);
        assert!(matches!(
            peers.client(WorkerId(0)),
            Err(Error::Scheduling(SchedulingError::NotInitialized))
        ));

        *membership.write() = Some(Membership {
            me: WorkerId(1),
            cluster: Cluster::builder().worker("127.0.0.1", 1, 1).worker("127.0.0.1", 2, 1).build(),
        });
        assert_eq!(peers.me(), Some(WorkerId(1)));
        assert!(peers.is_local(WorkerId(1)));
        assert!(!peers.is_local(WorkerId(0)));
        assert!(matches!(
            peers.client(WorkerId(5)),
            Err(Error::Scheduling(SchedulingError::UnknownWorker(WorkerId(5))))
        ));
    }

    #[test]
    fn coordinator_view_is_never_local() {
        let cluster = Cluster::builder().worker("127.0.0.1", 1, 1).build();
        let peers = PeerSet::coordinator(cluster, Config::default()).unwrap();
        assert_eq!(peers.me(), None);
        assert!(!peers.is_local(WorkerId(0)));
    }
}
