//! Kernel thread pool.
//!
//! The poll thread must never run kernels itself. It hands each task to
//! this pool through a channel. Every pool thread builds its own
//! [`PeerSet`] (and with it its own event loop) when it starts and keeps
//! it for its lifetime.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Error, TransportError};
use crate::peers::{PeerSet, SharedMembership};
use crate::store::TileStore;

/// Work item run on a pool thread.
pub type Job = Box<dyn FnOnce(&PeerSet) + Send>;

pub struct KernelPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl KernelPool {
    /// Start `config.kernel_threads` threads named `{name}-kernel-{i}`.
    pub fn spawn(
        name: &str,
        membership: SharedMembership,
        store: Arc<TileStore>,
        config: &Config,
    ) -> Result<Self, Error> {
        let (sender, receiver) = unbounded::<Job>();
        let mut threads = Vec::with_capacity(config.kernel_threads);
        for i in 0..config.kernel_threads.max(1) {
            let receiver = receiver.clone();
            let membership = membership.clone();
            let store = store.clone();
            let config = config.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-kernel-{i}"))
                .spawn(move || {
                    let peers = match PeerSet::worker(membership, store, config) {
                        Ok(peers) => peers,
                        Err(e) => {
                            error!("kernel thread could not start: {e}");
                            return;
                        }
                    };
                    for job in receiver.iter() {
                        job(&peers);
                    }
                    debug!("kernel thread exiting");
                })
                .map_err(TransportError::from)?;
            threads.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            threads,
        })
    }

    pub fn size(&self) -> usize {
        self.threads.len()
    }

    pub fn submit(&self, job: Job) -> Result<(), TransportError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TransportError::Closed("kernel pool".into()))?;
        sender
            .send(job)
            .map_err(|_| TransportError::Closed("kernel pool".into()))
    }

    /// Stop accepting work, let queued jobs finish and join the threads.
    pub fn shutdown(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() != current && handle.join().is_err() {
                error!("kernel thread panicked");
            }
        }
    }
}

impl Drop for KernelPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
