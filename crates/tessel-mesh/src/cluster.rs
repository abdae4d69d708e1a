//! Cluster registry: the static list of workers for one execution.
//!
//! The registry is injected by whoever launched the processes; the runtime
//! never discovers or changes membership. A worker's id is its position in
//! the list.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a worker within a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Where a worker listens and how much work it can take.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub host: String,
    pub port: u16,
    /// Concurrent kernel slots (cores) offered by this worker.
    pub slots: usize,
}

impl WorkerSpec {
    pub fn new(host: impl Into<String>, port: u16, slots: usize) -> Self {
        Self {
            host: host.into(),
            port,
            slots,
        }
    }

    /// `host:port`, for logs and errors.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Every worker taking part in an execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    workers: Vec<WorkerSpec>,
}

impl Cluster {
    /// Start building a cluster.
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    pub fn from_specs(workers: Vec<WorkerSpec>) -> Self {
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSpec> {
        self.workers.get(id.0 as usize)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        (id.0 as usize) < self.workers.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        (0..self.workers.len()).map(|i| WorkerId(i as u32))
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &WorkerSpec)> {
        self.workers
            .iter()
            .enumerate()
            .map(|(i, spec)| (WorkerId(i as u32), spec))
    }

    /// Total slots across all workers.
    pub fn total_slots(&self) -> usize {
        self.workers.iter().map(|w| w.slots).sum()
    }
}

/// Builder for a `Cluster`.
#[derive(Default)]
pub struct ClusterBuilder {
    workers: Vec<WorkerSpec>,
}

impl ClusterBuilder {
    /// Add a worker; it gets the next id.
    pub fn worker(mut self, host: impl Into<String>, port: u16, slots: usize) -> Self {
        self.workers.push(WorkerSpec::new(host, port, slots.max(1)));
        self
    }

    pub fn build(self) -> Cluster {
        Cluster {
            workers: self.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_display() {
        assert_eq!(format!("{}", WorkerId(0)), "worker-0");
        assert_eq!(format!("{}", WorkerId(42)), "worker-42");
    }

    #[test]
    fn builder_assigns_sequential_ids() {
        let cluster = Cluster::builder()
            .worker("10.0.0.1", 7000, 4)
            .worker("10.0.0.2", 7000, 0)
            .build();
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster.get(WorkerId(1)).unwrap().addr(), "10.0.0.2:7000");
        assert_eq!(cluster.get(WorkerId(1)).unwrap().slots, 1);
        assert_eq!(cluster.total_slots(), 5);
        assert!(!cluster.contains(WorkerId(2)));
        assert_eq!(cluster.ids().collect::<Vec<_>>(), vec![WorkerId(0), WorkerId(1)]);
    }
}
