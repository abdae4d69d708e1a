//! Runtime configuration.
//!
//! One immutable `Config` value is handed to every socket, worker and
//! coordinator constructor. Nothing reads configuration from ambient state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How new arrays are cut into tiles and spread over workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignMode {
    /// One tile per worker slot, weighted by slot count.
    #[default]
    ByCore,
    /// One tile per worker.
    ByNode,
}

/// Transport and engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Poll timeout right after activity.
    pub poll_min: Duration,
    /// Upper bound the idle poll timeout doubles towards.
    pub poll_max: Duration,
    /// How long a caller waits on a single RPC reply.
    pub rpc_timeout: Duration,
    /// Largest accepted wire packet, in bytes.
    pub max_frame_len: usize,
    /// Threads in each worker's kernel pool.
    pub kernel_threads: usize,
    /// Tile placement policy for new arrays.
    pub assign_mode: AssignMode,
    /// When set, tile dispatch order is shuffled with this seed.
    pub dispatch_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_min: Duration::from_millis(1),
            poll_max: Duration::from_millis(10),
            rpc_timeout: Duration::from_secs(30),
            max_frame_len: 256 * 1024 * 1024,
            kernel_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            assign_mode: AssignMode::ByCore,
            dispatch_seed: None,
        }
    }
}

impl Config {
    pub fn with_poll_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.poll_min = min;
        self.poll_max = max.max(min);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_kernel_threads(mut self, threads: usize) -> Self {
        self.kernel_threads = threads.max(1);
        self
    }

    pub fn with_assign_mode(mut self, mode: AssignMode) -> Self {
        self.assign_mode = mode;
        self
    }

    pub fn with_dispatch_seed(mut self, seed: u64) -> Self {
        self.dispatch_seed = Some(seed);
        self
    }
}
