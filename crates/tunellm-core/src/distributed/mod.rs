//! Multi-process topology, rendezvous and barrier-fenced initialization.
//!
//! A run is launched either as a single process or as one process per
//! accelerator (torchrun-style `RANK` / `LOCAL_RANK` / `WORLD_SIZE` /
//! `LOCAL_WORLD_SIZE` variables). Cooperating processes talk through a
//! [`Collective`]; the rest of the crate only ever needs a barrier and a
//! rank-0 string broadcast.

mod local;
mod tcp;

pub use local::LocalGroup;
pub use tcp::{RendezvousAddr, TcpGroup};

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::args::{DdpBackend, RunConfig};
use crate::error::{ResolveError, ResolveResult};

/// Rank layout of the current process, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistributedTopology {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub local_world_size: usize,
    distributed: bool,
}

impl DistributedTopology {
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            local_world_size: 1,
            distributed: false,
        }
    }

    /// A rank inside a simulated or real multi-process launch.
    pub fn new(rank: usize, local_rank: usize, world_size: usize, local_world_size: usize) -> Self {
        Self {
            rank,
            local_rank,
            world_size,
            local_world_size,
            distributed: true,
        }
    }

    /// Read the launcher's environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// A process is distributed when both `RANK` and `LOCAL_RANK` are set to
    /// non-negative integers. Missing sizes default to 1.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        match (read("RANK"), read("LOCAL_RANK")) {
            (Some(rank), Some(local_rank)) => Self::new(
                rank,
                local_rank,
                read("WORLD_SIZE").unwrap_or(1),
                read("LOCAL_WORLD_SIZE").unwrap_or(1),
            ),
            _ => Self::single_process(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    /// Global rank 0, or any non-distributed process.
    pub fn is_master(&self) -> bool {
        !self.distributed || self.rank == 0
    }

    /// Rank 0 on its node, or any non-distributed process.
    pub fn is_local_master(&self) -> bool {
        !self.distributed || self.local_rank == 0
    }
}

/// Minimal collective-communication surface used by configuration
/// resolution.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank in the group has called `barrier`.
    fn barrier(&self) -> ResolveResult<()>;

    /// Every rank passes its own `value`; every rank receives rank 0's.
    fn broadcast_string(&self, value: &str) -> ResolveResult<String>;
}

/// Per-process handle to the communication group, initialized at most once.
#[derive(Default)]
pub struct ProcessGroup {
    inner: OnceLock<Arc<dyn Collective>>,
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// A group that is already initialized with `collective`.
    pub fn with(collective: Arc<dyn Collective>) -> Self {
        let group = Self::new();
        let _ = group.inner.set(collective);
        group
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn get(&self) -> Option<Arc<dyn Collective>> {
        self.inner.get().cloned()
    }

    /// Return the group, running `init` only if it has not been created yet.
    pub fn get_or_init<F>(&self, init: F) -> ResolveResult<Arc<dyn Collective>>
    where
        F: FnOnce() -> ResolveResult<Arc<dyn Collective>>,
    {
        if let Some(existing) = self.inner.get() {
            return Ok(existing.clone());
        }
        let created = init()?;
        let _ = self.inner.set(created);
        self.inner
            .get()
            .cloned()
            .ok_or_else(|| ResolveError::Collective("process group failed to initialize".to_string()))
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Reject backend / quantization combinations the backend cannot serve.
pub fn check_backend(cfg: &RunConfig) -> ResolveResult<()> {
    if cfg.ddp_backend == DdpBackend::Gloo && cfg.quantization_bit != 0 {
        return Err(ResolveError::UnsupportedBackend {
            backend: cfg.ddp_backend.to_string(),
            reason: format!(
                "with quantization_bit {}, please use `nccl`",
                cfg.quantization_bit
            ),
        });
    }
    Ok(())
}

/// Distributed coordination pass.
///
/// Non-distributed runs are returned unchanged. Otherwise the seed is offset
/// by rank, the backend is checked against the quantization mode, the process
/// group is initialized once via `init`, and `output_dir` is replaced by rank
/// 0's value on every rank.
pub fn coordinate<F>(
    mut cfg: RunConfig,
    topology: &DistributedTopology,
    group: &ProcessGroup,
    init: F,
) -> ResolveResult<RunConfig>
where
    F: FnOnce(&DistributedTopology, DdpBackend) -> ResolveResult<Arc<dyn Collective>>,
{
    if !topology.is_distributed() {
        return Ok(cfg);
    }

    cfg.seed += topology.rank as u64;
    check_backend(&cfg)?;

    let backend = cfg.ddp_backend;
    let collective = group.get_or_init(|| {
        info!(
            rank = topology.rank,
            world_size = topology.world_size,
            backend = %backend,
            "Initializing process group"
        );
        init(topology, backend)
    })?;

    let shared = collective.broadcast_string(&cfg.output_dir.to_string_lossy())?;
    debug!(rank = topology.rank, output_dir = %shared, "Received shared output_dir");
    cfg.output_dir = shared.into();
    Ok(cfg)
}

/// Run a one-time resource acquisition so that only each node's local leader
/// does the work first.
///
/// Non-leaders wait at a barrier until the leaders have finished, then run `f`
/// themselves (typically hitting a warm cache). A final barrier holds every
/// rank until all ranks are done. Without a collective, or outside a
/// distributed launch, `f` simply runs.
pub fn local_leader_first<T, F>(
    collective: Option<&dyn Collective>,
    topology: &DistributedTopology,
    f: F,
) -> ResolveResult<T>
where
    F: FnOnce() -> ResolveResult<T>,
{
    let Some(collective) = collective.filter(|_| topology.is_distributed()) else {
        return f();
    };

    if !topology.is_local_master() {
        collective.barrier()?;
    }
    let out = f()?;
    if topology.is_local_master() {
        collective.barrier()?;
    }
    collective.barrier()?;
    Ok(out)
}
