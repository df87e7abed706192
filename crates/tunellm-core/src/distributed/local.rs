//! In-process group: one thread per simulated rank.

use std::sync::{Arc, Barrier, Mutex};

use super::Collective;
use crate::error::{ResolveError, ResolveResult};

struct Shared {
    barrier: Barrier,
    slot: Mutex<Option<String>>,
}

/// One member of a thread-backed group created by [`LocalGroup::create`].
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create `world_size` connected members, indexed by rank.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slot: Mutex::new(None),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> ResolveResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn broadcast_string(&self, value: &str) -> ResolveResult<String> {
        let poisoned = |_| ResolveError::Collective("broadcast slot poisoned".to_string());

        if self.rank == 0 {
            *self.shared.slot.lock().map_err(poisoned)? = Some(value.to_string());
        }
        self.shared.barrier.wait();
        let received = self.shared.slot.lock().map_err(poisoned)?.clone();
        // Rank 0 must not overwrite the slot until everyone has read it.
        self.shared.barrier.wait();

        received.ok_or_else(|| ResolveError::Collective("rank 0 did not publish a value".to_string()))
    }
}
