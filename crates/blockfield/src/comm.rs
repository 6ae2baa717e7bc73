//! Collective communication between the ranks sharing a file.
//!
//! Layout definition is collective: every rank declares its own partition
//! and receives the full rank-ordered table. [`Communicator`] is the seam
//! that supplies this exchange. [`SoloComm`] serves the common
//! single-process case; [`ThreadComm`] connects threads of one process
//! that share a [`Store`](crate::Store), which is also how the collective
//! paths are tested.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use blockfield_core::Partition;

use crate::error::CommError;

/// The collective operations a [`BlockFile`](crate::BlockFile) needs from
/// its process group.
///
/// Every member of the group must enter each collective call the same
/// number of times and in the same order, as with MPI collectives.
pub trait Communicator: Send {
    /// This member's rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of members in the group.
    fn size(&self) -> usize;

    /// Exchange per-rank partitions; returns all of them in rank order.
    fn gather_partitions(&self, mine: Partition) -> Result<Vec<Partition>, CommError>;

    /// Block until every member has arrived.
    fn barrier(&self);
}

// ---------------------------------------------------------------------------
// SoloComm
// ---------------------------------------------------------------------------

/// The trivial group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloComm;

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather_partitions(&self, mine: Partition) -> Result<Vec<Partition>, CommError> {
        Ok(vec![mine])
    }

    fn barrier(&self) {}
}

// ---------------------------------------------------------------------------
// ThreadComm
// ---------------------------------------------------------------------------

struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct Shared {
    nranks: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    slots: Mutex<Vec<Option<Partition>>>,
}

/// One member of a group of threads.
///
/// [`ThreadComm::split`] hands out one endpoint per rank; each endpoint is
/// moved into its thread. All endpoints of a group must keep participating
/// in collective calls, or the others block forever.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create a group of `nranks` connected endpoints, in rank order.
    pub fn split(nranks: usize) -> Vec<ThreadComm> {
        assert!(nranks > 0, "a group needs at least one rank");
        let shared = Arc::new(Shared {
            nranks,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            slots: Mutex::new(vec![None; nranks]),
        });
        (0..nranks)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn lock_barrier(&self) -> MutexGuard<'_, BarrierState> {
        // The barrier state is a bare counter, still valid after a
        // panicking holder.
        self.shared
            .barrier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.nranks
    }

    fn gather_partitions(&self, mine: Partition) -> Result<Vec<Partition>, CommError> {
        {
            let mut slots = self.shared.slots.lock().map_err(|_| CommError::Poisoned)?;
            slots[self.rank] = Some(mine);
        }
        // Wait for every deposit, then read before anyone clears.
        self.barrier();
        let gathered = {
            let slots = self.shared.slots.lock().map_err(|_| CommError::Poisoned)?;
            let mut gathered = Vec::with_capacity(slots.len());
            for slot in slots.iter() {
                match slot {
                    Some(p) => gathered.push(*p),
                    None => {
                        return Err(CommError::SizeMismatch {
                            expected: self.shared.nranks,
                            actual: gathered.len(),
                        })
                    }
                }
            }
            gathered
        };
        self.barrier();
        {
            let mut slots = self.shared.slots.lock().map_err(|_| CommError::Poisoned)?;
            slots[self.rank] = None;
        }
        Ok(gathered)
    }

    fn barrier(&self) {
        let mut state = self.lock_barrier();
        state.arrived += 1;
        if state.arrived == self.shared.nranks {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.shared.released.notify_all();
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = self
                    .shared
                    .released
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}
