//! Broadcast fabric used by the distributed executor.
//!
//! The executor only needs rank identity, a barrier and a byte broadcast, so
//! those live behind the [`Transport`] trait. [`LocalFabric`] provides an
//! in-process implementation where every rank is a thread; the `mpi-transport`
//! feature adds a native MPI backend.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{Error, Result};

/// Collective primitives of one rank in the fabric.
///
/// All ranks must call the collectives in lockstep; a rank that fails aborts
/// the whole job.
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    /// Replaces `buf` on every non-root rank with the root's bytes. The
    /// buffer length must match on all ranks.
    fn broadcast(&self, root: usize, buf: &mut [u8]) -> Result<()>;
}

/// Shared state of an in-process fabric: one barrier and one broadcast slot.
pub struct LocalFabric {
    size: usize,
    barrier: Barrier,
    slot: Mutex<Vec<u8>>,
}

impl LocalFabric {
    /// Creates a fabric for `size` ranks. Each participating thread takes one
    /// [`LocalTransport`] endpoint.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            barrier: Barrier::new(size),
            slot: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(self: &Arc<Self>, rank: usize) -> LocalTransport {
        assert!(rank < self.size, "rank {rank} out of range");
        LocalTransport {
            fabric: Arc::clone(self),
            rank,
        }
    }
}

/// One rank's endpoint of a [`LocalFabric`].
pub struct LocalTransport {
    fabric: Arc<LocalFabric>,
    rank: usize,
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }

    fn broadcast(&self, root: usize, buf: &mut [u8]) -> Result<()> {
        if root >= self.fabric.size {
            return Err(Error::Transport(format!("broadcast root {root} out of range")));
        }
        if self.rank == root {
            *self.fabric.slot.lock().unwrap() = buf.to_vec();
        }
        self.fabric.barrier.wait();
        if self.rank != root {
            let slot = self.fabric.slot.lock().unwrap();
            if slot.len() != buf.len() {
                return Err(Error::Transport(format!(
                    "broadcast size mismatch: root sent {}, rank {} expected {}",
                    slot.len(),
                    self.rank,
                    buf.len()
                )));
            }
            buf.copy_from_slice(&slot);
        }
        self.fabric.barrier.wait();
        Ok(())
    }
}

/// Native MPI backend. The first endpoint constructed in the process owns the
/// MPI environment; construction is idempotent because `mpi::initialize`
/// returns `None` once the library is already initialized. Finalization
/// happens when the owning endpoint is dropped.
#[cfg(feature = "mpi-transport")]
pub mod mpi_backend {
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator, Root};

    use super::Transport;
    use crate::error::{Error, Result};

    pub struct MpiTransport {
        _universe: Option<mpi::environment::Universe>,
        world: SimpleCommunicator,
    }

    impl MpiTransport {
        pub fn acquire() -> Self {
            let universe = mpi::initialize();
            Self {
                _universe: universe,
                world: SimpleCommunicator::world(),
            }
        }
    }

    impl Transport for MpiTransport {
        fn rank(&self) -> usize {
            self.world.rank() as usize
        }

        fn size(&self) -> usize {
            self.world.size() as usize
        }

        fn barrier(&self) {
            self.world.barrier();
        }

        fn broadcast(&self, root: usize, buf: &mut [u8]) -> Result<()> {
            if root as i32 >= self.world.size() {
                return Err(Error::Transport(format!("broadcast root {root} out of range")));
            }
            self.world.process_at_rank(root as i32).broadcast_into(buf);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn local_broadcast_reaches_all_ranks() {
        let fabric = LocalFabric::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let endpoint = fabric.endpoint(rank);
                thread::spawn(move || {
                    let mut buf = if rank == 1 { vec![7u8; 4] } else { vec![0u8; 4] };
                    endpoint.broadcast(1, &mut buf).unwrap();
                    buf
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![7u8; 4]);
        }
    }

    #[test]
    fn repeated_endpoint_acquisition_is_harmless() {
        let fabric = LocalFabric::new(1);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(0);
        a.barrier();
        b.barrier();
        assert_eq!(a.size(), 1);
    }
}
