//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are contiguous byte buffers. Handles are waitable; callers must
//! `.wait()` a receive before trusting its payload. Backends may complete
//! operations eagerly, so exchanges go through
//! [`exchange_ordered`](super::collective::exchange_ordered), whose
//! lower-rank-sends-first schedule is deadlock free even with blocking sends.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

/// Message tags used by the collectives of this crate.
pub struct CommTag;

impl CommTag {
    pub const GENERATION: u16 = 0x10;
    pub const ALL_GATHER: u16 = 0x11;
    pub const TAGS: u16 = 0x20;
    pub const PARTITION_COUNTS: u16 = 0x30;
    pub const MIGRATE: u16 = 0x31;
    pub const GHOST: u16 = 0x40;
}

/// Point-to-point communication between the processes of one run.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;
    fn barrier(&self);
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-process communicator; every collective is local.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}
    fn barrier(&self) {}
}

// --- LocalComm: one thread per rank in the same process ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Debug)]
struct Fabric {
    size: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    posted: Mutex<u64>,
    arrived: Condvar,
    barrier: Barrier,
    timeout: Duration,
}

/// In-process communicator connecting `n` ranks through a shared mailbox.
///
/// Sends are buffered; a receive blocks until a matching message arrives
/// or the fabric timeout expires.
#[derive(Clone, Debug)]
pub struct LocalComm {
    rank: usize,
    fabric: Arc<Fabric>,
}

impl LocalComm {
    /// Create the communicators of an `n`-rank world.
    pub fn world(n: usize) -> Vec<LocalComm> {
        Self::world_with_timeout(n, Duration::from_secs(60))
    }

    pub fn world_with_timeout(n: usize, timeout: Duration) -> Vec<LocalComm> {
        let fabric = Arc::new(Fabric {
            size: n,
            mailbox: DashMap::new(),
            posted: Mutex::new(0),
            arrived: Condvar::new(),
            barrier: Barrier::new(n),
            timeout,
        });
        (0..n)
            .map(|rank| LocalComm {
                rank,
                fabric: fabric.clone(),
            })
            .collect()
    }

    fn pop(&self, key: &Key) -> Option<Bytes> {
        self.fabric
            .mailbox
            .get_mut(key)
            .and_then(|mut queue| queue.pop_front())
    }
}

pub struct LocalRecv {
    comm: LocalComm,
    key: Key,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.comm.fabric.timeout;
        let mut posted = self.comm.fabric.posted.lock();
        loop {
            if let Some(bytes) = self.comm.pop(&self.key) {
                return Some(bytes.to_vec());
            }
            if self
                .comm
                .fabric
                .arrived
                .wait_until(&mut posted, deadline)
                .timed_out()
            {
                return self.comm.pop(&self.key).map(|b| b.to_vec());
            }
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let key = (self.rank, peer, tag);
        self.fabric
            .mailbox
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        let mut posted = self.fabric.posted.lock();
        *posted += 1;
        self.fabric.arrived.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16) -> LocalRecv {
        LocalRecv {
            comm: self.clone(),
            key: (peer, self.rank, tag),
        }
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Destination as _, Source as _};

    /// MPI communicator. Operations complete eagerly (blocking send and
    /// receive), which is safe under the ordered exchange schedule.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new(universe: &mpi::environment::Universe) -> Self {
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    pub struct MpiRecv(Option<Vec<u8>>);

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = ();
        type RecvHandle = MpiRecv;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, tag as i32);
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecv {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            MpiRecv(Some(data))
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
