//! Collectives built from point-to-point messages.
//!
//! Every rank walks its peers in increasing rank order; for each pair the
//! lower rank sends first and the higher rank receives first. Pairs are
//! therefore processed in one global lexicographic order, so the schedule
//! cannot deadlock even when sends block.

use super::communicator::{CommTag, Communicator, Wait};
use super::wire::{decode_u64s, encode_u64s};
use crate::mesh_error::MeshForestError;
use std::collections::{BTreeMap, BTreeSet};

/// Sparse pairwise exchange: send `sends[p]` to each `p`, receive one message
/// from each rank in `recv_from`. Both sides must agree on who talks to whom.
pub fn exchange_ordered<C: Communicator>(
    comm: &C,
    tag: u16,
    sends: &BTreeMap<usize, Vec<u8>>,
    recv_from: &BTreeSet<usize>,
) -> Result<BTreeMap<usize, Vec<u8>>, MeshForestError> {
    let me = comm.rank();
    let peers: BTreeSet<usize> = sends
        .keys()
        .chain(recv_from.iter())
        .copied()
        .filter(|&p| p != me)
        .collect();
    let mut received = BTreeMap::new();
    for peer in peers {
        if peer >= comm.size() {
            return Err(MeshForestError::CommError {
                neighbor: peer,
                reason: format!("rank out of range for a world of {}", comm.size()),
            });
        }
        let send = |buf: &Vec<u8>| {
            let _ = comm.isend(peer, tag, buf).wait();
        };
        let recv = || -> Result<Vec<u8>, MeshForestError> {
            comm.irecv(peer, tag)
                .wait()
                .ok_or_else(|| MeshForestError::CommError {
                    neighbor: peer,
                    reason: format!("no message with tag {tag:#x}"),
                })
        };
        if me < peer {
            if let Some(buf) = sends.get(&peer) {
                send(buf);
            }
            if recv_from.contains(&peer) {
                received.insert(peer, recv()?);
            }
        } else {
            if recv_from.contains(&peer) {
                received.insert(peer, recv()?);
            }
            if let Some(buf) = sends.get(&peer) {
                send(buf);
            }
        }
    }
    Ok(received)
}

/// Gather one buffer from every rank, indexed by rank.
pub fn all_gather_bytes<C: Communicator>(
    comm: &C,
    tag: u16,
    local: &[u8],
) -> Result<Vec<Vec<u8>>, MeshForestError> {
    let me = comm.rank();
    let others: BTreeSet<usize> = (0..comm.size()).filter(|&r| r != me).collect();
    let sends: BTreeMap<usize, Vec<u8>> = others.iter().map(|&r| (r, local.to_vec())).collect();
    let mut received = exchange_ordered(comm, tag, &sends, &others)?;
    Ok((0..comm.size())
        .map(|r| {
            if r == me {
                local.to_vec()
            } else {
                received.remove(&r).unwrap_or_default()
            }
        })
        .collect())
}

/// Gather a list of `u64` from every rank.
pub fn all_gather_u64s<C: Communicator>(
    comm: &C,
    tag: u16,
    local: &[u64],
) -> Result<Vec<Vec<u64>>, MeshForestError> {
    all_gather_bytes(comm, tag, &encode_u64s(local))?
        .into_iter()
        .enumerate()
        .map(|(rank, buf)| decode_u64s(rank, &buf))
        .collect()
}

/// Gather one `u64` from every rank.
pub fn all_gather_u64<C: Communicator>(
    comm: &C,
    tag: u16,
    value: u64,
) -> Result<Vec<u64>, MeshForestError> {
    all_gather_u64s(comm, tag, &[value])?
        .into_iter()
        .enumerate()
        .map(|(rank, v)| match v.as_slice() {
            [x] => Ok(*x),
            _ => Err(MeshForestError::WireFormat {
                neighbor: rank,
                reason: format!("expected one value, got {}", v.len()),
            }),
        })
        .collect()
}

pub fn all_reduce_sum_u64<C: Communicator>(comm: &C, value: u64) -> Result<u64, MeshForestError> {
    Ok(all_gather_u64(comm, CommTag::ALL_GATHER, value)?.into_iter().sum())
}

pub fn all_reduce_max_f64<C: Communicator>(comm: &C, value: f64) -> Result<f64, MeshForestError> {
    Ok(all_gather_u64(comm, CommTag::ALL_GATHER, value.to_bits())?
        .into_iter()
        .map(f64::from_bits)
        .fold(f64::NEG_INFINITY, f64::max))
}

/// Fail unless every rank entered `operation` at the same domain generation.
pub fn check_generation<C: Communicator>(
    comm: &C,
    operation: &'static str,
    generation: u64,
) -> Result<(), MeshForestError> {
    let all = all_gather_u64(comm, CommTag::GENERATION, generation)?;
    match all.iter().find(|&&g| g != generation) {
        Some(&remote) => Err(MeshForestError::GenerationMismatch {
            operation,
            local: generation,
            remote,
        }),
        None => Ok(()),
    }
}

/// Fail unless every rank passed the same arguments to `operation`.
pub fn check_agreement<C: Communicator>(
    comm: &C,
    operation: &'static str,
    args: &[u64],
) -> Result<(), MeshForestError> {
    let all = all_gather_u64s(comm, CommTag::ALL_GATHER, args)?;
    match all.iter().enumerate().find(|(_, a)| a.as_slice() != args) {
        Some((rank, remote)) => Err(MeshForestError::CollectiveMismatch {
            operation,
            detail: format!("rank {rank} passed {remote:?}, this rank passed {args:?}"),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalComm, NoComm};

    fn on_world<T: Send + 'static>(
        n: usize,
        f: impl Fn(LocalComm) -> T + Send + Sync + Clone + 'static,
    ) -> Vec<T> {
        let handles: Vec<_> = LocalComm::world(n)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                std::thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn serial_collectives_are_local() {
        assert_eq!(all_gather_u64(&NoComm, 1, 5).unwrap(), vec![5]);
        assert_eq!(all_reduce_max_f64(&NoComm, 2.5).unwrap(), 2.5);
        check_generation(&NoComm, "test", 3).unwrap();
    }

    #[test]
    fn all_gather_over_four_ranks() {
        let out = on_world(4, |comm| {
            all_gather_u64(&comm, CommTag::ALL_GATHER, comm.rank() as u64 * 10).unwrap()
        });
        for gathered in out {
            assert_eq!(gathered, vec![0, 10, 20, 30]);
        }
    }

    #[test]
    fn reductions_agree() {
        let out = on_world(3, |comm| {
            let sum = all_reduce_sum_u64(&comm, comm.rank() as u64 + 1).unwrap();
            let max = all_reduce_max_f64(&comm, comm.rank() as f64 * 0.5).unwrap();
            (sum, max)
        });
        assert!(out.iter().all(|&(s, m)| s == 6 && m == 1.0));
    }

    #[test]
    fn generation_divergence_is_detected() {
        let out = on_world(2, |comm| check_generation(&comm, "setup", comm.rank() as u64));
        assert!(out.iter().all(|r| matches!(
            r,
            Err(MeshForestError::GenerationMismatch { .. })
        )));
    }

    #[test]
    fn sparse_ring_exchange() {
        let out = on_world(3, |comm| {
            let n = comm.size();
            let next = (comm.rank() + 1) % n;
            let prev = (comm.rank() + n - 1) % n;
            let sends = BTreeMap::from([(next, vec![comm.rank() as u8])]);
            let recv = BTreeSet::from([prev]);
            exchange_ordered(&comm, 5, &sends, &recv).unwrap()[&prev][0] as usize
        });
        assert_eq!(out, vec![2, 0, 1]);
    }
}
