//! Weighted contiguous repartition along the space-filling curve.
//!
//! Each patch goes to the rank whose share of the total weight contains the
//! patch's weight midpoint. Targets are monotone along the curve, so every
//! rank ends up with one contiguous chunk and state moves only between ranks
//! whose chunks shift.

use super::Domain;
use crate::algs::collective::{all_gather_u64, all_gather_u64s, check_generation, exchange_ordered};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{KIND_MIGRATE, WireState, decode_states, encode_states};
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, Patch, PatchInfo};
use crate::solver::PatchSolver;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub kept: usize,
    pub sent: usize,
    pub received: usize,
}

/// Destination rank of each local patch.
fn targets(weights: &[u64], before: u64, total: u64, first: usize, global: usize, size: usize) -> Vec<usize> {
    let p = size as u128;
    let mut prefix = before as u128;
    weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let t = if total == 0 {
                (first + i) as u128 * p / global.max(1) as u128
            } else {
                (2 * prefix + w as u128) * p / (2 * total as u128)
            };
            prefix += w as u128;
            (t as usize).min(size - 1)
        })
        .collect()
}

impl<S, const D: usize> Domain<S, D> {
    /// Rebalance with unit weights.
    pub fn partition_uniform<C, P>(&mut self, comm: &C, solver: &P) -> Result<PartitionStats, MeshForestError>
    where
        C: Communicator,
        P: PatchSolver<D, State = S>,
    {
        self.partition(comm, solver, |_| 1)
    }

    /// Rebalance by `weight` and migrate the state of moved patches. Collective.
    ///
    /// Partitioning changes ownership, so the domain moves to the next
    /// generation and must be set up again.
    pub fn partition<C, P, W>(&mut self, comm: &C, solver: &P, weight: W) -> Result<PartitionStats, MeshForestError>
    where
        C: Communicator,
        P: PatchSolver<D, State = S>,
        W: Fn(&Patch<S, D>) -> u64,
    {
        check_generation(comm, "partition", self.generation)?;
        if let Some(p) = self.patches.iter().find(|p| !p.is_initialized()) {
            return Err(MeshForestError::UninitializedPatch(p.info().global_index));
        }
        let weights: Vec<u64> = self.patches.iter().map(&weight).collect();
        let totals = all_gather_u64(comm, CommTag::PARTITION_COUNTS, weights.iter().sum())?;
        let before: u64 = totals[..self.rank].iter().sum();
        let total: u64 = totals.iter().sum();
        let first = self.offsets[self.rank];
        let dest = targets(&weights, before, total, first, self.forest.leaf_count(), self.size);

        let mut counts = vec![0u64; self.size];
        for &t in &dest {
            counts[t] += 1;
        }
        let matrix = all_gather_u64s(comm, CommTag::PARTITION_COUNTS, &counts)?;
        if matrix.iter().any(|row| row.len() != self.size) {
            return Err(MeshForestError::CollectiveMismatch {
                operation: "partition",
                detail: "ranks disagree on the world size".into(),
            });
        }
        let mut offsets = vec![0usize; self.size + 1];
        for r in 0..self.size {
            let incoming: u64 = matrix.iter().map(|row| row[r]).sum();
            offsets[r + 1] = offsets[r] + incoming as usize;
        }
        if offsets[self.size] != self.forest.leaf_count() {
            return Err(MeshForestError::InvariantViolation(format!(
                "partition assigns {} of {} patches",
                offsets[self.size],
                self.forest.leaf_count()
            )));
        }

        let next_generation = self.generation + 1;
        let mut outgoing: BTreeMap<usize, Vec<WireState>> = BTreeMap::new();
        let mut kept = Vec::new();
        for (patch, &t) in std::mem::take(&mut self.patches).into_iter().zip(&dest) {
            if t == self.rank {
                kept.push(patch);
                continue;
            }
            let mut patch = patch;
            let global = patch.info().global_index;
            let age = patch.age();
            let state = patch.take_state()?;
            outgoing.entry(t).or_default().push(WireState {
                patch: global,
                age,
                payload: solver.pack(&state),
            });
        }
        let sent: usize = outgoing.values().map(Vec::len).sum();
        let sends: BTreeMap<usize, Vec<u8>> = outgoing
            .into_iter()
            .map(|(r, states)| (r, encode_states(KIND_MIGRATE, next_generation, &states)))
            .collect();
        let recv_from: BTreeSet<usize> = (0..self.size)
            .filter(|&src| src != self.rank && matrix[src][self.rank] > 0)
            .collect();
        let mut received = exchange_ordered(comm, CommTag::MIGRATE, &sends, &recv_from)?;

        let start = offsets[self.rank];
        let mut patches: Vec<Patch<S, D>> = Vec::with_capacity(offsets[self.rank + 1] - start);
        let mut received_count = 0;
        for src in 0..self.size {
            if src == self.rank {
                for mut patch in kept.drain(..) {
                    let local = patches.len();
                    let info = patch.info_mut();
                    info.local_index = local;
                    info.owner = self.rank;
                    patches.push(patch);
                }
                continue;
            }
            let Some(buf) = received.remove(&src) else {
                continue;
            };
            for ws in decode_states(src, KIND_MIGRATE, next_generation, &buf)? {
                let global = start + patches.len();
                if ws.patch != global {
                    return Err(MeshForestError::WireFormat {
                        neighbor: src,
                        reason: format!("received patch {} where {global} was expected", ws.patch),
                    });
                }
                let key = self.forest.leaves()[global];
                let info = PatchInfo::new(&self.forest, key, global, patches.len(), self.rank);
                let state = solver.unpack(&info, BuildMode::ForUpdate, &ws.payload)?;
                let mut patch = Patch::new(info);
                patch.adopt(state, BuildMode::ForUpdate)?;
                patch.set_age(ws.age);
                patches.push(patch);
                received_count += 1;
            }
        }
        if patches.len() != offsets[self.rank + 1] - start
            || patches
                .iter()
                .enumerate()
                .any(|(i, p)| p.info().global_index != start + i)
        {
            return Err(MeshForestError::InvariantViolation(format!(
                "rank {} assembled {} patches for range {}..{}",
                self.rank,
                patches.len(),
                start,
                offsets[self.rank + 1]
            )));
        }

        let stats = PartitionStats {
            kept: patches.len() - received_count,
            sent,
            received: received_count,
        };
        self.patches = patches;
        self.offsets = offsets;
        self.generation = next_generation;
        self.is_setup = false;
        self.connections.clear();
        self.debug_assert_invariants();
        debug!(
            "partition -> generation {}: kept {}, sent {}, received {}, offsets {:?}",
            self.generation, stats.kept, stats.sent, stats.received, self.offsets
        );
        Ok(stats)
    }
}
