//! Ghost exchange: fill the ghost layers of local patches from their face
//! neighbours, within a process and across processes.
//!
//! [`GhostExchange::setup`] derives a [`GhostPattern`] from the face
//! classification computed by [`Domain::setup`]. The pattern is tied to one
//! domain generation; [`GhostExchange::update`] refuses to run against any
//! other. Face adjacency is symmetric, so a sender can work out what each
//! receiver expects from its own neighbour list and no handshake is needed.

use crate::algs::collective::{all_reduce_sum_u64, check_agreement, check_generation, exchange_ordered};
use crate::algs::communicator::{CommTag, Communicator};
use crate::algs::wire::{KIND_GHOST, WireState, decode_states, encode_states};
use crate::domain::Domain;
use crate::forest::Face;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, PatchInfo};
use crate::solver::PatchSolver;
use hashbrown::HashMap;
use itertools::Itertools;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Relation between a patch and what lies across one of its faces.
///
/// Named from the neighbour's point of view: `DoubleSize` means the
/// neighbour is one level coarser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NeighborType {
    SameSize,
    DoubleSize,
    HalfSize,
    Boundary,
}

impl NeighborType {
    pub fn name(&self) -> &'static str {
        match self {
            NeighborType::SameSize => "same size",
            NeighborType::DoubleSize => "double size",
            NeighborType::HalfSize => "half size",
            NeighborType::Boundary => "boundary",
        }
    }
}

/// Where a ghost source lives during an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GhostSource {
    /// Local patch index.
    Local(usize),
    /// Slot in the received ghost buffer.
    Remote(usize),
}

/// One non-boundary face of a local patch and the patches that fill it.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceLink {
    pub patch: usize,
    pub face: Face,
    pub neighbor_type: NeighborType,
    pub level: u8,
    pub neighbor_level: u8,
    /// `(subface, source)` pairs; `subface` locates the finer side along the face.
    pub sources: Vec<(usize, GhostSource)>,
}

/// A remote patch this process receives a ghost copy of.
#[derive(Clone, Debug, PartialEq)]
pub struct RecvEntry<const D: usize> {
    pub global: usize,
    pub slot: usize,
    /// Bit `l` set when a local patch at level `l` reads this ghost.
    pub levels: u64,
    pub info: PatchInfo<D>,
}

/// Communication pattern of one domain generation.
#[derive(Clone, Debug)]
pub struct GhostPattern<const D: usize> {
    generation: u64,
    rank: usize,
    links: Vec<FaceLink>,
    /// Per destination rank: local patches to send, with the levels of the
    /// remote patches that read them.
    sends: BTreeMap<usize, Vec<(usize, u64)>>,
    /// Per source rank, in curve order.
    recvs: BTreeMap<usize, Vec<RecvEntry<D>>>,
    num_slots: usize,
}

fn level_mask(min_level: u8, max_level: u8) -> u64 {
    (min_level..=max_level.min(63)).fold(0, |m, l| m | (1u64 << l))
}

impl<const D: usize> GhostPattern<D> {
    /// Derive the pattern from a set-up domain. Local only.
    pub fn build<S>(domain: &Domain<S, D>) -> Result<Self, MeshForestError> {
        if !domain.is_setup() {
            return Err(MeshForestError::DomainNotSetUp(domain.generation()));
        }
        let forest = domain.forest();
        let leaves = forest.leaves();

        let mut remote: BTreeSet<usize> = BTreeSet::new();
        for local in 0..domain.num_local_patches() {
            for conn in domain.connections(local)? {
                remote.extend(
                    conn.neighbors
                        .iter()
                        .copied()
                        .filter(|&g| domain.local_index_of(g).is_none()),
                );
            }
        }
        let slot_of: HashMap<usize, usize> = remote.iter().enumerate().map(|(s, &g)| (g, s)).collect();

        let mut links = Vec::new();
        let mut recv_levels: BTreeMap<usize, u64> = BTreeMap::new();
        let mut send_levels: BTreeMap<(usize, usize), u64> = BTreeMap::new();
        for (local, patch) in domain.patches().iter().enumerate() {
            let key = patch.info().key;
            for conn in domain.connections(local)? {
                if conn.neighbor_type == NeighborType::Boundary {
                    continue;
                }
                let mut sources = Vec::with_capacity(conn.neighbors.len());
                let mut neighbor_level = key.level();
                for &g in &conn.neighbors {
                    let nkey = leaves[g];
                    neighbor_level = nkey.level();
                    let subface = match conn.neighbor_type {
                        NeighborType::HalfSize => nkey.cell.subface_index(conn.face.axis),
                        NeighborType::DoubleSize => key.cell.subface_index(conn.face.axis),
                        _ => 0,
                    };
                    let source = match domain.local_index_of(g) {
                        Some(l) => GhostSource::Local(l),
                        None => {
                            *recv_levels.entry(g).or_default() |= 1 << key.level();
                            *send_levels
                                .entry((domain.owner_of(g), local))
                                .or_default() |= 1 << nkey.level();
                            GhostSource::Remote(slot_of[&g])
                        }
                    };
                    sources.push((subface, source));
                }
                links.push(FaceLink {
                    patch: local,
                    face: conn.face,
                    neighbor_type: conn.neighbor_type,
                    level: key.level(),
                    neighbor_level,
                    sources,
                });
            }
        }

        let sends: BTreeMap<usize, Vec<(usize, u64)>> = send_levels
            .into_iter()
            .chunk_by(|&((rank, _), _)| rank)
            .into_iter()
            .map(|(rank, group)| (rank, group.map(|((_, local), levels)| (local, levels)).collect()))
            .collect();
        let offsets = domain.offsets();
        let mut recvs: BTreeMap<usize, Vec<RecvEntry<D>>> = BTreeMap::new();
        for (global, levels) in recv_levels {
            let owner = domain.owner_of(global);
            let info = PatchInfo::new(forest, leaves[global], global, global - offsets[owner], owner);
            recvs.entry(owner).or_default().push(RecvEntry {
                global,
                slot: slot_of[&global],
                levels,
                info,
            });
        }

        Ok(Self {
            generation: domain.generation(),
            rank: domain.rank(),
            links,
            sends,
            recvs,
            num_slots: remote.len(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn links(&self) -> &[FaceLink] {
        &self.links
    }

    /// Number of distinct remote patches this process reads.
    pub fn num_remote(&self) -> usize {
        self.num_slots
    }

    /// Ranks this process sends ghost data to.
    pub fn send_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.sends.keys().copied()
    }

    /// Ranks this process receives ghost data from.
    pub fn recv_ranks(&self) -> impl Iterator<Item = usize> + '_ {
        self.recvs.keys().copied()
    }

    pub fn recv_entries(&self, rank: usize) -> &[RecvEntry<D>] {
        self.recvs.get(&rank).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Counters from one [`GhostExchange::update`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GhostStats {
    pub local_faces: usize,
    pub remote_faces: usize,
    pub sent: usize,
    pub received: usize,
}

/// A ghost pattern plus the received copies of remote patches.
pub struct GhostExchange<S, const D: usize> {
    pattern: GhostPattern<D>,
    ghosts: Vec<Option<S>>,
    last_time: Option<f64>,
}

impl<S, const D: usize> std::fmt::Debug for GhostExchange<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostExchange")
            .field("generation", &self.pattern.generation)
            .field("links", &self.pattern.links.len())
            .field("remote", &self.pattern.num_slots)
            .field("last_time", &self.last_time)
            .finish()
    }
}

/// `(&mut items[dst], &items[src])` for `dst != src`.
fn pair_mut<T>(items: &mut [T], dst: usize, src: usize) -> (&mut T, &T) {
    if dst < src {
        let (lo, hi) = items.split_at_mut(src);
        (&mut lo[dst], &hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(dst);
        (&mut hi[0], &lo[src])
    }
}

fn fill_face<P, S, const D: usize>(
    solver: &P,
    link: &FaceLink,
    subface: usize,
    dst: &mut S,
    src: &S,
) -> Result<(), MeshForestError>
where
    P: PatchSolver<D, State = S>,
{
    match link.neighbor_type {
        NeighborType::SameSize => solver.copy_face(dst, link.face, src),
        NeighborType::HalfSize => solver.average_face(dst, link.face, subface, src),
        NeighborType::DoubleSize => solver.interpolate_face(dst, link.face, subface, src),
        NeighborType::Boundary => Ok(()),
    }
}

impl<S, const D: usize> GhostExchange<S, D> {
    /// Build the pattern for the current generation of `domain`. Collective.
    pub fn setup<C: Communicator>(domain: &Domain<S, D>, comm: &C) -> Result<Self, MeshForestError> {
        check_generation(comm, "ghost setup", domain.generation())?;
        let pattern = GhostPattern::build(domain)?;
        debug!(
            "ghost setup generation {} on rank {}: {} face links, {} remote sources from {} ranks, sending to {} ranks",
            pattern.generation,
            pattern.rank,
            pattern.links.len(),
            pattern.num_slots,
            pattern.recvs.len(),
            pattern.sends.len()
        );
        let ghosts = (0..pattern.num_slots).map(|_| None).collect();
        Ok(Self {
            pattern,
            ghosts,
            last_time: None,
        })
    }

    pub fn pattern(&self) -> &GhostPattern<D> {
        &self.pattern
    }

    /// Time passed to the most recent update.
    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// Received copy of a remote patch, if the last update transferred it.
    pub fn ghost(&self, slot: usize) -> Option<&S> {
        self.ghosts.get(slot).and_then(Option::as_ref)
    }

    /// Fill the ghost faces of local patches at levels `min_level..=max_level`.
    /// Collective; every rank must pass the same levels and flag.
    ///
    /// Same-size and finer neighbours are applied first, coarser neighbours
    /// second. Without `interpolate` any face across a level jump is an
    /// error on every rank.
    #[allow(clippy::too_many_arguments)]
    pub fn update<C, P>(
        &mut self,
        domain: &mut Domain<S, D>,
        comm: &C,
        solver: &P,
        min_level: u8,
        max_level: u8,
        time: f64,
        interpolate: bool,
    ) -> Result<GhostStats, MeshForestError>
    where
        C: Communicator,
        P: PatchSolver<D, State = S>,
    {
        if !domain.is_setup() {
            return Err(MeshForestError::DomainNotSetUp(domain.generation()));
        }
        if self.pattern.generation != domain.generation() {
            return Err(MeshForestError::StaleGhostPattern {
                pattern: self.pattern.generation,
                domain: domain.generation(),
            });
        }
        let generation = domain.generation();
        check_agreement(
            comm,
            "ghost update",
            &[generation, min_level as u64, max_level as u64, interpolate as u64],
        )?;
        let levels = level_mask(min_level, max_level);
        let wanted = |level: u8| levels & (1u64 << level) != 0;

        if !interpolate {
            let local = self.pattern.links.iter().find(|l| {
                wanted(l.level) && l.neighbor_type != NeighborType::SameSize
            });
            let failing = all_reduce_sum_u64(comm, local.is_some() as u64)?;
            if let Some(l) = local {
                return Err(MeshForestError::LevelMismatch {
                    patch: domain.patches()[l.patch].info().global_index,
                    face: l.face.index(),
                    level: l.level,
                    neighbor_level: l.neighbor_level,
                });
            }
            if failing > 0 {
                return Err(MeshForestError::CollectiveMismatch {
                    operation: "ghost update",
                    detail: format!("level jumps without interpolation on {failing} ranks"),
                });
            }
        }
        if let Some(p) = domain.patches().iter().find(|p| !p.is_initialized()) {
            return Err(MeshForestError::UninitializedPatch(p.info().global_index));
        }

        let mut stats = GhostStats::default();
        let patches = domain.patches_mut();

        let mut sends = BTreeMap::new();
        for (&rank, entries) in &self.pattern.sends {
            let states = entries
                .iter()
                .filter(|(_, mask)| mask & levels != 0)
                .map(|&(local, _)| {
                    let p = &patches[local];
                    Ok(WireState {
                        patch: p.info().global_index,
                        age: p.age(),
                        payload: solver.pack(p.state()?),
                    })
                })
                .collect::<Result<Vec<_>, MeshForestError>>()?;
            if !states.is_empty() {
                stats.sent += states.len();
                sends.insert(rank, encode_states(KIND_GHOST, generation, &states));
            }
        }
        let recv_from: BTreeSet<usize> = self
            .pattern
            .recvs
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.levels & levels != 0))
            .map(|(&r, _)| r)
            .collect();
        let received = exchange_ordered(comm, CommTag::GHOST, &sends, &recv_from)?;
        for (rank, buf) in received {
            let states = decode_states(rank, KIND_GHOST, generation, &buf)?;
            let expected: Vec<&RecvEntry<D>> = self
                .pattern
                .recv_entries(rank)
                .iter()
                .filter(|e| e.levels & levels != 0)
                .collect();
            if states.len() != expected.len() {
                return Err(MeshForestError::WireFormat {
                    neighbor: rank,
                    reason: format!("{} ghost patches, expected {}", states.len(), expected.len()),
                });
            }
            for (ws, entry) in states.into_iter().zip(expected) {
                if ws.patch != entry.global {
                    return Err(MeshForestError::WireFormat {
                        neighbor: rank,
                        reason: format!("ghost patch {} where {} was expected", ws.patch, entry.global),
                    });
                }
                self.ghosts[entry.slot] = Some(solver.unpack(&entry.info, BuildMode::ForGhost, &ws.payload)?);
                stats.received += 1;
            }
        }

        let passes: [&[NeighborType]; 2] = [
            &[NeighborType::SameSize, NeighborType::HalfSize],
            &[NeighborType::DoubleSize],
        ];
        for pass in passes {
            for link in self
                .pattern
                .links
                .iter()
                .filter(|l| wanted(l.level) && pass.contains(&l.neighbor_type))
            {
                for &(subface, source) in &link.sources {
                    match source {
                        GhostSource::Remote(slot) => {
                            let src = self.ghosts[slot].as_ref().ok_or_else(|| {
                                MeshForestError::InvariantViolation(format!(
                                    "ghost slot {slot} was not received"
                                ))
                            })?;
                            let dst = patches[link.patch].state_mut()?;
                            fill_face::<P, S, D>(solver, link, subface, dst, src)?;
                            stats.remote_faces += 1;
                        }
                        GhostSource::Local(l) if l == link.patch => {
                            let p = &patches[l];
                            let snapshot = solver.unpack(p.info(), BuildMode::ForGhost, &solver.pack(p.state()?))?;
                            fill_face::<P, S, D>(solver, link, subface, patches[l].state_mut()?, &snapshot)?;
                            stats.local_faces += 1;
                        }
                        GhostSource::Local(l) => {
                            let (dst, src) = pair_mut(patches, link.patch, l);
                            fill_face::<P, S, D>(solver, link, subface, dst.state_mut()?, src.state()?)?;
                            stats.local_faces += 1;
                        }
                    }
                }
            }
        }
        self.last_time = Some(time);
        debug!(
            "ghost update generation {} levels {}..={} at t = {}: {} local faces, {} remote faces, sent {}, received {}",
            generation, min_level, max_level, time, stats.local_faces, stats.remote_faces, stats.sent, stats.received
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::config::AmrOptions;
    use crate::domain::repopulate;
    use crate::forest::Connectivity;
    use crate::map::MapContext;
    use crate::solver::Tag;
    use crate::solver::testing::CountingSolver;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn domain(conn: Connectivity<2>, level: u8, solver: &CountingSolver) -> Domain<Vec<f64>, 2> {
        let mut d = Domain::new_uniform(&NoComm, conn, Arc::new(MapContext::nomap()), level).unwrap();
        d.initialize_new(solver).unwrap();
        d.setup(&NoComm).unwrap();
        d
    }

    #[test]
    fn level_masks() {
        assert_eq!(level_mask(0, 0), 1);
        assert_eq!(level_mask(1, 3), 0b1110);
        assert_eq!(level_mask(3, 1), 0);
    }

    #[test]
    fn pair_mut_either_order() {
        let mut v = vec![1, 2, 3];
        let (a, b) = pair_mut(&mut v, 0, 2);
        *a += *b;
        let (a, b) = pair_mut(&mut v, 2, 0);
        *a += *b;
        assert_eq!(v, vec![4, 2, 7]);
    }

    #[test]
    fn serial_pattern_is_all_local() {
        let solver = CountingSolver::default();
        let mut d = domain(Connectivity::unit(), 2, &solver);
        let mut ex = GhostExchange::setup(&d, &NoComm).unwrap();
        assert_eq!(ex.pattern().num_remote(), 0);
        // 16 patches, 4 faces each, 16 on the boundary.
        assert_eq!(ex.pattern().links().len(), 48);
        let stats = ex.update(&mut d, &NoComm, &solver, 2, 2, 0.0, false).unwrap();
        assert_eq!(stats.local_faces, 48);
        assert_eq!(solver.face_fills.load(Ordering::Relaxed), 48);
        assert_eq!(ex.last_time(), Some(0.0));
    }

    #[test]
    fn periodic_single_patch_reads_itself() {
        let solver = CountingSolver::default();
        let mut d = domain(Connectivity::periodic_unit(), 0, &solver);
        let mut ex = GhostExchange::setup(&d, &NoComm).unwrap();
        assert!(ex.pattern().links().iter().all(|l| l.sources == vec![(0, GhostSource::Local(0))]));
        ex.update(&mut d, &NoComm, &solver, 0, 0, 0.0, true).unwrap();
        let s = d.patches()[0].state().unwrap();
        assert_eq!(s[1], 4.0 * s[0]);
    }

    #[test]
    fn level_range_limits_targets() {
        let solver = CountingSolver::default();
        let mut d = domain(Connectivity::unit(), 1, &solver);
        let mut ex = GhostExchange::setup(&d, &NoComm).unwrap();
        let stats = ex.update(&mut d, &NoComm, &solver, 2, 3, 0.0, true).unwrap();
        assert_eq!(stats.local_faces, 0);
    }

    #[test]
    fn stale_pattern_rejected() {
        let solver = CountingSolver::default();
        let mut d = domain(Connectivity::unit(), 1, &solver);
        let mut ex = GhostExchange::setup(&d, &NoComm).unwrap();
        d.patches_mut()[0].set_tag(Tag::Refine);
        let mut next = d.adapt(&NoComm, &AmrOptions::with_levels(1, 2)).unwrap().unwrap();
        repopulate(&mut d, &mut next, &solver, false).unwrap();
        d.reset();
        next.setup(&NoComm).unwrap();
        assert!(matches!(
            ex.update(&mut next, &NoComm, &solver, 1, 2, 0.0, true),
            Err(MeshForestError::StaleGhostPattern { pattern: 0, domain: 1 })
        ));

        let mut ex = GhostExchange::setup(&next, &NoComm).unwrap();
        assert!(matches!(
            ex.update(&mut next, &NoComm, &solver, 1, 2, 0.0, false),
            Err(MeshForestError::LevelMismatch { .. })
        ));
        let stats = ex.update(&mut next, &NoComm, &solver, 1, 2, 0.0, true).unwrap();
        assert!(stats.local_faces > 0);
    }

    #[test]
    fn mixed_levels_use_subfaces() {
        let solver = CountingSolver::default();
        let mut d = domain(Connectivity::unit(), 1, &solver);
        d.patches_mut()[0].set_tag(Tag::Refine);
        let mut next = d.adapt(&NoComm, &AmrOptions::with_levels(1, 2)).unwrap().unwrap();
        repopulate(&mut d, &mut next, &solver, false).unwrap();
        next.setup(&NoComm).unwrap();
        let ex = GhostExchange::setup(&next, &NoComm).unwrap();
        // Leaves: 4 children of the lower-left quadrant, then 3 coarse patches.
        let coarse_west = ex
            .pattern()
            .links()
            .iter()
            .find(|l| l.patch == 4 && l.face == Face::from_index(0))
            .unwrap();
        assert_eq!(coarse_west.neighbor_type, NeighborType::HalfSize);
        assert_eq!(
            coarse_west.sources,
            vec![(0, GhostSource::Local(1)), (1, GhostSource::Local(3))]
        );
        let fine = ex
            .pattern()
            .links()
            .iter()
            .find(|l| l.patch == 3 && l.face == Face::from_index(1))
            .unwrap();
        assert_eq!(fine.neighbor_type, NeighborType::DoubleSize);
        assert_eq!(fine.sources, vec![(1, GhostSource::Local(4))]);
    }
}
