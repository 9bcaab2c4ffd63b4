//! Domain: the distributed set of patches at one topology generation.
//!
//! A domain is created uniform or by [`Domain::adapt`], must be
//! [`setup`](Domain::setup) before neighbour-dependent work, and is released
//! with [`Domain::reset`] once its state has been migrated into its
//! successor. Every collective checks that all ranks are at the same
//! generation.

pub mod adapt;
mod partition;
mod repopulate;
pub mod timers;

pub use adapt::{AdaptStats, Relation};
pub use partition::PartitionStats;
pub use repopulate::{RepopulateStats, repopulate};
pub use timers::{TimerKind, Timers};

use crate::algs::collective::check_generation;
use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::forest::{Connectivity, Face, FaceNeighbor, Forest, PatchKey};
use crate::ghost::NeighborType;
use crate::map::MapContext;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, Patch, PatchInfo};
use crate::solver::{PatchSolver, RefineCriterion, Tag};
use log::debug;
use std::ops::Range;
use std::sync::Arc;

/// Classification of one face of a local patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaceConnection {
    pub face: Face,
    pub neighbor_type: NeighborType,
    /// Curve positions of the neighbours; finer neighbours are in subface order.
    pub neighbors: Vec<usize>,
}

/// Which patches an iteration visits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchSelector {
    All,
    Level(u8),
    /// Patches created by refinement or coarsening in the last adaptation.
    Adapted,
}

impl PatchSelector {
    fn matches<const D: usize>(&self, info: &PatchInfo<D>, relations: &[Relation]) -> bool {
        match self {
            PatchSelector::All => true,
            PatchSelector::Level(l) => info.level() == *l,
            PatchSelector::Adapted => matches!(
                relations.get(info.global_index),
                Some(Relation::Refined { .. } | Relation::Coarsened { .. })
            ),
        }
    }
}

/// Tag totals from one tagging pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TagCounts {
    pub refine: usize,
    pub coarsen: usize,
    pub stay: usize,
}

#[derive(Debug)]
pub struct Domain<S, const D: usize> {
    generation: u64,
    rank: usize,
    size: usize,
    forest: Arc<Forest<D>>,
    /// `offsets[r]..offsets[r + 1]` are the curve positions owned by rank `r`.
    offsets: Vec<usize>,
    patches: Vec<Patch<S, D>>,
    /// How each leaf of the forest came to be, indexed by curve position.
    relations: Arc<Vec<Relation>>,
    map: Arc<MapContext>,
    is_setup: bool,
    connections: Vec<Vec<FaceConnection>>,
    global_min_level: u8,
    global_max_level: u8,
    timers: Timers,
    adapt_stats: AdaptStats,
}

impl<S, const D: usize> Domain<S, D> {
    /// Every block refined uniformly to `level`, split evenly across ranks.
    /// Patches start unbuilt with relation [`Relation::New`].
    pub fn new_uniform<C: Communicator>(
        comm: &C,
        connectivity: Connectivity<D>,
        map: Arc<MapContext>,
        level: u8,
    ) -> Result<Self, MeshForestError> {
        if let Some(n) = map.expected_blocks() {
            if n != connectivity.num_blocks() {
                return Err(MeshForestError::InvalidConnectivity(format!(
                    "map expects {n} blocks, connectivity has {}",
                    connectivity.num_blocks()
                )));
            }
        }
        let forest = Arc::new(Forest::uniform(connectivity, level)?);
        let n = forest.leaf_count();
        let size = comm.size();
        let offsets: Vec<usize> = (0..=size).map(|r| r * n / size).collect();
        let relations = Arc::new(vec![Relation::New; n]);
        Ok(Self::assemble(
            0,
            comm.rank(),
            size,
            forest,
            offsets,
            relations,
            map,
            Timers::default(),
        ))
    }

    /// Local patches for `rank` over `forest`, all unbuilt.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        generation: u64,
        rank: usize,
        size: usize,
        forest: Arc<Forest<D>>,
        offsets: Vec<usize>,
        relations: Arc<Vec<Relation>>,
        map: Arc<MapContext>,
        timers: Timers,
    ) -> Self {
        let range = offsets[rank]..offsets[rank + 1];
        let patches = range
            .clone()
            .map(|g| {
                let key = forest.leaves()[g];
                Patch::new(PatchInfo::new(&forest, key, g, g - range.start, rank))
            })
            .collect();
        Self {
            generation,
            rank,
            size,
            global_min_level: forest.min_level(),
            global_max_level: forest.max_level(),
            forest,
            offsets,
            patches,
            relations,
            map,
            is_setup: false,
            connections: Vec::new(),
            timers,
            adapt_stats: AdaptStats::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn forest(&self) -> &Arc<Forest<D>> {
        &self.forest
    }

    pub fn map(&self) -> &Arc<MapContext> {
        &self.map
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Curve positions owned by this rank.
    pub fn local_range(&self) -> Range<usize> {
        self.offsets[self.rank]..self.offsets[self.rank + 1]
    }

    pub fn num_global_patches(&self) -> usize {
        self.forest.leaf_count()
    }

    pub fn num_local_patches(&self) -> usize {
        self.patches.len()
    }

    pub fn patches(&self) -> &[Patch<S, D>] {
        &self.patches
    }

    pub fn patches_mut(&mut self) -> &mut [Patch<S, D>] {
        &mut self.patches
    }

    /// Rank owning curve position `global`.
    pub fn owner_of(&self, global: usize) -> usize {
        self.offsets
            .partition_point(|&o| o <= global)
            .saturating_sub(1)
            .min(self.size - 1)
    }

    /// Local index of curve position `global`, if this rank owns it.
    pub fn local_index_of(&self, global: usize) -> Option<usize> {
        self.local_range()
            .contains(&global)
            .then(|| global - self.offsets[self.rank])
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation(&self, global: usize) -> Option<Relation> {
        self.relations.get(global).copied()
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub fn global_min_level(&self) -> u8 {
        self.global_min_level
    }

    pub fn global_max_level(&self) -> u8 {
        self.global_max_level
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Statistics of the adaptation that produced this domain.
    pub fn adapt_stats(&self) -> &AdaptStats {
        &self.adapt_stats
    }

    /// Face classification of local patch `local`. Requires `setup`.
    pub fn connections(&self, local: usize) -> Result<&[FaceConnection], MeshForestError> {
        if !self.is_setup {
            return Err(MeshForestError::DomainNotSetUp(self.generation));
        }
        self.connections
            .get(local)
            .map(Vec::as_slice)
            .ok_or_else(|| MeshForestError::InvariantViolation(format!("no local patch {local}")))
    }

    /// Classify every face of every local patch. Collective.
    pub fn setup<C: Communicator>(&mut self, comm: &C) -> Result<(), MeshForestError> {
        check_generation(comm, "setup", self.generation)?;
        if comm.rank() != self.rank || comm.size() != self.size {
            return Err(MeshForestError::CollectiveMismatch {
                operation: "setup",
                detail: format!(
                    "domain built for rank {}/{} used on rank {}/{}",
                    self.rank,
                    self.size,
                    comm.rank(),
                    comm.size()
                ),
            });
        }
        let forest = &self.forest;
        let position = |k: &PatchKey<D>| {
            forest.position(k).ok_or_else(|| {
                MeshForestError::InvariantViolation(format!("neighbour {k:?} is not a leaf"))
            })
        };
        let mut connections = Vec::with_capacity(self.patches.len());
        let mut counts = [0usize; 4];
        for patch in &self.patches {
            let key = patch.info().key;
            let mut faces = Vec::with_capacity(2 * D);
            for face in Face::all(D) {
                let (neighbor_type, neighbors) = match forest.face_neighbor(&key, face)? {
                    FaceNeighbor::Boundary => (NeighborType::Boundary, Vec::new()),
                    FaceNeighbor::Same(k) => (NeighborType::SameSize, vec![position(&k)?]),
                    FaceNeighbor::Coarser(k) => (NeighborType::DoubleSize, vec![position(&k)?]),
                    FaceNeighbor::Finer(ks) => (
                        NeighborType::HalfSize,
                        ks.iter().map(&position).collect::<Result<_, _>>()?,
                    ),
                };
                counts[neighbor_type as usize] += 1;
                faces.push(FaceConnection {
                    face,
                    neighbor_type,
                    neighbors,
                });
            }
            connections.push(faces);
        }
        self.connections = connections;
        self.global_min_level = forest.min_level();
        self.global_max_level = forest.max_level();
        self.is_setup = true;
        debug!(
            "setup generation {}: {} local patches, faces same/double/half/boundary = {:?}",
            self.generation,
            self.patches.len(),
            counts
        );
        crate::debug_invariants!(self.validate_invariants(), "Domain::setup");
        Ok(())
    }

    /// Visit selected local patches in curve order.
    pub fn iterate<F>(&self, selector: PatchSelector, mut f: F)
    where
        F: FnMut(&Patch<S, D>),
    {
        for patch in &self.patches {
            if selector.matches(patch.info(), &self.relations) {
                f(patch);
            }
        }
    }

    /// Visit selected local patches mutably in curve order; stops at the first error.
    pub fn iterate_mut<F>(&mut self, selector: PatchSelector, mut f: F) -> Result<(), MeshForestError>
    where
        F: FnMut(&mut Patch<S, D>) -> Result<(), MeshForestError>,
    {
        let relations = &self.relations;
        for patch in &mut self.patches {
            if selector.matches(patch.info(), relations) {
                f(patch)?;
            }
        }
        Ok(())
    }

    /// Visit selected local patches on the rayon pool. `f` may touch only
    /// the patch it is given.
    #[cfg(feature = "rayon")]
    pub fn par_iterate_mut<F>(&mut self, selector: PatchSelector, f: F) -> Result<(), MeshForestError>
    where
        F: Fn(&mut Patch<S, D>) -> Result<(), MeshForestError> + Sync + Send,
        S: Send,
    {
        use rayon::prelude::*;
        let relations = &self.relations;
        self.patches
            .par_iter_mut()
            .filter(|p| selector.matches(p.info(), relations))
            .try_for_each(f)
    }

    /// Build and initialize every unbuilt local patch whose relation is [`Relation::New`].
    pub fn initialize_new<P>(&mut self, solver: &P) -> Result<usize, MeshForestError>
    where
        P: PatchSolver<D, State = S>,
    {
        let mut count = 0;
        let relations = &self.relations;
        for patch in &mut self.patches {
            if relations.get(patch.info().global_index) == Some(&Relation::New) {
                patch.build(solver, BuildMode::ForUpdate)?;
                patch.initialize(solver)?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Ask `criterion` for a tag on every local patch (only on `level` if given).
    /// While `initializing`, patches may only refine.
    pub fn tag_patches<R>(
        &mut self,
        criterion: &R,
        initializing: bool,
        level: Option<u8>,
    ) -> Result<TagCounts, MeshForestError>
    where
        R: RefineCriterion<S, D>,
    {
        let mut counts = TagCounts::default();
        for patch in &mut self.patches {
            let tag = match level {
                Some(l) if patch.info().level() != l => Tag::Stay,
                _ => match criterion.tag(patch.info(), patch.state()?, initializing)? {
                    Tag::Coarsen if initializing => Tag::Stay,
                    tag => tag,
                },
            };
            patch.set_tag(tag);
            match tag {
                Tag::Refine => counts.refine += 1,
                Tag::Coarsen => counts.coarsen += 1,
                Tag::Stay => counts.stay += 1,
            }
        }
        debug!(
            "tagged generation {}: {} refine, {} coarsen, {} stay",
            self.generation, counts.refine, counts.coarsen, counts.stay
        );
        Ok(counts)
    }

    /// Release every patch of a superseded domain.
    pub fn reset(mut self) {
        for patch in &mut self.patches {
            patch.destroy();
        }
        debug!(
            "reset generation {} ({} local patches)",
            self.generation,
            self.patches.len()
        );
    }
}

impl<S, const D: usize> DebugInvariants for Domain<S, D> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Domain");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        if self.offsets.len() != self.size + 1
            || self.offsets.first() != Some(&0)
            || self.offsets.last() != Some(&self.forest.leaf_count())
            || self.offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(MeshForestError::InvariantViolation(format!(
                "partition offsets {:?} do not cover {} leaves",
                self.offsets,
                self.forest.leaf_count()
            )));
        }
        if self.relations.len() != self.forest.leaf_count() {
            return Err(MeshForestError::InvariantViolation(format!(
                "{} relations for {} leaves",
                self.relations.len(),
                self.forest.leaf_count()
            )));
        }
        let start = self.offsets[self.rank];
        for (i, patch) in self.patches.iter().enumerate() {
            let info = patch.info();
            if info.global_index != start + i
                || info.local_index != i
                || info.owner != self.rank
                || self.forest.leaves().get(info.global_index) != Some(&info.key)
            {
                return Err(MeshForestError::InvariantViolation(format!(
                    "local patch {i} has inconsistent placement {info:?}"
                )));
            }
        }
        Ok(())
    }
}
