//! Move, interpolate, restrict or initialize state into an adapted domain.

use super::{Domain, Relation};
use crate::forest::TreeCell;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, PatchInfo, PatchStatus};
use crate::solver::PatchSolver;
use log::debug;

/// How many new patches were filled by each relation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepopulateStats {
    pub unchanged: usize,
    pub refined: usize,
    pub coarsened: usize,
    pub new: usize,
}

impl RepopulateStats {
    pub fn total(&self) -> usize {
        self.unchanged + self.refined + self.coarsened + self.new
    }
}

/// Populate every local patch of `new` exactly once from `old`.
///
/// Unchanged patches take their predecessor's state, refined patches are
/// interpolated from their parent (or initialized from problem data when
/// `initializing`), coarsened patches are restricted from their children and
/// patches without a predecessor are initialized. `old` keeps its refined
/// parents and coarsened children until it is [`reset`](Domain::reset).
pub fn repopulate<S, P, const D: usize>(
    old: &mut Domain<S, D>,
    new: &mut Domain<S, D>,
    solver: &P,
    initializing: bool,
) -> Result<RepopulateStats, MeshForestError>
where
    P: PatchSolver<D, State = S>,
{
    if new.generation != old.generation + 1 || new.rank != old.rank || new.size != old.size {
        return Err(MeshForestError::InvariantViolation(format!(
            "cannot repopulate generation {} (rank {}) from generation {} (rank {})",
            new.generation, new.rank, old.generation, old.rank
        )));
    }
    let old_rank = old.rank;
    let old_start = old.offsets[old_rank];
    let old_len = old.patches.len();
    let local_old = |g: usize, count: usize| -> Result<usize, MeshForestError> {
        g.checked_sub(old_start)
            .filter(|&l| l + count <= old_len)
            .ok_or_else(|| {
                MeshForestError::InvariantViolation(format!(
                    "source patch {g} is not owned by rank {old_rank}"
                ))
            })
    };

    let mut stats = RepopulateStats::default();
    for i in 0..new.patches.len() {
        let global = new.patches[i].info().global_index;
        let relation = new.relations[global];
        let patch = &mut new.patches[i];
        if patch.status() != PatchStatus::Unbuilt {
            return Err(MeshForestError::RepopulateIncomplete {
                patch: global,
                reason: "was populated twice",
            });
        }
        match relation {
            Relation::Unchanged { old: g } => {
                let src = &mut old.patches[local_old(g, 1)?];
                let age = src.age();
                let mode = src.build_mode().unwrap_or(BuildMode::ForUpdate);
                patch.adopt(src.take_state()?, mode)?;
                patch.set_age(age + 1);
                stats.unchanged += 1;
            }
            Relation::Refined { parent } => {
                patch.build(solver, BuildMode::ForUpdate)?;
                if initializing {
                    patch.initialize(solver)?;
                } else {
                    let src = &old.patches[local_old(parent, 1)?];
                    let (src_info, src_state) = (src.info(), src.state()?);
                    patch.fill(|info, state| solver.interpolate(src_info, src_state, info, state))?;
                }
                stats.refined += 1;
            }
            Relation::Coarsened { first_child } => {
                let n = TreeCell::<D>::CHILDREN;
                let l = local_old(first_child, n)?;
                let children = old.patches[l..l + n]
                    .iter()
                    .map(|c| c.state().map(|s| (c.info(), s)))
                    .collect::<Result<Vec<(&PatchInfo<D>, &S)>, MeshForestError>>()?;
                patch.build(solver, BuildMode::ForUpdate)?;
                patch.fill(|info, state| solver.restrict(&children, info, state))?;
                stats.coarsened += 1;
            }
            Relation::New => {
                patch.build(solver, BuildMode::ForUpdate)?;
                patch.initialize(solver)?;
                stats.new += 1;
            }
        }
    }

    if let Some(p) = new.patches.iter().find(|p| !p.is_initialized()) {
        return Err(MeshForestError::RepopulateIncomplete {
            patch: p.info().global_index,
            reason: "was left unpopulated",
        });
    }
    debug!(
        "repopulated generation {}: {} unchanged, {} refined, {} coarsened, {} new",
        new.generation, stats.unchanged, stats.refined, stats.coarsened, stats.new
    );
    Ok(stats)
}
