//! Collective adaptation: tag resolution, smoothing, sibling-family
//! coarsening and 2:1 balance.
//!
//! Tags are demoted locally, gathered on every rank, and then resolved by the
//! same deterministic computation everywhere, so all ranks derive the same
//! new forest and the same [`Relation`] for every new leaf.

use super::Domain;
use crate::algs::collective::{all_gather_bytes, check_agreement, check_generation};
use crate::algs::communicator::{CommTag, Communicator};
use crate::config::AmrOptions;
use crate::forest::{Connectivity, Face, FaceNeighbor, Forest, PatchKey, TreeCell};
use crate::mesh_error::MeshForestError;
use crate::solver::Tag;
use hashbrown::HashSet;
use log::{debug, info, warn};
use std::sync::Arc;

/// How a leaf of an adapted forest relates to the forest it came from.
/// Indices are curve positions in the previous forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Relation {
    /// No predecessor; initialized from problem data.
    New,
    /// Same leaf; state moves over.
    Unchanged { old: usize },
    /// Child of `parent`; state is interpolated.
    Refined { parent: usize },
    /// Parent of the family starting at `first_child`; state is restricted.
    Coarsened { first_child: usize },
}

impl Relation {
    /// The previous-forest leaf whose owner inherits this leaf.
    fn source(&self) -> Option<usize> {
        match *self {
            Relation::New => None,
            Relation::Unchanged { old } => Some(old),
            Relation::Refined { parent } => Some(parent),
            Relation::Coarsened { first_child } => Some(first_child),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdaptStats {
    /// Requests dropped before resolution (maxlevel, minlevel, coarsen delay).
    pub demoted: usize,
    /// Refinements added by smoothing.
    pub smoothed: usize,
    /// Leaves refined on request.
    pub refined: usize,
    /// Families that agreed to coarsen and stayed coarsened after balancing.
    pub coarsened_families: usize,
    /// Families where some but not all siblings asked to coarsen.
    pub dissenting_families: usize,
    /// Coarsenings undone to keep 2:1 balance.
    pub reverted_families: usize,
    /// Leaves refined to keep 2:1 balance.
    pub balance_refined: usize,
}

impl<S, const D: usize> Domain<S, D> {
    /// Build the next forest from the current tags. Collective.
    ///
    /// Returns `None` when no leaf changes; every local patch then ages by one
    /// pass, as unchanged patches do when they are repopulated. The returned
    /// domain is not set up and its patches are unbuilt; populate it with
    /// [`repopulate`](super::repopulate) before releasing `self`.
    pub fn adapt<C: Communicator>(
        &mut self,
        comm: &C,
        options: &AmrOptions,
    ) -> Result<Option<Domain<S, D>>, MeshForestError> {
        check_generation(comm, "adapt", self.generation)?;
        check_agreement(
            comm,
            "adapt",
            &[
                options.minlevel as u64,
                options.maxlevel as u64,
                options.coarsen_delay as u64,
                options.smooth_refine as u64,
                options.smooth_refine_level as u64,
            ],
        )?;
        options.validate::<D>()?;
        let mut stats = AdaptStats::default();

        let mut demoted_refine = 0;
        let local: Vec<u8> = self
            .patches
            .iter()
            .map(|p| {
                let level = p.info().level();
                let tag = match p.tag() {
                    Tag::Refine if level >= options.maxlevel => {
                        demoted_refine += 1;
                        Tag::Stay
                    }
                    Tag::Coarsen
                        if level <= options.minlevel || p.age() < options.coarsen_delay =>
                    {
                        stats.demoted += 1;
                        Tag::Stay
                    }
                    t => t,
                };
                tag.to_wire()
            })
            .collect();
        stats.demoted += demoted_refine;
        if demoted_refine > 0 {
            warn!(
                "{demoted_refine} refinement requests at maxlevel {} ignored",
                options.maxlevel
            );
        }

        let gathered = all_gather_bytes(comm, CommTag::TAGS, &local)?;
        let mut tags = Vec::with_capacity(self.forest.leaf_count());
        for (rank, bytes) in gathered.iter().enumerate() {
            let expected = self.offsets[rank + 1] - self.offsets[rank];
            if bytes.len() != expected {
                return Err(MeshForestError::CollectiveMismatch {
                    operation: "adapt",
                    detail: format!("rank {rank} sent {} tags, owns {expected} patches", bytes.len()),
                });
            }
            for &b in bytes {
                tags.push(Tag::from_wire(b).ok_or_else(|| MeshForestError::WireFormat {
                    neighbor: rank,
                    reason: format!("unknown tag value {b}"),
                })?);
            }
        }

        if options.smooth_refine {
            smooth(&self.forest, &mut tags, options, &mut stats)?;
        }
        let plan = resolve(&self.forest, &tags, &self.offsets, &mut stats);
        let (forest, relations) = balance(self.forest.connectivity(), plan, &mut stats)?;
        stats.coarsened_families = relations
            .iter()
            .filter(|r| matches!(r, Relation::Coarsened { .. }))
            .count();

        if relations.iter().all(|r| matches!(r, Relation::Unchanged { .. })) {
            debug!(
                "adapt generation {}: no change ({} demoted, {} dissenting families)",
                self.generation, stats.demoted, stats.dissenting_families
            );
            for patch in &mut self.patches {
                patch.set_age(patch.age() + 1);
            }
            return Ok(None);
        }

        // New leaves stay with the rank owning their source; this keeps the
        // partition contiguous and repopulation local.
        let owners: Vec<usize> = relations
            .iter()
            .map(|r| r.source().map_or(0, |g| self.owner_of(g)))
            .collect();
        if owners.windows(2).any(|w| w[0] > w[1]) {
            return Err(MeshForestError::InvariantViolation(
                "adapted ownership is not contiguous along the curve".into(),
            ));
        }
        let offsets: Vec<usize> = (0..=self.size)
            .map(|r| owners.partition_point(|&o| o < r))
            .collect();

        info!(
            "adapt generation {}: {} -> {} patches ({} refined, {} coarsened, {} balance refinements)",
            self.generation,
            self.forest.leaf_count(),
            forest.leaf_count(),
            stats.refined,
            stats.coarsened_families,
            stats.balance_refined
        );
        debug!("adapt stats: {stats:?}");

        let mut next = Domain::assemble(
            self.generation + 1,
            self.rank,
            self.size,
            Arc::new(forest),
            offsets,
            Arc::new(relations),
            self.map.clone(),
            self.timers.clone(),
        );
        next.adapt_stats = stats;
        Ok(Some(next))
    }
}

/// One layer of same-level neighbours joins every refinement at or above
/// `smooth_refine_level`.
fn smooth<const D: usize>(
    forest: &Forest<D>,
    tags: &mut [Tag],
    options: &AmrOptions,
    stats: &mut AdaptStats,
) -> Result<(), MeshForestError> {
    let leaves = forest.leaves();
    let seeds: Vec<usize> = (0..leaves.len())
        .filter(|&i| tags[i] == Tag::Refine && leaves[i].level() >= options.smooth_refine_level)
        .collect();
    for i in seeds {
        for face in Face::all(D) {
            if let FaceNeighbor::Same(k) = forest.face_neighbor(&leaves[i], face)? {
                let Some(j) = forest.position(&k) else {
                    continue;
                };
                if tags[j] != Tag::Refine && leaves[j].level() < options.maxlevel {
                    tags[j] = Tag::Refine;
                    stats.smoothed += 1;
                }
            }
        }
    }
    Ok(())
}

/// Turn tags into the new leaf list. A family coarsens only if every sibling
/// asked to, all are leaves and one rank owns them all.
fn resolve<const D: usize>(
    forest: &Forest<D>,
    tags: &[Tag],
    offsets: &[usize],
    stats: &mut AdaptStats,
) -> Vec<(PatchKey<D>, Relation)> {
    let owner = |g: usize| offsets.partition_point(|&o| o <= g);
    let leaves = forest.leaves();
    let n = TreeCell::<D>::CHILDREN;
    let mut plan = Vec::with_capacity(leaves.len());
    let mut i = 0;
    while i < leaves.len() {
        if let Some(parent) = forest.family_at(i) {
            let family = &tags[i..i + n];
            if family.iter().all(|t| *t == Tag::Coarsen) && owner(i) == owner(i + n - 1) {
                plan.push((parent, Relation::Coarsened { first_child: i }));
                i += n;
                continue;
            }
            if family.iter().any(|t| *t == Tag::Coarsen) {
                stats.dissenting_families += 1;
            }
        }
        let key = leaves[i];
        if tags[i] == Tag::Refine {
            stats.refined += 1;
            plan.extend(
                key.children()
                    .into_iter()
                    .map(|c| (c, Relation::Refined { parent: i })),
            );
        } else {
            plan.push((key, Relation::Unchanged { old: i }));
        }
        i += 1;
    }
    plan
}

/// Restore 2:1 face balance: undo coarsenings that break it and refine
/// unchanged leaves that are too coarse.
fn balance<const D: usize>(
    connectivity: &Connectivity<D>,
    mut plan: Vec<(PatchKey<D>, Relation)>,
    stats: &mut AdaptStats,
) -> Result<(Forest<D>, Vec<Relation>), MeshForestError> {
    loop {
        let forest = Forest::from_leaves(
            connectivity.clone(),
            plan.iter().map(|(k, _)| *k).collect(),
        )?;
        let bad: HashSet<usize> = forest.imbalanced_leaves().into_iter().collect();
        if bad.is_empty() {
            return Ok((forest, plan.into_iter().map(|(_, r)| r).collect()));
        }
        let mut next = Vec::with_capacity(plan.len() + bad.len() * TreeCell::<D>::CHILDREN);
        for (i, (key, rel)) in plan.into_iter().enumerate() {
            if !bad.contains(&i) {
                next.push((key, rel));
                continue;
            }
            match rel {
                Relation::Coarsened { first_child } => {
                    stats.reverted_families += 1;
                    next.extend(
                        key.children()
                            .into_iter()
                            .enumerate()
                            .map(|(c, child)| (child, Relation::Unchanged { old: first_child + c })),
                    );
                }
                Relation::Unchanged { old } => {
                    stats.balance_refined += 1;
                    next.extend(
                        key.children()
                            .into_iter()
                            .map(|child| (child, Relation::Refined { parent: old })),
                    );
                }
                Relation::Refined { .. } | Relation::New => {
                    return Err(MeshForestError::InvariantViolation(format!(
                        "leaf {key:?} with relation {rel:?} cannot be refined for balance"
                    )));
                }
            }
        }
        plan = next;
    }
}
