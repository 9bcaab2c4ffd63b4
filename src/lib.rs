#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-forest
//!
//! mesh-forest is the orchestration core of a parallel adaptive block-structured
//! mesh code. A forest of quadtrees (or octrees) covers a set of logical blocks;
//! every leaf carries a patch of solver state. The crate drives the adaptation
//! loop (tag, adapt, repopulate, repartition), fills ghost layers across
//! process and refinement boundaries, and maps block-logical coordinates to
//! physical space.
//!
//! ## Features
//! - Replicated space-filling-curve ordered forest with 2:1 face balance
//! - Domain generations with exactly-once repopulation of adapted patches
//! - Weighted contiguous repartitioning with state migration
//! - Ghost exchange with same-level copy, fine-to-coarse averaging and
//!   coarse-to-fine interpolation
//! - Coordinate maps: identity, scaled shift, torus, pillow sphere, cubed sphere
//!   and externally supplied transforms
//! - Pluggable communication backends: serial, in-process threads, MPI
//!
//! ## SPMD model
//!
//! Every process runs the same sequence of collective calls (`setup`, `adapt`,
//! `partition`, ghost `setup`/`update`). Each collective first checks that all
//! processes are at the same domain generation. A fatal error (see
//! [`MeshForestError::is_fatal`](mesh_error::MeshForestError::is_fatal)) means
//! the run must be abandoned.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-forest = "0.3"
//! # features = ["mpi-support", "strict-invariants"]
//! ```

pub mod algs;
pub mod amr;
pub mod config;
pub mod debug_invariants;
pub mod domain;
pub mod forest;
pub mod ghost;
pub mod map;
pub mod mesh_error;
pub mod patch;
pub mod solver;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::amr::{Simulation, StepReport};
    pub use crate::config::AmrOptions;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::domain::{Domain, PatchSelector, Relation, repopulate};
    pub use crate::forest::{Connectivity, Face, Forest, OctForest, PatchKey, QuadForest, TreeCell};
    pub use crate::ghost::{GhostExchange, NeighborType};
    pub use crate::map::{MapContext, MapQuery};
    pub use crate::mesh_error::MeshForestError;
    pub use crate::patch::{BuildMode, Patch, PatchInfo, PatchStatus};
    pub use crate::solver::{NoBc, OutputWriter, PatchSolver, PhysicalBc, RefineCriterion, Tag};
}
