//! Collaborator interfaces the orchestration core drives.
//!
//! The core never looks inside solver state. It asks a [`PatchSolver`] to
//! allocate, initialize, interpolate, restrict, fill ghost faces and
//! serialize state, a [`RefineCriterion`] to tag patches, a [`PhysicalBc`]
//! to fill physical boundaries, and an optional [`OutputWriter`] to record
//! snapshots.

pub mod scalar;
#[cfg(test)]
pub(crate) mod testing;

use crate::domain::Domain;
use crate::forest::Face;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, PatchInfo};

/// Refinement request for one patch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Tag {
    #[default]
    Stay,
    Refine,
    Coarsen,
}

impl Tag {
    pub fn to_wire(self) -> u8 {
        match self {
            Tag::Stay => 0,
            Tag::Refine => 1,
            Tag::Coarsen => 2,
        }
    }

    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Tag::Stay),
            1 => Some(Tag::Refine),
            2 => Some(Tag::Coarsen),
            _ => None,
        }
    }
}

/// Numerical kernel owning per-patch state.
///
/// Face operations fill the ghost layer of `dst` along `dst_face` from the
/// interior of a neighbour. `subface` is the position of the finer of the
/// two patches along the shared face (see
/// [`TreeCell::subface_index`](crate::forest::TreeCell::subface_index)).
pub trait PatchSolver<const D: usize>: Send + Sync {
    type State: Send;

    fn build(&self, info: &PatchInfo<D>, mode: BuildMode) -> Result<Self::State, MeshForestError>;

    /// Set the initial condition.
    fn initialize(&self, info: &PatchInfo<D>, state: &mut Self::State) -> Result<(), MeshForestError>;

    /// Fill a child from its parent.
    fn interpolate(
        &self,
        coarse_info: &PatchInfo<D>,
        coarse: &Self::State,
        fine_info: &PatchInfo<D>,
        fine: &mut Self::State,
    ) -> Result<(), MeshForestError>;

    /// Fill a parent from its `2^D` children, given in child order.
    fn restrict(
        &self,
        fine: &[(&PatchInfo<D>, &Self::State)],
        coarse_info: &PatchInfo<D>,
        coarse: &mut Self::State,
    ) -> Result<(), MeshForestError>;

    /// Same-level ghost fill.
    fn copy_face(
        &self,
        dst: &mut Self::State,
        dst_face: Face,
        src: &Self::State,
    ) -> Result<(), MeshForestError>;

    /// Fill part of a coarse ghost face by averaging a finer neighbour.
    fn average_face(
        &self,
        dst: &mut Self::State,
        dst_face: Face,
        subface: usize,
        src: &Self::State,
    ) -> Result<(), MeshForestError>;

    /// Fill a fine ghost face by interpolating a coarser neighbour.
    fn interpolate_face(
        &self,
        dst: &mut Self::State,
        dst_face: Face,
        subface: usize,
        src: &Self::State,
    ) -> Result<(), MeshForestError>;

    /// Serialize the interior for migration or ghost transfer.
    fn pack(&self, state: &Self::State) -> Vec<u8>;

    fn unpack(
        &self,
        info: &PatchInfo<D>,
        mode: BuildMode,
        bytes: &[u8],
    ) -> Result<Self::State, MeshForestError>;

    /// Advance one step; returns the patch CFL number.
    fn compute_update(
        &self,
        info: &PatchInfo<D>,
        state: &mut Self::State,
        t: f64,
        dt: f64,
    ) -> Result<f64, MeshForestError>;
}

/// Decides REFINE / COARSEN / STAY per patch.
pub trait RefineCriterion<S, const D: usize> {
    fn tag(&self, info: &PatchInfo<D>, state: &S, initializing: bool) -> Result<Tag, MeshForestError>;
}

impl<S, const D: usize, F> RefineCriterion<S, D> for F
where
    F: Fn(&PatchInfo<D>, &S, bool) -> Tag,
{
    fn tag(&self, info: &PatchInfo<D>, state: &S, initializing: bool) -> Result<Tag, MeshForestError> {
        Ok(self(info, state, initializing))
    }
}

/// Fills ghost cells on physical boundaries.
pub trait PhysicalBc<S, const D: usize> {
    fn apply(&self, info: &PatchInfo<D>, state: &mut S, t: f64) -> Result<(), MeshForestError>;
}

/// Leaves physical ghost cells untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBc;

impl<S, const D: usize> PhysicalBc<S, D> for NoBc {
    fn apply(&self, _info: &PatchInfo<D>, _state: &mut S, _t: f64) -> Result<(), MeshForestError> {
        Ok(())
    }
}

/// Consumes domain snapshots.
pub trait OutputWriter<S, const D: usize> {
    fn write(&mut self, domain: &Domain<S, D>, label: &str) -> Result<(), MeshForestError>;
}
