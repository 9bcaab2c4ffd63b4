//! Patch: one leaf of the forest together with its solver state.

use crate::forest::{Face, Forest, PatchKey};
use crate::map::MapContext;
use crate::mesh_error::MeshForestError;
use crate::solver::{PatchSolver, Tag};

/// How much storage a patch build allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Full state including ghost layers; the patch is advanced in time.
    ForUpdate,
    /// Interior data only; the patch is a read-only ghost copy.
    ForGhost,
}

/// Lifecycle state of a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PatchStatus {
    Unbuilt,
    Built,
    Initialized,
    Destroyed,
}

impl PatchStatus {
    pub fn name(&self) -> &'static str {
        match self {
            PatchStatus::Unbuilt => "unbuilt",
            PatchStatus::Built => "built",
            PatchStatus::Initialized => "initialized",
            PatchStatus::Destroyed => "destroyed",
        }
    }
}

/// Placement and geometry of a patch.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchInfo<const D: usize> {
    pub key: PatchKey<D>,
    /// Position along the forest's space-filling curve.
    pub global_index: usize,
    /// Position among the patches owned by `owner`.
    pub local_index: usize,
    /// Position among the patches of the same block.
    pub block_index: usize,
    pub owner: usize,
    /// Block-logical lower corner.
    pub lower: [f64; D],
    /// Block-logical upper corner.
    pub upper: [f64; D],
    boundary_faces: u32,
}

impl<const D: usize> PatchInfo<D> {
    pub fn new(
        forest: &Forest<D>,
        key: PatchKey<D>,
        global_index: usize,
        local_index: usize,
        owner: usize,
    ) -> Self {
        let block_index = global_index - forest.block_range(key.block).start;
        let boundary_faces = Face::all(D)
            .filter(|f| forest.adjacent_cell(&key, *f).is_none())
            .fold(0, |mask, f| mask | (1 << f.index()));
        Self {
            key,
            global_index,
            local_index,
            block_index,
            owner,
            lower: key.cell.lower(),
            upper: key.cell.upper(),
            boundary_faces,
        }
    }

    pub fn level(&self) -> u8 {
        self.key.level()
    }

    pub fn block(&self) -> u32 {
        self.key.block
    }

    /// Edge length in block-logical coordinates.
    pub fn width(&self) -> f64 {
        self.key.cell.width()
    }

    /// Whether `face` lies on the physical boundary.
    pub fn is_boundary(&self, face: Face) -> bool {
        self.boundary_faces & (1 << face.index()) != 0
    }

    /// Physical image of a block-logical point in the patch's first two axes.
    pub fn physical_point(
        &self,
        map: &MapContext,
        xc: f64,
        yc: f64,
    ) -> Result<[f64; 3], MeshForestError> {
        map.mapc2m(self.key.block, xc, yc)
    }

    /// Physical image of the patch center.
    pub fn physical_center(&self, map: &MapContext) -> Result<[f64; 3], MeshForestError> {
        let xc = 0.5 * (self.lower[0] + self.upper[0]);
        let yc = if D > 1 {
            0.5 * (self.lower[1] + self.upper[1])
        } else {
            0.0
        };
        self.physical_point(map, xc, yc)
    }

    /// Physical images of the four corners spanned by the first two axes.
    pub fn physical_corners(&self, map: &MapContext) -> Result<[[f64; 3]; 4], MeshForestError> {
        let (y0, y1) = if D > 1 {
            (self.lower[1], self.upper[1])
        } else {
            (0.0, 0.0)
        };
        Ok([
            self.physical_point(map, self.lower[0], y0)?,
            self.physical_point(map, self.upper[0], y0)?,
            self.physical_point(map, self.lower[0], y1)?,
            self.physical_point(map, self.upper[0], y1)?,
        ])
    }
}

/// A leaf of the current domain and the solver state it owns.
#[derive(Debug)]
pub struct Patch<S, const D: usize> {
    info: PatchInfo<D>,
    status: PatchStatus,
    state: Option<S>,
    build_mode: Option<BuildMode>,
    tag: Tag,
    age: u32,
}

impl<S, const D: usize> Patch<S, D> {
    pub fn new(info: PatchInfo<D>) -> Self {
        Self {
            info,
            status: PatchStatus::Unbuilt,
            state: None,
            build_mode: None,
            tag: Tag::Stay,
            age: 0,
        }
    }

    pub fn info(&self) -> &PatchInfo<D> {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut PatchInfo<D> {
        &mut self.info
    }

    pub fn status(&self) -> PatchStatus {
        self.status
    }

    pub fn build_mode(&self) -> Option<BuildMode> {
        self.build_mode
    }

    pub fn is_initialized(&self) -> bool {
        self.status == PatchStatus::Initialized
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    /// Adaptation passes survived since the patch was created.
    pub fn age(&self) -> u32 {
        self.age
    }

    pub(crate) fn set_age(&mut self, age: u32) {
        self.age = age;
    }

    fn require(&self, expected: PatchStatus, operation: &'static str) -> Result<(), MeshForestError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(MeshForestError::PatchStateViolation {
                index: self.info.global_index,
                operation,
                state: self.status.name(),
            })
        }
    }

    /// Allocate solver state. Requires `Unbuilt`.
    pub fn build<P>(&mut self, solver: &P, mode: BuildMode) -> Result<(), MeshForestError>
    where
        P: PatchSolver<D, State = S>,
    {
        self.require(PatchStatus::Unbuilt, "build")?;
        self.state = Some(solver.build(&self.info, mode)?);
        self.build_mode = Some(mode);
        self.status = PatchStatus::Built;
        Ok(())
    }

    /// Set the initial condition. Requires `Built`.
    pub fn initialize<P>(&mut self, solver: &P) -> Result<(), MeshForestError>
    where
        P: PatchSolver<D, State = S>,
    {
        self.fill(|info, state| solver.initialize(info, state))
    }

    /// Populate a built patch with `f` (interpolation, restriction, ...).
    /// Requires `Built`; leaves the patch `Initialized`.
    pub fn fill<F>(&mut self, f: F) -> Result<(), MeshForestError>
    where
        F: FnOnce(&PatchInfo<D>, &mut S) -> Result<(), MeshForestError>,
    {
        self.require(PatchStatus::Built, "initialize")?;
        let state = self
            .state
            .as_mut()
            .ok_or(MeshForestError::UninitializedPatch(self.info.global_index))?;
        f(&self.info, state)?;
        self.status = PatchStatus::Initialized;
        Ok(())
    }

    /// Adopt already initialized state moved from another patch. Requires `Unbuilt`.
    pub fn adopt(&mut self, state: S, mode: BuildMode) -> Result<(), MeshForestError> {
        self.require(PatchStatus::Unbuilt, "adopt")?;
        self.state = Some(state);
        self.build_mode = Some(mode);
        self.status = PatchStatus::Initialized;
        Ok(())
    }

    /// Release the state. Idempotent.
    pub fn destroy(&mut self) {
        self.state = None;
        if self.status != PatchStatus::Unbuilt {
            self.status = PatchStatus::Destroyed;
        }
    }

    pub fn state(&self) -> Result<&S, MeshForestError> {
        match (&self.status, &self.state) {
            (PatchStatus::Initialized, Some(s)) => Ok(s),
            _ => Err(MeshForestError::UninitializedPatch(self.info.global_index)),
        }
    }

    pub fn state_mut(&mut self) -> Result<&mut S, MeshForestError> {
        match (&self.status, &mut self.state) {
            (PatchStatus::Initialized, Some(s)) => Ok(s),
            _ => Err(MeshForestError::UninitializedPatch(self.info.global_index)),
        }
    }

    /// Placement and mutable state together, for callbacks that need both.
    pub fn info_and_state_mut(&mut self) -> Result<(&PatchInfo<D>, &mut S), MeshForestError> {
        match (&self.status, &mut self.state) {
            (PatchStatus::Initialized, Some(s)) => Ok((&self.info, s)),
            _ => Err(MeshForestError::UninitializedPatch(self.info.global_index)),
        }
    }

    /// Move the state out, leaving the patch `Destroyed`.
    pub fn take_state(&mut self) -> Result<S, MeshForestError> {
        self.require(PatchStatus::Initialized, "move state out")?;
        let state = self
            .state
            .take()
            .ok_or(MeshForestError::UninitializedPatch(self.info.global_index))?;
        self.status = PatchStatus::Destroyed;
        Ok(state)
    }
}
