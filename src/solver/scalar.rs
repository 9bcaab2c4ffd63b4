//! Reference cell-centred solver: first-order upwind advection of a scalar
//! on quadtree patches.
//!
//! Refinement uses piecewise-constant interpolation and averaging
//! restriction, so the cell-area-weighted total is conserved across
//! adaptation.

use super::{PatchSolver, PhysicalBc, RefineCriterion, Tag};
use crate::forest::Face;
use crate::map::MapContext;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, PatchInfo};
use std::fmt;
use std::sync::Arc;

/// Cell values of one patch with `mbc` ghost layers on every side.
#[derive(Clone, Debug, PartialEq)]
pub struct CellGrid {
    mx: usize,
    my: usize,
    mbc: usize,
    q: Vec<f64>,
}

impl CellGrid {
    pub fn new(mx: usize, my: usize, mbc: usize) -> Self {
        Self {
            mx,
            my,
            mbc,
            q: vec![0.0; (mx + 2 * mbc) * (my + 2 * mbc)],
        }
    }

    pub fn mx(&self) -> usize {
        self.mx
    }

    pub fn my(&self) -> usize {
        self.my
    }

    pub fn mbc(&self) -> usize {
        self.mbc
    }

    fn offset(&self, i: isize, j: isize) -> usize {
        let b = self.mbc as isize;
        ((j + b) * (self.mx as isize + 2 * b) + (i + b)) as usize
    }

    /// Value at cell `(i, j)`; negative or `>= mx` indices address ghosts.
    pub fn get(&self, i: isize, j: isize) -> f64 {
        self.q[self.offset(i, j)]
    }

    pub fn set(&mut self, i: isize, j: isize, v: f64) {
        let k = self.offset(i, j);
        self.q[k] = v;
    }

    fn extent(&self, axis: usize) -> usize {
        if axis == 0 { self.mx } else { self.my }
    }

    // (normal, tangential) -> (i, j)
    fn get_nt(&self, axis: usize, n: isize, t: isize) -> f64 {
        if axis == 0 { self.get(n, t) } else { self.get(t, n) }
    }

    fn set_nt(&mut self, axis: usize, n: isize, t: isize, v: f64) {
        if axis == 0 { self.set(n, t, v) } else { self.set(t, n, v) }
    }

    /// Normal index of ghost layer `g` beyond `face`.
    fn ghost_n(&self, face: Face, g: usize) -> isize {
        if face.positive {
            (self.extent(face.axis) + g) as isize
        } else {
            -1 - g as isize
        }
    }

    /// Normal index of the `k`-th interior layer counted inward from `face`.
    fn interior_n(&self, face: Face, k: usize) -> isize {
        if face.positive {
            (self.extent(face.axis) - 1 - k) as isize
        } else {
            k as isize
        }
    }

    pub fn interior(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.my as isize).flat_map(move |j| (0..self.mx as isize).map(move |i| self.get(i, j)))
    }

    /// Sum of interior values.
    pub fn interior_sum(&self) -> f64 {
        self.interior().sum()
    }
}

/// Initial condition evaluated at a cell center's physical coordinates.
pub type InitialCondition = Arc<dyn Fn([f64; 3]) -> f64 + Send + Sync>;

/// Constant-velocity advection in block-logical coordinates.
#[derive(Clone)]
pub struct ScalarAdvection {
    mx: usize,
    my: usize,
    mbc: usize,
    velocity: [f64; 2],
    map: Arc<MapContext>,
    initial: InitialCondition,
}

impl fmt::Debug for ScalarAdvection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarAdvection")
            .field("mx", &self.mx)
            .field("my", &self.my)
            .field("mbc", &self.mbc)
            .field("velocity", &self.velocity)
            .finish_non_exhaustive()
    }
}

impl ScalarAdvection {
    pub fn new(
        mx: usize,
        my: usize,
        mbc: usize,
        velocity: [f64; 2],
        map: Arc<MapContext>,
        initial: InitialCondition,
    ) -> Result<Self, MeshForestError> {
        if mbc == 0 || mx % 2 != 0 || my % 2 != 0 || mx < 2 * mbc || my < 2 * mbc {
            return Err(MeshForestError::InvalidOptions(format!(
                "patch size {mx}x{my} with {mbc} ghost layers: sizes must be even and at least 2*mbc, mbc >= 1"
            )));
        }
        Ok(Self {
            mx,
            my,
            mbc,
            velocity,
            map,
            initial,
        })
    }

    fn child_offset(&self, fine: &PatchInfo<2>) -> (isize, isize) {
        let c = fine.key.cell.coords;
        (
            ((c[0] & 1) as usize * self.mx / 2) as isize,
            ((c[1] & 1) as usize * self.my / 2) as isize,
        )
    }

    fn tangential(&self, axis: usize) -> usize {
        if axis == 0 { self.my } else { self.mx }
    }
}

impl PatchSolver<2> for ScalarAdvection {
    type State = CellGrid;

    fn build(&self, _info: &PatchInfo<2>, mode: BuildMode) -> Result<CellGrid, MeshForestError> {
        Ok(match mode {
            BuildMode::ForUpdate => CellGrid::new(self.mx, self.my, self.mbc),
            BuildMode::ForGhost => CellGrid::new(self.mx, self.my, 0),
        })
    }

    fn initialize(&self, info: &PatchInfo<2>, state: &mut CellGrid) -> Result<(), MeshForestError> {
        let dx = info.width() / self.mx as f64;
        let dy = info.width() / self.my as f64;
        for j in 0..self.my {
            for i in 0..self.mx {
                let xc = info.lower[0] + (i as f64 + 0.5) * dx;
                let yc = info.lower[1] + (j as f64 + 0.5) * dy;
                let p = self.map.mapc2m(info.block(), xc, yc)?;
                state.set(i as isize, j as isize, (self.initial)(p));
            }
        }
        Ok(())
    }

    fn interpolate(
        &self,
        _coarse_info: &PatchInfo<2>,
        coarse: &CellGrid,
        fine_info: &PatchInfo<2>,
        fine: &mut CellGrid,
    ) -> Result<(), MeshForestError> {
        let (ox, oy) = self.child_offset(fine_info);
        for j in 0..self.my as isize {
            for i in 0..self.mx as isize {
                fine.set(i, j, coarse.get(ox + i / 2, oy + j / 2));
            }
        }
        Ok(())
    }

    fn restrict(
        &self,
        fine: &[(&PatchInfo<2>, &CellGrid)],
        _coarse_info: &PatchInfo<2>,
        coarse: &mut CellGrid,
    ) -> Result<(), MeshForestError> {
        for (info, child) in fine {
            let (ox, oy) = self.child_offset(info);
            for j in 0..(self.my / 2) as isize {
                for i in 0..(self.mx / 2) as isize {
                    let sum = child.get(2 * i, 2 * j)
                        + child.get(2 * i + 1, 2 * j)
                        + child.get(2 * i, 2 * j + 1)
                        + child.get(2 * i + 1, 2 * j + 1);
                    coarse.set(ox + i, oy + j, 0.25 * sum);
                }
            }
        }
        Ok(())
    }

    fn copy_face(&self, dst: &mut CellGrid, dst_face: Face, src: &CellGrid) -> Result<(), MeshForestError> {
        let axis = dst_face.axis;
        // The neighbour touches us with its opposite face.
        let src_face = dst_face.opposite();
        for g in 0..self.mbc {
            for t in 0..self.tangential(axis) as isize {
                let v = src.get_nt(axis, src.interior_n(src_face, g), t);
                let n = dst.ghost_n(dst_face, g);
                dst.set_nt(axis, n, t, v);
            }
        }
        Ok(())
    }

    fn average_face(
        &self,
        dst: &mut CellGrid,
        dst_face: Face,
        subface: usize,
        src: &CellGrid,
    ) -> Result<(), MeshForestError> {
        let axis = dst_face.axis;
        let src_face = dst_face.opposite();
        let half = self.tangential(axis) / 2;
        let off = (subface * half) as isize;
        for g in 0..self.mbc {
            let n0 = src.interior_n(src_face, 2 * g);
            let n1 = src.interior_n(src_face, 2 * g + 1);
            for t in 0..half as isize {
                let sum = src.get_nt(axis, n0, 2 * t)
                    + src.get_nt(axis, n0, 2 * t + 1)
                    + src.get_nt(axis, n1, 2 * t)
                    + src.get_nt(axis, n1, 2 * t + 1);
                let n = dst.ghost_n(dst_face, g);
                dst.set_nt(axis, n, off + t, 0.25 * sum);
            }
        }
        Ok(())
    }

    fn interpolate_face(
        &self,
        dst: &mut CellGrid,
        dst_face: Face,
        subface: usize,
        src: &CellGrid,
    ) -> Result<(), MeshForestError> {
        let axis = dst_face.axis;
        let src_face = dst_face.opposite();
        let off = (subface * self.tangential(axis) / 2) as isize;
        for g in 0..self.mbc {
            let n_src = src.interior_n(src_face, g / 2);
            for t in 0..self.tangential(axis) as isize {
                let v = src.get_nt(axis, n_src, off + t / 2);
                let n = dst.ghost_n(dst_face, g);
                dst.set_nt(axis, n, t, v);
            }
        }
        Ok(())
    }

    fn pack(&self, state: &CellGrid) -> Vec<u8> {
        let values: Vec<f64> = state.interior().collect();
        bytemuck::cast_slice(&values).to_vec()
    }

    fn unpack(&self, info: &PatchInfo<2>, mode: BuildMode, bytes: &[u8]) -> Result<CellGrid, MeshForestError> {
        let expected = self.mx * self.my * std::mem::size_of::<f64>();
        if bytes.len() != expected {
            return Err(MeshForestError::solver(
                info.global_index,
                format!("payload has {} bytes, expected {expected}", bytes.len()),
            ));
        }
        let values: Vec<f64> = bytes
            .chunks_exact(std::mem::size_of::<f64>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let mut grid = self.build(info, mode)?;
        for (k, v) in values.into_iter().enumerate() {
            grid.set((k % self.mx) as isize, (k / self.mx) as isize, v);
        }
        Ok(grid)
    }

    fn compute_update(
        &self,
        info: &PatchInfo<2>,
        state: &mut CellGrid,
        _t: f64,
        dt: f64,
    ) -> Result<f64, MeshForestError> {
        if state.mbc() == 0 {
            return Err(MeshForestError::solver(info.global_index, "ghost-only state cannot be advanced"));
        }
        let dx = info.width() / self.mx as f64;
        let dy = info.width() / self.my as f64;
        let [u, v] = self.velocity;
        let old = state.clone();
        for j in 0..self.my as isize {
            for i in 0..self.mx as isize {
                let q = old.get(i, j);
                let fx = if u >= 0.0 {
                    u * (q - old.get(i - 1, j))
                } else {
                    u * (old.get(i + 1, j) - q)
                };
                let fy = if v >= 0.0 {
                    v * (q - old.get(i, j - 1))
                } else {
                    v * (old.get(i, j + 1) - q)
                };
                state.set(i, j, q - dt * (fx / dx + fy / dy));
            }
        }
        Ok(dt * (u.abs() / dx + v.abs() / dy))
    }
}

/// Tags by the largest jump between adjacent interior cells.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradientCriterion {
    pub refine_above: f64,
    pub coarsen_below: f64,
}

impl RefineCriterion<CellGrid, 2> for GradientCriterion {
    fn tag(&self, _info: &PatchInfo<2>, grid: &CellGrid, _initializing: bool) -> Result<Tag, MeshForestError> {
        let mut jump: f64 = 0.0;
        for j in 0..grid.my() as isize {
            for i in 0..grid.mx() as isize {
                let q = grid.get(i, j);
                if i + 1 < grid.mx() as isize {
                    jump = jump.max((grid.get(i + 1, j) - q).abs());
                }
                if j + 1 < grid.my() as isize {
                    jump = jump.max((grid.get(i, j + 1) - q).abs());
                }
            }
        }
        Ok(if jump > self.refine_above {
            Tag::Refine
        } else if jump < self.coarsen_below {
            Tag::Coarsen
        } else {
            Tag::Stay
        })
    }
}

/// Extrapolates the outermost interior layer into physical ghost cells.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroGradientBc;

impl PhysicalBc<CellGrid, 2> for ZeroGradientBc {
    fn apply(&self, info: &PatchInfo<2>, grid: &mut CellGrid, _t: f64) -> Result<(), MeshForestError> {
        for face in Face::all(2).filter(|f| info.is_boundary(*f)) {
            let axis = face.axis;
            let n_in = grid.interior_n(face, 0);
            let len = grid.extent(1 - axis) as isize;
            for g in 0..grid.mbc() {
                let n = grid.ghost_n(face, g);
                for t in 0..len {
                    let v = grid.get_nt(axis, n_in, t);
                    grid.set_nt(axis, n, t, v);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::{Connectivity, QuadForest};

    fn solver() -> ScalarAdvection {
        ScalarAdvection::new(
            4,
            4,
            1,
            [1.0, 0.0],
            Arc::new(MapContext::nomap()),
            Arc::new(|p: [f64; 3]| p[0]),
        )
        .unwrap()
    }

    fn infos(level: u8) -> (QuadForest, Vec<PatchInfo<2>>) {
        let forest = QuadForest::uniform(Connectivity::unit(), level).unwrap();
        let infos = forest
            .leaves()
            .iter()
            .enumerate()
            .map(|(i, k)| PatchInfo::new(&forest, *k, i, i, 0))
            .collect();
        (forest, infos)
    }

    #[test]
    fn rejects_odd_patch_sizes() {
        let map = Arc::new(MapContext::nomap());
        assert!(ScalarAdvection::new(5, 4, 1, [0.0; 2], map.clone(), Arc::new(|_: [f64; 3]| 0.0)).is_err());
        assert!(ScalarAdvection::new(4, 4, 3, [0.0; 2], map, Arc::new(|_: [f64; 3]| 0.0)).is_err());
    }

    #[test]
    fn restrict_after_interpolate_is_identity() {
        let s = solver();
        let (_, coarse_infos) = infos(0);
        let (_, fine_infos) = infos(1);
        let mut coarse = s.build(&coarse_infos[0], BuildMode::ForUpdate).unwrap();
        s.initialize(&coarse_infos[0], &mut coarse).unwrap();

        let mut kids = Vec::new();
        for info in &fine_infos {
            let mut g = s.build(info, BuildMode::ForUpdate).unwrap();
            s.interpolate(&coarse_infos[0], &coarse, info, &mut g).unwrap();
            kids.push(g);
        }
        let pairs: Vec<_> = fine_infos.iter().zip(kids.iter()).collect();
        let mut back = s.build(&coarse_infos[0], BuildMode::ForUpdate).unwrap();
        s.restrict(&pairs, &coarse_infos[0], &mut back).unwrap();
        for (a, b) in back.interior().zip(coarse.interior()) {
            assert!((a - b).abs() < 1e-12);
        }
        let fine_total: f64 = kids.iter().map(|g| g.interior_sum()).sum::<f64>() / 4.0;
        assert!((fine_total - coarse.interior_sum()).abs() < 1e-12);
    }

    #[test]
    fn same_level_face_copy() {
        let s = solver();
        let (_, infos) = infos(1);
        let mut left = s.build(&infos[0], BuildMode::ForUpdate).unwrap();
        let mut right = s.build(&infos[1], BuildMode::ForGhost).unwrap();
        s.initialize(&infos[0], &mut left).unwrap();
        s.initialize(&infos[1], &mut right).unwrap();
        s.copy_face(&mut left, Face::from_index(1), &right).unwrap();
        for j in 0..4 {
            assert_eq!(left.get(4, j), right.get(0, j));
        }
    }

    #[test]
    fn pack_round_trip_drops_ghosts() {
        let s = solver();
        let (_, infos) = infos(0);
        let mut g = s.build(&infos[0], BuildMode::ForUpdate).unwrap();
        s.initialize(&infos[0], &mut g).unwrap();
        let bytes = s.pack(&g);
        let ghost = s.unpack(&infos[0], BuildMode::ForGhost, &bytes).unwrap();
        assert_eq!(ghost.mbc(), 0);
        assert_eq!(ghost.interior_sum(), g.interior_sum());
        assert!(s.unpack(&infos[0], BuildMode::ForGhost, &bytes[1..]).is_err());

        // Payloads sliced out of a wire message need not be aligned.
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let moved = s.unpack(&infos[0], BuildMode::ForUpdate, &shifted[1..]).unwrap();
        assert_eq!(moved.interior().collect::<Vec<_>>(), g.interior().collect::<Vec<_>>());
    }

    #[test]
    fn gradient_criterion_tags() {
        let s = solver();
        let (_, infos) = infos(0);
        let mut g = s.build(&infos[0], BuildMode::ForUpdate).unwrap();
        s.initialize(&infos[0], &mut g).unwrap();
        let steep = GradientCriterion {
            refine_above: 0.1,
            coarsen_below: 0.01,
        };
        assert_eq!(steep.tag(&infos[0], &g, true).unwrap(), Tag::Refine);
        let flat = GradientCriterion {
            refine_above: 1.0,
            coarsen_below: 0.5,
        };
        assert_eq!(flat.tag(&infos[0], &g, false).unwrap(), Tag::Coarsen);
    }

    #[test]
    fn zero_gradient_fills_boundary_ghosts() {
        let s = solver();
        let (_, infos) = infos(0);
        let mut g = s.build(&infos[0], BuildMode::ForUpdate).unwrap();
        s.initialize(&infos[0], &mut g).unwrap();
        ZeroGradientBc.apply(&infos[0], &mut g, 0.0).unwrap();
        assert_eq!(g.get(-1, 2), g.get(0, 2));
        assert_eq!(g.get(4, 1), g.get(3, 1));
        assert_eq!(g.get(2, -1), g.get(2, 0));
    }

    #[test]
    fn uniform_state_is_steady() {
        let s = ScalarAdvection::new(
            4,
            4,
            1,
            [1.0, -0.5],
            Arc::new(MapContext::nomap()),
            Arc::new(|_: [f64; 3]| 2.0),
        )
        .unwrap();
        let (_, infos) = infos(0);
        let mut g = s.build(&infos[0], BuildMode::ForUpdate).unwrap();
        s.initialize(&infos[0], &mut g).unwrap();
        ZeroGradientBc.apply(&infos[0], &mut g, 0.0).unwrap();
        let cfl = s.compute_update(&infos[0], &mut g, 0.0, 0.1).unwrap();
        assert!((cfl - 0.1 * (4.0 + 2.0)).abs() < 1e-12);
        assert!(g.interior().all(|q| (q - 2.0).abs() < 1e-12));
    }
}
