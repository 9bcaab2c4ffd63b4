//! Quad/oct-tree block forest: leaf keys, block connectivity, space-filling
//! curve order and 2:1 face balance.
//!
//! The forest is the opaque topology handle a [`Domain`](crate::domain::Domain)
//! carries. Every process holds the same leaf list (keys only, never solver
//! state), ordered along the Morton curve block by block, so topology changes
//! are deterministic computations over collectively gathered tags.

use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshForestError;
use hashbrown::{HashMap, HashSet};
use std::cmp::Ordering;
use std::ops::Range;

/// A cell in one quadtree/octree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeCell<const D: usize> {
    /// Refinement level (0 is root).
    pub level: u8,
    /// Integer coordinates at the given level.
    pub coords: [u32; D],
}

impl<const D: usize> TreeCell<D> {
    /// Deepest level whose Morton index still fits in a `u64`.
    pub const MAX_LEVEL: u8 = if 63 / D > 31 { 31 } else { (63 / D) as u8 };

    /// Number of children of a cell.
    pub const CHILDREN: usize = 1 << D;

    /// The root cell of a tree.
    pub fn root() -> Self {
        Self {
            level: 0,
            coords: [0; D],
        }
    }

    /// Returns the parent cell, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            let mut coords = self.coords;
            for coord in &mut coords {
                *coord /= 2;
            }
            Some(Self {
                level: self.level - 1,
                coords,
            })
        }
    }

    /// Returns the `2^D` children of this cell in curve order.
    pub fn children(&self) -> Vec<Self> {
        let mut children = Vec::with_capacity(Self::CHILDREN);
        for idx in 0..Self::CHILDREN {
            children.push(self.child(idx));
        }
        children
    }

    /// The child with index `idx` (bit `a` selects the upper half on axis `a`).
    pub fn child(&self, idx: usize) -> Self {
        let mut coords = [0u32; D];
        for (axis, coord) in coords.iter_mut().enumerate() {
            let bit = (idx >> axis) & 1;
            *coord = self.coords[axis] * 2 + bit as u32;
        }
        Self {
            level: self.level + 1,
            coords,
        }
    }

    /// Position of this cell among its siblings.
    pub fn child_id(&self) -> usize {
        self.coords
            .iter()
            .enumerate()
            .fold(0, |id, (axis, c)| id | (((*c & 1) as usize) << axis))
    }

    /// Position of this cell along a face normal to `axis` of its parent,
    /// i.e. the child id with the `axis` bit removed.
    pub fn subface_index(&self, axis: usize) -> usize {
        let mut out = 0;
        let mut slot = 0;
        for a in 0..D {
            if a == axis {
                continue;
            }
            out |= ((self.coords[a] & 1) as usize) << slot;
            slot += 1;
        }
        out
    }

    /// Children touching the given face of this cell, in curve order.
    pub fn children_on_face(&self, face: Face) -> Vec<Self> {
        let bit = face.positive as usize;
        (0..Self::CHILDREN)
            .filter(|idx| (idx >> face.axis) & 1 == bit)
            .map(|idx| self.child(idx))
            .collect()
    }

    /// Ancestor at `level`, or `None` if `level` is finer than this cell.
    pub fn ancestor(&self, level: u8) -> Option<Self> {
        if level > self.level {
            return None;
        }
        let shift = self.level - level;
        let mut coords = self.coords;
        for coord in &mut coords {
            *coord >>= shift;
        }
        Some(Self { level, coords })
    }

    /// Morton index of the cell's lower corner at [`Self::MAX_LEVEL`].
    pub fn morton(&self) -> u64 {
        debug_assert!(self.level <= Self::MAX_LEVEL, "cell level {} out of range", self.level);
        let shift = Self::MAX_LEVEL.saturating_sub(self.level);
        let mut m = 0u64;
        for axis in 0..D {
            let c = (self.coords[axis] as u64) << shift;
            for bit in 0..Self::MAX_LEVEL as usize {
                m |= ((c >> bit) & 1) << (bit * D + axis);
            }
        }
        m
    }

    /// Lower corner in block-local coordinates `[0, 1]^D`.
    pub fn lower(&self) -> [f64; D] {
        let h = self.width();
        let mut out = [0.0; D];
        for (axis, x) in out.iter_mut().enumerate() {
            *x = self.coords[axis] as f64 * h;
        }
        out
    }

    /// Upper corner in block-local coordinates `[0, 1]^D`.
    pub fn upper(&self) -> [f64; D] {
        let h = self.width();
        let mut out = self.lower();
        for x in &mut out {
            *x += h;
        }
        out
    }

    /// Edge length in block-local coordinates.
    pub fn width(&self) -> f64 {
        1.0 / (1u64 << self.level) as f64
    }
}

/// One face of a cell: the normal axis and the side along it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Face {
    pub axis: usize,
    pub positive: bool,
}

impl Face {
    /// Face with index `2 * axis + positive`.
    pub fn from_index(index: usize) -> Self {
        Self {
            axis: index / 2,
            positive: index % 2 == 1,
        }
    }

    pub fn index(&self) -> usize {
        2 * self.axis + self.positive as usize
    }

    pub fn opposite(&self) -> Self {
        Self {
            axis: self.axis,
            positive: !self.positive,
        }
    }

    /// All `2 * dim` faces in index order.
    pub fn all(dim: usize) -> impl Iterator<Item = Face> {
        (0..2 * dim).map(Face::from_index)
    }
}

/// A leaf position in the forest: tree (block) plus cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchKey<const D: usize> {
    pub block: u32,
    pub cell: TreeCell<D>,
}

impl<const D: usize> PatchKey<D> {
    pub fn new(block: u32, level: u8, coords: [u32; D]) -> Self {
        Self {
            block,
            cell: TreeCell { level, coords },
        }
    }

    pub fn level(&self) -> u8 {
        self.cell.level
    }

    pub fn parent(&self) -> Option<Self> {
        self.cell.parent().map(|cell| Self {
            block: self.block,
            cell,
        })
    }

    pub fn children(&self) -> Vec<Self> {
        self.cell
            .children()
            .into_iter()
            .map(|cell| Self {
                block: self.block,
                cell,
            })
            .collect()
    }

    pub fn ancestor(&self, level: u8) -> Option<Self> {
        self.cell.ancestor(level).map(|cell| Self {
            block: self.block,
            cell,
        })
    }

    /// Sort key along the forest's space-filling curve.
    pub fn sfc_key(&self) -> (u32, u64, u8) {
        (self.block, self.cell.morton(), self.cell.level)
    }
}

impl<const D: usize> Ord for PatchKey<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sfc_key().cmp(&other.sfc_key())
    }
}

impl<const D: usize> PartialOrd for PatchKey<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A brick of blocks with optional periodicity per axis.
///
/// Blocks are numbered lexicographically with axis 0 fastest. Adjacent
/// blocks share aligned faces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connectivity<const D: usize> {
    dims: [u32; D],
    periodic: [bool; D],
}

impl<const D: usize> Connectivity<D> {
    /// A single non-periodic block.
    pub fn unit() -> Self {
        Self {
            dims: [1; D],
            periodic: [false; D],
        }
    }

    /// A single block periodic in every direction.
    pub fn periodic_unit() -> Self {
        Self {
            dims: [1; D],
            periodic: [true; D],
        }
    }

    /// A `dims[0] x dims[1] x ...` brick of blocks.
    pub fn brick(dims: [u32; D], periodic: [bool; D]) -> Result<Self, MeshForestError> {
        if dims.iter().any(|&d| d == 0) {
            return Err(MeshForestError::InvalidConnectivity(format!(
                "brick dimensions must be positive, got {dims:?}"
            )));
        }
        let total = dims.iter().try_fold(1u32, |acc, &d| acc.checked_mul(d));
        if total.is_none() {
            return Err(MeshForestError::InvalidConnectivity(format!(
                "brick {dims:?} has too many blocks"
            )));
        }
        Ok(Self { dims, periodic })
    }

    pub fn num_blocks(&self) -> u32 {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> [u32; D] {
        self.dims
    }

    pub fn is_periodic(&self, axis: usize) -> bool {
        self.periodic[axis]
    }

    /// Position of `block` inside the brick.
    pub fn block_coords(&self, block: u32) -> [u32; D] {
        let mut rest = block;
        let mut out = [0u32; D];
        for (axis, c) in out.iter_mut().enumerate() {
            *c = rest % self.dims[axis];
            rest /= self.dims[axis];
        }
        out
    }

    pub fn block_index(&self, coords: [u32; D]) -> u32 {
        let mut index = 0;
        for axis in (0..D).rev() {
            index = index * self.dims[axis] + coords[axis];
        }
        index
    }

    /// The block across `face` of `block`, or `None` at a physical boundary.
    pub fn face_neighbor(&self, block: u32, face: Face) -> Option<u32> {
        let mut bc = self.block_coords(block);
        let d = self.dims[face.axis];
        let c = bc[face.axis];
        bc[face.axis] = if face.positive {
            if c + 1 < d {
                c + 1
            } else if self.periodic[face.axis] {
                0
            } else {
                return None;
            }
        } else if c > 0 {
            c - 1
        } else if self.periodic[face.axis] {
            d - 1
        } else {
            return None;
        };
        Some(self.block_index(bc))
    }
}

/// Classification of what lies across one face of a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceNeighbor<const D: usize> {
    /// Physical boundary of the domain.
    Boundary,
    /// One leaf at the same level.
    Same(PatchKey<D>),
    /// One leaf a level coarser.
    Coarser(PatchKey<D>),
    /// `2^(D-1)` leaves a level finer, ordered by subface.
    Finer(Vec<PatchKey<D>>),
}

/// Forest representation for quadtrees (`D = 2`) or octrees (`D = 3`).
#[derive(Debug, Clone)]
pub struct Forest<const D: usize> {
    connectivity: Connectivity<D>,
    leaves: Vec<PatchKey<D>>,
    index: HashMap<PatchKey<D>, usize>,
}

/// A quadtree forest (`D = 2`).
pub type QuadForest = Forest<2>;
/// An octree forest (`D = 3`).
pub type OctForest = Forest<3>;

impl<const D: usize> Forest<D> {
    /// Every block refined uniformly to `level`.
    pub fn uniform(connectivity: Connectivity<D>, level: u8) -> Result<Self, MeshForestError> {
        if level > TreeCell::<D>::MAX_LEVEL || level as usize * D > 40 {
            return Err(MeshForestError::InvalidOptions(format!(
                "uniform level {level} too deep for a {D}-dimensional forest"
            )));
        }
        let per_block = 1usize << (level as usize * D);
        let mask = (1usize << level) - 1;
        let mut leaves = Vec::with_capacity(per_block * connectivity.num_blocks() as usize);
        for block in 0..connectivity.num_blocks() {
            for idx in 0..per_block {
                let mut coords = [0u32; D];
                for (axis, c) in coords.iter_mut().enumerate() {
                    *c = ((idx >> (axis * level as usize)) & mask) as u32;
                }
                leaves.push(PatchKey::new(block, level, coords));
            }
        }
        Self::from_leaves(connectivity, leaves)
    }

    /// Build a forest from an arbitrary set of leaves; sorts them into curve order.
    pub fn from_leaves(
        connectivity: Connectivity<D>,
        mut leaves: Vec<PatchKey<D>>,
    ) -> Result<Self, MeshForestError> {
        if let Some(key) = leaves.iter().find(|k| k.level() > TreeCell::<D>::MAX_LEVEL) {
            return Err(MeshForestError::InvariantViolation(format!(
                "leaf {key:?} is deeper than the {D}-dimensional limit {}",
                TreeCell::<D>::MAX_LEVEL
            )));
        }
        leaves.sort_unstable();
        let mut index = HashMap::with_capacity(leaves.len());
        for (i, key) in leaves.iter().enumerate() {
            if key.block >= connectivity.num_blocks() {
                return Err(MeshForestError::InvalidBlock {
                    block: key.block,
                    num_blocks: connectivity.num_blocks(),
                });
            }
            if index.insert(*key, i).is_some() {
                return Err(MeshForestError::InvariantViolation(format!(
                    "duplicate leaf {key:?}"
                )));
            }
        }
        let forest = Self {
            connectivity,
            leaves,
            index,
        };
        crate::debug_invariants!(forest.validate_invariants(), "Forest::from_leaves");
        Ok(forest)
    }

    pub fn connectivity(&self) -> &Connectivity<D> {
        &self.connectivity
    }

    /// Leaves in curve order.
    pub fn leaves(&self) -> &[PatchKey<D>] {
        &self.leaves
    }

    /// Return the number of leaf cells.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Global curve position of `key`, if it is a leaf.
    pub fn position(&self, key: &PatchKey<D>) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, key: &PatchKey<D>) -> bool {
        self.index.contains_key(key)
    }

    /// Curve positions of the leaves of `block`.
    pub fn block_range(&self, block: u32) -> Range<usize> {
        let start = self.leaves.partition_point(|k| k.block < block);
        let end = self.leaves.partition_point(|k| k.block <= block);
        start..end
    }

    pub fn min_level(&self) -> u8 {
        self.leaves.iter().map(|k| k.level()).min().unwrap_or(0)
    }

    pub fn max_level(&self) -> u8 {
        self.leaves.iter().map(|k| k.level()).max().unwrap_or(0)
    }

    /// Same-level cell across `face`, crossing into neighboring blocks.
    /// `None` when the face lies on the physical boundary.
    pub fn adjacent_cell(&self, key: &PatchKey<D>, face: Face) -> Option<PatchKey<D>> {
        let n = 1u64 << key.level();
        let mut out = *key;
        let c = key.cell.coords[face.axis] as u64;
        if face.positive {
            if c + 1 < n {
                out.cell.coords[face.axis] += 1;
            } else {
                out.block = self.connectivity.face_neighbor(key.block, face)?;
                out.cell.coords[face.axis] = 0;
            }
        } else if c > 0 {
            out.cell.coords[face.axis] -= 1;
        } else {
            out.block = self.connectivity.face_neighbor(key.block, face)?;
            out.cell.coords[face.axis] = (n - 1) as u32;
        }
        Some(out)
    }

    /// What lies across `face` of leaf `key`.
    pub fn face_neighbor(
        &self,
        key: &PatchKey<D>,
        face: Face,
    ) -> Result<FaceNeighbor<D>, MeshForestError> {
        let Some(adj) = self.adjacent_cell(key, face) else {
            return Ok(FaceNeighbor::Boundary);
        };
        if self.index.contains_key(&adj) {
            return Ok(FaceNeighbor::Same(adj));
        }
        if let Some(parent) = adj.parent() {
            if self.index.contains_key(&parent) {
                return Ok(FaceNeighbor::Coarser(parent));
            }
        }
        let finer: Vec<_> = adj
            .cell
            .children_on_face(face.opposite())
            .into_iter()
            .map(|cell| PatchKey {
                block: adj.block,
                cell,
            })
            .collect();
        if finer.iter().all(|k| self.index.contains_key(k)) {
            return Ok(FaceNeighbor::Finer(finer));
        }
        Err(MeshForestError::UnbalancedForest {
            block: key.block,
            level: key.level(),
            coords: format!("{:?}", key.cell.coords),
        })
    }

    /// Curve positions of leaves that must be refined to restore 2:1 face balance.
    pub fn imbalanced_leaves(&self) -> Vec<usize> {
        let mut marked = HashSet::new();
        for key in &self.leaves {
            if key.level() < 2 {
                continue;
            }
            for face in Face::all(D) {
                let Some(adj) = self.adjacent_cell(key, face) else {
                    continue;
                };
                let mut cur = adj;
                let mut depth = 0u8;
                loop {
                    if let Some(&i) = self.index.get(&cur) {
                        if depth >= 2 {
                            marked.insert(i);
                        }
                        break;
                    }
                    match cur.parent() {
                        Some(p) => {
                            cur = p;
                            depth += 1;
                        }
                        None => break,
                    }
                }
            }
        }
        let mut out: Vec<_> = marked.into_iter().collect();
        out.sort_unstable();
        out
    }

    pub fn is_balanced(&self) -> bool {
        self.imbalanced_leaves().is_empty()
    }

    /// Start position of a complete sibling family at `i`, if the `2^D`
    /// leaves beginning there share one parent.
    pub fn family_at(&self, i: usize) -> Option<PatchKey<D>> {
        let first = self.leaves.get(i)?;
        if first.level() == 0 || first.cell.child_id() != 0 {
            return None;
        }
        let parent = first.parent()?;
        let n = TreeCell::<D>::CHILDREN;
        let family = self.leaves.get(i..i + n)?;
        family
            .iter()
            .enumerate()
            .all(|(j, k)| k.level() == first.level() && k.parent() == Some(parent) && k.cell.child_id() == j)
            .then_some(parent)
    }
}

impl<const D: usize> DebugInvariants for Forest<D> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Forest");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        for pair in self.leaves.windows(2) {
            if pair[0] >= pair[1] {
                return Err(MeshForestError::InvariantViolation(format!(
                    "leaves out of curve order: {:?} before {:?}",
                    pair[0], pair[1]
                )));
            }
        }
        for key in &self.leaves {
            let mut cur = key.parent();
            while let Some(p) = cur {
                if self.index.contains_key(&p) {
                    return Err(MeshForestError::InvariantViolation(format!(
                        "leaf {key:?} overlaps ancestor leaf {p:?}"
                    )));
                }
                cur = p.parent();
            }
        }
        // Leaves must tile every block exactly.
        let deepest = self.max_level() as u32;
        let per_block = 1u128 << (deepest as usize * D);
        let covered: u128 = self
            .leaves
            .iter()
            .map(|k| 1u128 << ((deepest - k.level() as u32) as usize * D))
            .sum();
        let expected = per_block * self.connectivity.num_blocks() as u128;
        if covered != expected {
            return Err(MeshForestError::InvariantViolation(format!(
                "leaves cover {covered} of {expected} finest cells"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_child_round_trip() {
        let cell = TreeCell::<2> {
            level: 3,
            coords: [5, 2],
        };
        for (idx, child) in cell.children().into_iter().enumerate() {
            assert_eq!(child.parent(), Some(cell));
            assert_eq!(child.child_id(), idx);
        }
        assert_eq!(TreeCell::<2>::root().parent(), None);
    }

    #[test]
    fn morton_orders_children_after_parent_start() {
        let parent = TreeCell::<2> {
            level: 1,
            coords: [1, 0],
        };
        let kids = parent.children();
        let m: Vec<_> = kids.iter().map(|c| c.morton()).collect();
        assert!(m.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(m[0], parent.morton());
    }

    #[test]
    fn uniform_forest_counts() {
        let forest = QuadForest::uniform(Connectivity::unit(), 2).unwrap();
        assert_eq!(forest.leaf_count(), 16);
        assert_eq!(forest.min_level(), 2);
        assert_eq!(forest.max_level(), 2);
        forest.validate_invariants().unwrap();

        let brick = Connectivity::brick([2, 1], [false, false]).unwrap();
        let forest = QuadForest::uniform(brick, 1).unwrap();
        assert_eq!(forest.leaf_count(), 8);
        assert!(forest.leaves()[..4].iter().all(|k| k.block == 0));
    }

    #[test]
    fn leaves_beyond_max_level_rejected() {
        let deep = PatchKey::new(0, TreeCell::<2>::MAX_LEVEL + 1, [0, 0]);
        assert!(matches!(
            QuadForest::from_leaves(Connectivity::unit(), vec![deep]),
            Err(MeshForestError::InvariantViolation(_))
        ));
    }

    #[test]
    fn face_neighbors_across_levels() {
        // Refine the lower-left quadrant of a level-1 forest.
        let conn = Connectivity::<2>::unit();
        let mut leaves: Vec<_> = QuadForest::uniform(conn.clone(), 1)
            .unwrap()
            .leaves()
            .to_vec();
        let refined = leaves.remove(0);
        leaves.extend(refined.children());
        let forest = QuadForest::from_leaves(conn, leaves).unwrap();
        assert_eq!(forest.leaf_count(), 7);

        // Upper-right child of the refined quadrant sees the coarse +x neighbor.
        let fine = PatchKey::new(0, 2, [1, 1]);
        let right = Face {
            axis: 0,
            positive: true,
        };
        assert_eq!(
            forest.face_neighbor(&fine, right).unwrap(),
            FaceNeighbor::Coarser(PatchKey::new(0, 1, [1, 0]))
        );

        // The coarse +x neighbor sees two finer cells across its -x face.
        let coarse = PatchKey::new(0, 1, [1, 0]);
        match forest.face_neighbor(&coarse, right.opposite()).unwrap() {
            FaceNeighbor::Finer(kids) => {
                assert_eq!(kids.len(), 2);
                assert_eq!(kids[0], PatchKey::new(0, 2, [1, 0]));
                assert_eq!(kids[1], PatchKey::new(0, 2, [1, 1]));
                assert_eq!(kids[1].cell.subface_index(0), 1);
            }
            other => panic!("expected finer neighbors, got {other:?}"),
        }

        assert_eq!(
            forest.face_neighbor(&fine, Face::from_index(0)).unwrap(),
            FaceNeighbor::Same(PatchKey::new(0, 2, [0, 1]))
        );
        assert_eq!(
            forest
                .face_neighbor(&PatchKey::new(0, 2, [0, 0]), Face::from_index(0))
                .unwrap(),
            FaceNeighbor::Boundary
        );
    }

    #[test]
    fn periodic_single_block_is_its_own_neighbor() {
        let forest = QuadForest::uniform(Connectivity::periodic_unit(), 0).unwrap();
        let root = forest.leaves()[0];
        for face in Face::all(2) {
            assert_eq!(
                forest.face_neighbor(&root, face).unwrap(),
                FaceNeighbor::Same(root)
            );
        }
    }

    #[test]
    fn imbalance_is_detected() {
        let conn = Connectivity::<2>::unit();
        let mut leaves: Vec<_> = QuadForest::uniform(conn.clone(), 1)
            .unwrap()
            .leaves()
            .to_vec();
        let q = leaves.remove(0);
        let mut kids = q.children();
        // Refine the child touching the +x coarse quadrant twice deeper.
        let deep = kids.remove(1);
        kids.extend(deep.children());
        leaves.extend(kids);
        let forest = QuadForest::from_leaves(conn, leaves).unwrap();
        let bad = forest.imbalanced_leaves();
        let pos = forest.position(&PatchKey::new(0, 1, [1, 0])).unwrap();
        assert_eq!(bad, vec![pos]);
    }

    #[test]
    fn family_detection() {
        let forest = QuadForest::uniform(Connectivity::unit(), 1).unwrap();
        assert_eq!(forest.family_at(0), Some(PatchKey::new(0, 0, [0, 0])));
        assert_eq!(forest.family_at(1), None);
    }

    #[test]
    fn brick_connectivity_neighbors() {
        let conn = Connectivity::brick([3, 2], [true, false]).unwrap();
        assert_eq!(conn.num_blocks(), 6);
        assert_eq!(conn.block_coords(4), [1, 1]);
        assert_eq!(conn.block_index([1, 1]), 4);
        assert_eq!(conn.face_neighbor(2, Face::from_index(1)), Some(0));
        assert_eq!(conn.face_neighbor(0, Face::from_index(2)), None);
        assert_eq!(conn.face_neighbor(0, Face::from_index(3)), Some(3));
        assert!(Connectivity::<2>::brick([0, 1], [false, false]).is_err());
    }
}
