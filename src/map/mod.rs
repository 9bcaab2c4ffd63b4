//! Logical-to-physical coordinate maps.
//!
//! A [`MapContext`] stitches the unit squares of several blocks into one
//! physical surface. Contexts are immutable after construction and are shared
//! read-only (usually behind an `Arc`) by every patch of a domain.

mod block_scope;
mod variants;

pub use block_scope::{BlockScope, current_block};
pub use variants::Transform;

use crate::mesh_error::MeshForestError;
use std::fmt;
use std::sync::Arc;

/// Capability questions a map answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MapQuery {
    IsUsed = 0,
    IsScaledShift = 1,
    IsAffine = 2,
    IsNonlinear = 3,
    IsGraph = 4,
}

/// Number of query identifiers.
pub const MAP_QUERY_LAST: usize = 5;

impl MapQuery {
    pub fn from_raw(id: i32) -> Option<Self> {
        match id {
            0 => Some(MapQuery::IsUsed),
            1 => Some(MapQuery::IsScaledShift),
            2 => Some(MapQuery::IsAffine),
            3 => Some(MapQuery::IsNonlinear),
            4 => Some(MapQuery::IsGraph),
            _ => None,
        }
    }
}

/// Transform supplied by the application, evaluated inside a [`BlockScope`].
pub type ExternalFn = Arc<dyn Fn(f64, f64) -> [f64; 3] + Send + Sync>;

/// The closed set of map variants.
#[derive(Clone)]
pub enum MapKind {
    /// Identity on the unit square, `z = 0`.
    Nomap,
    /// `x -> scale * x + shift` in the plane.
    ScaledShift { scale: [f64; 2], shift: [f64; 2] },
    /// Torus with major radius `r1` and minor radius `r2`.
    Torus { r1: f64, r2: f64 },
    /// Two-block sphere.
    PillowSphere,
    /// Six-block sphere.
    CubedSphere,
    /// Application transform with recorded query answers.
    External {
        answers: [i32; MAP_QUERY_LAST],
        mapc2m: ExternalFn,
    },
}

impl fmt::Debug for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKind::Nomap => f.write_str("Nomap"),
            MapKind::ScaledShift { scale, shift } => f
                .debug_struct("ScaledShift")
                .field("scale", scale)
                .field("shift", shift)
                .finish(),
            MapKind::Torus { r1, r2 } => f
                .debug_struct("Torus")
                .field("r1", r1)
                .field("r2", r2)
                .finish(),
            MapKind::PillowSphere => f.write_str("PillowSphere"),
            MapKind::CubedSphere => f.write_str("CubedSphere"),
            MapKind::External { answers, .. } => f
                .debug_struct("External")
                .field("answers", answers)
                .finish_non_exhaustive(),
        }
    }
}

/// A coordinate map plus the post-transform applied to its output.
#[derive(Clone, Debug)]
pub struct MapContext {
    kind: MapKind,
    transform: Transform,
}

impl MapContext {
    pub fn nomap() -> Self {
        Self {
            kind: MapKind::Nomap,
            transform: Transform::default(),
        }
    }

    pub fn scaled_shift(scale: [f64; 2], shift: [f64; 2]) -> Result<Self, MeshForestError> {
        if scale.iter().chain(&shift).any(|v| !v.is_finite()) || scale.contains(&0.0) {
            return Err(MeshForestError::InvalidMapParameter {
                map: "scaledshift",
                reason: format!("scale {scale:?} and shift {shift:?} must be finite, scale nonzero"),
            });
        }
        Ok(Self {
            kind: MapKind::ScaledShift { scale, shift },
            transform: Transform::default(),
        })
    }

    /// Torus with `0 <= r2 <= r1`.
    pub fn torus(r1: f64, r2: f64) -> Result<Self, MeshForestError> {
        if !(r1.is_finite() && r2.is_finite()) {
            return Err(MeshForestError::InvalidMapParameter {
                map: "torus",
                reason: format!("radii must be finite, got R1 = {r1}, R2 = {r2}"),
            });
        }
        if !(0.0 <= r2 && r2 <= r1) {
            return Err(MeshForestError::InvalidMapParameter {
                map: "torus",
                reason: format!("require 0 <= R2 <= R1, got R1 = {r1}, R2 = {r2}"),
            });
        }
        Ok(Self {
            kind: MapKind::Torus { r1, r2 },
            transform: Transform::default(),
        })
    }

    pub fn pillow_sphere(transform: Transform) -> Self {
        Self {
            kind: MapKind::PillowSphere,
            transform,
        }
    }

    pub fn cubed_sphere(transform: Transform) -> Self {
        Self {
            kind: MapKind::CubedSphere,
            transform,
        }
    }

    /// Wrap an application transform. `answers[q]` is returned for query `q`.
    pub fn external(answers: [i32; MAP_QUERY_LAST], mapc2m: ExternalFn) -> Self {
        Self {
            kind: MapKind::External { answers, mapc2m },
            transform: Transform::default(),
        }
    }

    pub fn kind(&self) -> &MapKind {
        &self.kind
    }

    /// Number of blocks the variant is defined on, if limited.
    pub fn expected_blocks(&self) -> Option<u32> {
        match self.kind {
            MapKind::PillowSphere => Some(2),
            MapKind::CubedSphere => Some(6),
            _ => None,
        }
    }

    pub fn query(&self, q: MapQuery) -> bool {
        self.query_raw(q as i32) != 0
    }

    /// Integer query entry point; unknown identifiers answer `0`.
    pub fn query_raw(&self, id: i32) -> i32 {
        let Some(q) = MapQuery::from_raw(id) else {
            return 0;
        };
        // [used, scaledshift, affine, nonlinear, graph]
        let answers = match &self.kind {
            MapKind::Nomap => [0, 1, 1, 0, 0],
            MapKind::ScaledShift { .. } => [1, 1, 1, 0, 0],
            MapKind::Torus { .. } | MapKind::PillowSphere | MapKind::CubedSphere => {
                [1, 0, 0, 1, 0]
            }
            MapKind::External { answers, .. } => *answers,
        };
        answers[q as usize]
    }

    /// Map block-logical `(xc, yc)` in block `block` to physical space.
    pub fn mapc2m(&self, block: u32, xc: f64, yc: f64) -> Result<[f64; 3], MeshForestError> {
        if let Some(num_blocks) = self.expected_blocks() {
            if block >= num_blocks {
                return Err(MeshForestError::InvalidBlock { block, num_blocks });
            }
        }
        let p = match &self.kind {
            MapKind::Nomap => [xc, yc, 0.0],
            MapKind::ScaledShift { scale, shift } => {
                [scale[0] * xc + shift[0], scale[1] * yc + shift[1], 0.0]
            }
            MapKind::Torus { r1, r2 } => variants::torus(*r1, *r2, xc, yc),
            MapKind::PillowSphere => variants::pillow_sphere(block, xc, yc),
            MapKind::CubedSphere => variants::cubed_sphere(block, xc, yc),
            MapKind::External { mapc2m, .. } => {
                let _scope = BlockScope::enter(block);
                mapc2m(xc, yc)
            }
        };
        Ok(self.transform.apply(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn torus_queries() {
        let map = MapContext::torus(2.0, 1.0).unwrap();
        assert!(map.query(MapQuery::IsUsed));
        assert!(!map.query(MapQuery::IsScaledShift));
        assert!(!map.query(MapQuery::IsAffine));
        assert!(map.query(MapQuery::IsNonlinear));
        assert!(!map.query(MapQuery::IsGraph));
        assert_eq!(map.query_raw(17), 0);
        assert_eq!(map.query_raw(-1), 0);
    }

    #[test]
    fn torus_outer_equator() {
        let map = MapContext::torus(2.0, 1.0).unwrap();
        let p = map.mapc2m(0, 0.0, 0.0).unwrap();
        assert!((p[0] - 3.0).abs() < 1e-12);
        assert!(p[1].abs() < 1e-12);
        assert!(p[2].abs() < 1e-12);
    }

    #[test]
    fn torus_rejects_bad_radii() {
        assert!(MapContext::torus(1.0, 2.0).is_err());
        assert!(MapContext::torus(1.0, -0.5).is_err());
        assert!(MapContext::torus(f64::INFINITY, 1.0).is_err());
        assert!(MapContext::torus(1.0, 1.0).is_ok());
    }

    #[test]
    fn sphere_block_range_checked() {
        let map = MapContext::cubed_sphere(Transform::default());
        assert!(map.mapc2m(5, 0.5, 0.5).is_ok());
        assert_eq!(
            map.mapc2m(6, 0.5, 0.5).unwrap_err(),
            MeshForestError::InvalidBlock {
                block: 6,
                num_blocks: 6
            }
        );
    }

    #[test]
    #[serial]
    fn external_map_sees_current_block() {
        let f: ExternalFn = Arc::new(|x: f64, y: f64| {
            let b = current_block().map_or(-1.0, |b| b as f64);
            [x, y, b]
        });
        let map = MapContext::external([1, 0, 0, 1, 1], f);
        assert_eq!(map.mapc2m(3, 0.25, 0.5).unwrap(), [0.25, 0.5, 3.0]);
        assert_eq!(current_block(), None);
        assert!(map.query(MapQuery::IsGraph));
        assert_eq!(map.query_raw(MAP_QUERY_LAST as i32), 0);
    }

    #[test]
    fn scaled_shift_is_affine() {
        let map = MapContext::scaled_shift([2.0, 3.0], [1.0, 1.0]).unwrap();
        assert!(map.query(MapQuery::IsAffine));
        assert_eq!(map.mapc2m(0, 0.5, 0.5).unwrap(), [2.0, 2.5, 0.0]);
        assert!(!MapContext::nomap().query(MapQuery::IsUsed));
    }
}
