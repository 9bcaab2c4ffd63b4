//! Coordinate formulas for the built-in map variants.

use crate::mesh_error::MeshForestError;
use std::f64::consts::{FRAC_PI_4, PI};

/// Scale, shift and rotation applied after a variant's own mapping.
///
/// A point `p` becomes `R_z(rotate[1]) * R_x(rotate[0]) * (scale * p) + shift`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub scale: [f64; 3],
    pub shift: [f64; 3],
    pub rotate: [f64; 2],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: [1.0; 3],
            shift: [0.0; 3],
            rotate: [0.0; 2],
        }
    }
}

impl Transform {
    pub fn new(
        scale: [f64; 3],
        shift: [f64; 3],
        rotate: [f64; 2],
    ) -> Result<Self, MeshForestError> {
        let all = scale.iter().chain(&shift).chain(&rotate);
        if all.clone().any(|v| !v.is_finite()) {
            return Err(MeshForestError::InvalidMapParameter {
                map: "transform",
                reason: "scale, shift and rotation must be finite".into(),
            });
        }
        if scale.iter().any(|&s| s == 0.0) {
            return Err(MeshForestError::InvalidMapParameter {
                map: "transform",
                reason: format!("scale {scale:?} has a zero component"),
            });
        }
        Ok(Self {
            scale,
            shift,
            rotate,
        })
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut q = [
            p[0] * self.scale[0],
            p[1] * self.scale[1],
            p[2] * self.scale[2],
        ];
        let (sx, cx) = self.rotate[0].sin_cos();
        q = [q[0], cx * q[1] - sx * q[2], sx * q[1] + cx * q[2]];
        let (sz, cz) = self.rotate[1].sin_cos();
        q = [cz * q[0] - sz * q[1], sz * q[0] + cz * q[1], q[2]];
        [
            q[0] + self.shift[0],
            q[1] + self.shift[1],
            q[2] + self.shift[2],
        ]
    }
}

pub(crate) fn torus(r1: f64, r2: f64, xc: f64, yc: f64) -> [f64; 3] {
    let l = r1 + r2 * (2.0 * PI * yc).cos();
    [
        l * (2.0 * PI * xc).cos(),
        l * (2.0 * PI * xc).sin(),
        r2 * (2.0 * PI * yc).sin(),
    ]
}

/// Two blocks: each maps the unit square onto a disk and lifts it onto one
/// hemisphere of the unit sphere (block 0 upper, block 1 lower).
pub(crate) fn pillow_sphere(block: u32, xc: f64, yc: f64) -> [f64; 3] {
    let x = 2.0 * xc - 1.0;
    let y = 2.0 * yc - 1.0;
    let u = x * (1.0 - 0.5 * y * y).sqrt();
    let v = y * (1.0 - 0.5 * x * x).sqrt();
    let z = (1.0 - u * u - v * v).max(0.0).sqrt();
    if block == 0 { [u, v, z] } else { [-u, v, -z] }
}

/// Six blocks, one per cube face, with equiangular spacing.
pub(crate) fn cubed_sphere(block: u32, xc: f64, yc: f64) -> [f64; 3] {
    let a = (FRAC_PI_4 * (2.0 * xc - 1.0)).tan();
    let b = (FRAC_PI_4 * (2.0 * yc - 1.0)).tan();
    let p = match block {
        0 => [1.0, a, b],
        1 => [-a, 1.0, b],
        2 => [-1.0, -a, b],
        3 => [a, -1.0, b],
        4 => [-b, a, 1.0],
        _ => [b, a, -1.0],
    };
    let n = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    [p[0] / n, p[1] / n, p[2] / n]
}
