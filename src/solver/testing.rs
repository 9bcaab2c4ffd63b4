//! Minimal solver for unit tests: one value per patch.

use super::PatchSolver;
use crate::forest::Face;
use crate::mesh_error::MeshForestError;
use crate::patch::{BuildMode, PatchInfo};
use std::sync::atomic::{AtomicUsize, Ordering};

/// State is `[value, ghost-sum]`; the value is the patch center's x coordinate
/// plus its block index.
#[derive(Default, Debug)]
pub(crate) struct CountingSolver {
    pub initialized: AtomicUsize,
    pub interpolated: AtomicUsize,
    pub restricted: AtomicUsize,
    pub face_fills: AtomicUsize,
}

impl<const D: usize> PatchSolver<D> for CountingSolver {
    type State = Vec<f64>;

    fn build(&self, _info: &PatchInfo<D>, _mode: BuildMode) -> Result<Vec<f64>, MeshForestError> {
        Ok(vec![0.0; 2])
    }

    fn initialize(&self, info: &PatchInfo<D>, state: &mut Vec<f64>) -> Result<(), MeshForestError> {
        self.initialized.fetch_add(1, Ordering::Relaxed);
        state[0] = 0.5 * (info.lower[0] + info.upper[0]) + info.block() as f64;
        Ok(())
    }

    fn interpolate(
        &self,
        _coarse_info: &PatchInfo<D>,
        coarse: &Vec<f64>,
        _fine_info: &PatchInfo<D>,
        fine: &mut Vec<f64>,
    ) -> Result<(), MeshForestError> {
        self.interpolated.fetch_add(1, Ordering::Relaxed);
        fine[0] = coarse[0];
        Ok(())
    }

    fn restrict(
        &self,
        fine: &[(&PatchInfo<D>, &Vec<f64>)],
        _coarse_info: &PatchInfo<D>,
        coarse: &mut Vec<f64>,
    ) -> Result<(), MeshForestError> {
        self.restricted.fetch_add(1, Ordering::Relaxed);
        coarse[0] = fine.iter().map(|(_, s)| s[0]).sum::<f64>() / fine.len() as f64;
        Ok(())
    }

    fn copy_face(&self, dst: &mut Vec<f64>, _f: Face, src: &Vec<f64>) -> Result<(), MeshForestError> {
        self.face_fills.fetch_add(1, Ordering::Relaxed);
        dst[1] += src[0];
        Ok(())
    }

    fn average_face(
        &self,
        dst: &mut Vec<f64>,
        _f: Face,
        _subface: usize,
        src: &Vec<f64>,
    ) -> Result<(), MeshForestError> {
        self.face_fills.fetch_add(1, Ordering::Relaxed);
        dst[1] += src[0];
        Ok(())
    }

    fn interpolate_face(
        &self,
        dst: &mut Vec<f64>,
        _f: Face,
        _subface: usize,
        src: &Vec<f64>,
    ) -> Result<(), MeshForestError> {
        self.face_fills.fetch_add(1, Ordering::Relaxed);
        dst[1] += src[0];
        Ok(())
    }

    fn pack(&self, state: &Vec<f64>) -> Vec<u8> {
        bytemuck::cast_slice(&state[..1]).to_vec()
    }

    fn unpack(&self, info: &PatchInfo<D>, _mode: BuildMode, bytes: &[u8]) -> Result<Vec<f64>, MeshForestError> {
        if bytes.len() != 8 {
            return Err(MeshForestError::solver(info.global_index, "bad payload"));
        }
        let mut v: Vec<f64> = bytes.chunks_exact(8).map(bytemuck::pod_read_unaligned).collect();
        v.push(0.0);
        Ok(v)
    }

    fn compute_update(
        &self,
        _info: &PatchInfo<D>,
        _state: &mut Vec<f64>,
        _t: f64,
        _dt: f64,
    ) -> Result<f64, MeshForestError> {
        Ok(0.0)
    }
}
