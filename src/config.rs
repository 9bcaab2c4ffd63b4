//! Read-only configuration consumed by the adaptation loop.

use crate::forest::TreeCell;
use crate::mesh_error::MeshForestError;
use serde::{Deserialize, Serialize};

/// Refinement and regridding parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmrOptions {
    /// Level of the initial uniform build; no patch coarsens below it.
    pub minlevel: u8,
    /// No patch refines beyond this level.
    pub maxlevel: u8,
    /// Extend every refinement request by one layer of same-level face neighbours.
    pub smooth_refine: bool,
    /// Smoothing only applies to requests at or above this level.
    pub smooth_refine_level: u8,
    /// Adaptation passes a patch must survive before it may coarsen.
    pub coarsen_delay: u32,
    /// Fill ghost cells and apply physical boundary conditions after the initial build.
    pub init_ghostcell: bool,
    /// Steps between regrids; `0` disables regridding during `advance`.
    pub regrid_interval: u32,
    /// Emit diagnostic output for each level of the initial refinement.
    pub output_init: bool,
    /// Label prefix for diagnostic output.
    pub prefix: String,
}

impl Default for AmrOptions {
    fn default() -> Self {
        Self {
            minlevel: 0,
            maxlevel: 0,
            smooth_refine: false,
            smooth_refine_level: 0,
            coarsen_delay: 0,
            init_ghostcell: true,
            regrid_interval: 1,
            output_init: false,
            prefix: "fort".into(),
        }
    }
}

impl AmrOptions {
    /// Options for a run that refines between `minlevel` and `maxlevel`.
    pub fn with_levels(minlevel: u8, maxlevel: u8) -> Self {
        Self {
            minlevel,
            maxlevel,
            ..Self::default()
        }
    }

    /// Reject inconsistent options for a forest of dimension `D`.
    pub fn validate<const D: usize>(&self) -> Result<(), MeshForestError> {
        if self.minlevel > self.maxlevel {
            return Err(MeshForestError::InvalidOptions(format!(
                "minlevel {} exceeds maxlevel {}",
                self.minlevel, self.maxlevel
            )));
        }
        if self.maxlevel > TreeCell::<D>::MAX_LEVEL {
            return Err(MeshForestError::InvalidOptions(format!(
                "maxlevel {} exceeds the {}-dimensional forest limit {}",
                self.maxlevel,
                D,
                TreeCell::<D>::MAX_LEVEL
            )));
        }
        Ok(())
    }

    /// Number of levels between `minlevel` and `maxlevel`, inclusive.
    pub fn level_count(&self) -> usize {
        (self.maxlevel.saturating_sub(self.minlevel)) as usize + 1
    }
}
