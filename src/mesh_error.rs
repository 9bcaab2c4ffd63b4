//! MeshForestError: unified error type for mesh-forest public APIs
//!
//! Every fallible operation in the crate returns this error. Collective
//! operations never retry: a fatal error (see [`MeshForestError::is_fatal`])
//! means the calling process must abandon the run, because the other
//! processes are blocked inside the same collective waiting on it.

use thiserror::Error;

/// Unified error type for mesh-forest operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshForestError {
    // ----- configuration errors (reported to the caller) -----------------
    /// A map variant was constructed with parameters that violate its constraints.
    #[error("invalid {map} map parameter: {reason}")]
    InvalidMapParameter { map: &'static str, reason: String },
    /// Adaptation options are inconsistent.
    #[error("invalid AMR options: {0}")]
    InvalidOptions(String),
    /// Block connectivity is inconsistent with the requested layout.
    #[error("invalid connectivity: {0}")]
    InvalidConnectivity(String),
    /// A block index outside the range a map or connectivity supports.
    #[error("block {block} out of range (have {num_blocks} blocks)")]
    InvalidBlock { block: u32, num_blocks: u32 },

    // ----- precondition violations (fatal) --------------------------------
    /// A patch lifecycle transition was attempted from the wrong state.
    #[error("patch {index}: cannot {operation} from state {state}")]
    PatchStateViolation {
        index: usize,
        operation: &'static str,
        state: &'static str,
    },
    /// Solver state was read before build + initialize completed.
    #[error("patch {0} read before it was initialized")]
    UninitializedPatch(usize),
    /// An operation that needs neighbor classification ran before `setup`.
    #[error("domain generation {0} used before setup")]
    DomainNotSetUp(u64),
    /// The ghost pattern was built for a different domain generation.
    #[error("ghost pattern built for generation {pattern}, domain is at generation {domain}")]
    StaleGhostPattern { pattern: u64, domain: u64 },
    /// Processes entered a collective at different domain generations.
    #[error("collective `{operation}` entered at diverging generations (local {local}, remote {remote})")]
    GenerationMismatch {
        operation: &'static str,
        local: u64,
        remote: u64,
    },
    /// Processes passed different arguments to the same collective.
    #[error("collective `{operation}` called with mismatched arguments: {detail}")]
    CollectiveMismatch {
        operation: &'static str,
        detail: String,
    },
    /// A ghost face crosses refinement levels but interpolation was disabled.
    #[error("patch {patch}: neighbor across face {face} is at level {neighbor_level}, patch is at level {level}")]
    LevelMismatch {
        patch: usize,
        face: usize,
        level: u8,
        neighbor_level: u8,
    },
    /// A new-domain patch was left unpopulated or populated twice.
    #[error("repopulate: patch {patch} {reason}")]
    RepopulateIncomplete { patch: usize, reason: &'static str },
    /// Face neighbors differ by more than one level.
    #[error("forest is not 2:1 balanced around block {block} level {level} cell {coords}")]
    UnbalancedForest {
        block: u32,
        level: u8,
        coords: String,
    },
    /// Internal consistency check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    // ----- communication ---------------------------------------------------
    /// A point-to-point message failed or never arrived.
    #[error("communication with rank {neighbor} failed: {reason}")]
    CommError { neighbor: usize, reason: String },
    /// A received message did not decode.
    #[error("malformed message from rank {neighbor}: {reason}")]
    WireFormat { neighbor: usize, reason: String },

    // ----- collaborators ----------------------------------------------------
    /// Failure reported by the external solver kernel.
    #[error("solver kernel failed on patch {patch}: {reason}")]
    Solver { patch: usize, reason: String },
    /// Failure reported by an output writer.
    #[error("output writer failed for `{label}`: {reason}")]
    Output { label: String, reason: String },
}

impl MeshForestError {
    /// Returns `true` for errors after which the distributed run must be
    /// abandoned: precondition violations, communication failures and
    /// solver failures inside a collective. Configuration errors are not
    /// fatal; they are raised before any collective state exists.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MeshForestError::InvalidMapParameter { .. }
                | MeshForestError::InvalidOptions(_)
                | MeshForestError::InvalidConnectivity(_)
                | MeshForestError::Output { .. }
        )
    }

    pub(crate) fn solver(patch: usize, reason: impl Into<String>) -> Self {
        MeshForestError::Solver {
            patch,
            reason: reason.into(),
        }
    }
}
