//! Communication layer: backends, collectives and wire records.

pub mod collective;
pub mod communicator;
pub mod wire;

pub use communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
