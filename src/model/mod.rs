//! Domain models for the scheduling core.

pub mod bead;
pub mod convoy;
pub mod polecat;
pub mod rig;

pub use bead::{
    Bead, BeadBuilder, BeadOutcome, BeadPriority, BeadStatus, ExecutionResult, FileChange,
    FileChangeKind, VerificationReport,
};
pub use convoy::{Convoy, ConvoyProgress, ConvoyStatus};
pub use polecat::{PolecatIdentity, PolecatSession, SessionStatus};
pub use rig::{Rig, RigSettings};
