//! 自愈恢复：诊断、沙箱复现、晋升

pub mod pipeline;
pub mod reproduce;
pub mod sandbox;
pub mod types;

pub use pipeline::{RecoveryContext, RecoveryPipeline};
pub use reproduce::{Reproducer, SandboxReproducer};
pub use sandbox::{ArtifactMapping, Sandbox};
pub use types::{
    CandidatePatch, Diagnosis, FailedCandidate, PromotionStatus, RecoveryOutcome, RecoverySession,
    VerificationResult,
};
