//! 证据校验

pub mod gate;

pub use gate::{Decision, EvidenceGate, Verifier};
