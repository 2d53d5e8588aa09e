//! Core domain types: proving systems, submissions, commitments, and the
//! batch lifecycle.

mod batch;
mod types;

pub use batch::{Batch, BatchState};
pub use types::{
    NoncedVerificationData, ProvingSystem, VerificationCommitment, VerificationData,
};
