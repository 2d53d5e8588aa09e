//! Error types for the batcher
//!
//! Two layers:
//! - [`BatcherError`] - internal errors carried through `Result` across the
//!   service (RPC, storage, queue, submission failures)
//! - [`RejectReason`] - the typed, user-visible error kinds delivered as the
//!   terminal reply for a rejected submission

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ProvingSystem;

/// Errors that can occur inside the batcher
#[derive(Error, Debug)]
pub enum BatcherError {
    /// Could not bind or accept on the listen socket
    #[error("listener error: {0}")]
    Listener(String),

    /// CBOR encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Ethereum RPC unavailable on both primary and fallback endpoints
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),

    /// A contract call reverted or returned malformed data
    #[error("contract call failed: {0}")]
    ContractCall(String),

    /// Object storage write failed past the retry ceiling
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The batch transaction could not be confirmed
    #[error("batch submission failed: {0}")]
    BatchSubmission(#[from] SubmissionError),

    /// No selection of queued entries covers the aggregator cost
    #[error("batch cost too high for queued fees")]
    BatchCostTooHigh,

    /// Configuration invariant violated at boot
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure modes of the on-chain submission path
#[derive(Error, Debug)]
pub enum SubmissionError {
    /// The batcher wallet cannot cover gas plus the aggregator fee
    #[error("insufficient funds in batcher wallet")]
    InsufficientFunds,

    /// A task with this merkle root already exists on-chain
    #[error("batch already submitted")]
    BatchAlreadySubmitted,

    /// The contract rejected the quorum threshold parameters
    #[error("invalid quorum threshold")]
    InvalidQuorumThreshold,

    /// Simulation of the task creation call reverted
    #[error("task simulation reverted: {0}")]
    SimulationReverted(String),

    /// No receipt arrived within the full gas bump schedule
    #[error("no inclusion after {attempts} attempts")]
    InclusionTimeout { attempts: u32 },

    /// Transport-level failure talking to the RPC nodes
    #[error("transaction send failed: {0}")]
    SendFailed(String),
}

/// Result type for batcher operations
pub type Result<T> = std::result::Result<T, BatcherError>;

/// User-visible rejection kinds, serialized into reply frames.
///
/// Every rejected submission receives exactly one of these; they are the
/// only error surface clients ever observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Signature did not recover to a usable address
    InvalidSignature,
    /// Nonce is not the next usable one and does not name a queued entry
    InvalidNonce,
    /// A replacement named a queued entry but lowered its fee
    InvalidReplacement,
    /// A new nonce named a fee above an earlier pending entry's fee
    InvalidMaxFee,
    /// Balance (minus fees already pending) cannot cover the fee, or the
    /// balance is locked for withdrawal
    InsufficientBalance(Address),
    /// Pre-verification rejected the proof
    MalformedProof,
    /// The proving system is disabled by the service manager
    VerifierDisabled(ProvingSystem),
    /// Serialized proof exceeds the configured maximum
    ProofTooLarge,
    /// The connection's in-flight window or the verifier pool is full
    RateLimited,
    /// The batch containing this entry exhausted its submission budget
    BatchSubmissionFailed,
    /// Queue was flushed before the entry could be sealed
    BatchReset,
    /// Client protocol version is not supported
    ProtocolMismatch { expected: u16, got: u16 },
    /// Ethereum RPC failure prevented validating the submission
    RpcUnavailable,
    /// Unclassified server-side failure
    Internal,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InvalidSignature => write!(f, "invalid signature"),
            RejectReason::InvalidNonce => write!(f, "invalid nonce"),
            RejectReason::InvalidReplacement => write!(f, "invalid replacement"),
            RejectReason::InvalidMaxFee => write!(f, "invalid max fee"),
            RejectReason::InsufficientBalance(addr) => {
                write!(f, "insufficient balance for {addr}")
            }
            RejectReason::MalformedProof => write!(f, "malformed proof"),
            RejectReason::VerifierDisabled(system) => {
                write!(f, "verifier disabled for {system}")
            }
            RejectReason::ProofTooLarge => write!(f, "proof too large"),
            RejectReason::RateLimited => write!(f, "rate limited"),
            RejectReason::BatchSubmissionFailed => write!(f, "batch submission failed"),
            RejectReason::BatchReset => write!(f, "batch reset"),
            RejectReason::ProtocolMismatch { expected, got } => {
                write!(f, "protocol mismatch: expected {expected}, got {got}")
            }
            RejectReason::RpcUnavailable => write!(f, "rpc unavailable"),
            RejectReason::Internal => write!(f, "internal error"),
        }
    }
}

impl RejectReason {
    /// Label used for the rejection counter metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::InvalidNonce => "invalid_nonce",
            RejectReason::InvalidReplacement => "invalid_replacement",
            RejectReason::InvalidMaxFee => "invalid_max_fee",
            RejectReason::InsufficientBalance(_) => "insufficient_balance",
            RejectReason::MalformedProof => "malformed_proof",
            RejectReason::VerifierDisabled(_) => "verifier_disabled",
            RejectReason::ProofTooLarge => "proof_too_large",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::BatchSubmissionFailed => "batch_submission_failed",
            RejectReason::BatchReset => "batch_reset",
            RejectReason::ProtocolMismatch { .. } => "protocol_mismatch",
            RejectReason::RpcUnavailable => "rpc_unavailable",
            RejectReason::Internal => "internal",
        }
    }

    /// Whether the connection should be closed after delivering this reply.
    ///
    /// Fatal protocol violations terminate the stream; ordinary rejections
    /// leave it open for further submissions.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RejectReason::ProtocolMismatch { .. })
    }
}
