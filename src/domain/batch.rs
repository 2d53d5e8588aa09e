//! Batch lifecycle
//!
//! A batch exists only between seal and confirmation; it is owned by the
//! finalizer task and never persists across a restart. The selected
//! entries travel alongside in the finalizer, keyed by leaf order.

use alloy::primitives::U256;

use crate::crypto::Hash256;

/// States a batch moves through after selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Sealing,
    Submitted,
    Confirmed,
    Failed,
}

/// Metadata of a sealed batch handed from the finalizer to the submission
/// engine.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Keccak Merkle root over the entries' fingerprints in leaf order.
    pub merkle_root: Hash256,
    /// URL under which the CBOR payload was uploaded.
    pub data_pointer: String,
    /// Fee debited from each included submitter; the minimum of the
    /// selected entries' max fees is an upper bound for this value.
    pub fee_per_proof: U256,
    /// Fee forwarded to the aggregator for the response transaction.
    pub aggregator_fee: U256,
    /// Ceiling the contract enforces on the aggregator's response cost.
    pub respond_to_task_fee_limit: U256,
    /// Gas price the fee math was computed against.
    pub gas_price: U256,
    /// Number of entries (leaves).
    pub entry_count: usize,
    /// Block at which the oldest included entry was queued.
    pub created_block: u64,
    /// Block at which selection froze.
    pub sealed_block: u64,
    pub submit_attempts: u32,
    pub state: BatchState,
}

impl Batch {
    /// Gross fee collected from submitters.
    pub fn gross_fee(&self) -> U256 {
        self.fee_per_proof * U256::from(self.entry_count as u64)
    }

    /// A batch is viable only if the collected fees cover the aggregator
    /// with margin.
    pub fn covers_aggregator_fee(&self) -> bool {
        self.gross_fee() > self.aggregator_fee
    }
}
