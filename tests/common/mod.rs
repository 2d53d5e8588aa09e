#![allow(dead_code)]

//! Shared helpers for the integration and property suites.

use alloy::primitives::{Address, U256};

use proof_batcher::domain::{
    NoncedVerificationData, ProvingSystem, VerificationCommitment, VerificationData,
};
use proof_batcher::queue::{PendingQueue, QueueEntry};

/// Deterministic verification data with a payload derived from `seed`.
pub fn verification_data(seed: u8) -> VerificationData {
    VerificationData {
        proving_system: ProvingSystem::Risc0,
        proof: vec![seed; 32],
        public_input: Some(vec![seed ^ 0xff; 16]),
        verification_key: None,
        vm_program: Some(vec![seed.wrapping_add(1); 32]),
        proof_generator_addr: Address::repeat_byte(seed),
    }
}

/// Build a queue entry ready for `PendingQueue::submit`.
pub fn entry(
    queue: &mut PendingQueue,
    payer: Address,
    nonce: u64,
    max_fee: u64,
    seed: u8,
) -> QueueEntry {
    let data = verification_data(seed);
    let commitment = VerificationCommitment::from(&data);
    QueueEntry {
        submission: NoncedVerificationData {
            verification_data: data,
            nonce,
            max_fee: U256::from(max_fee),
        },
        commitment,
        payer,
        signature: vec![0u8; 65],
        reply: None,
        serialized_size: 128,
        arrival: queue.next_arrival(),
        queued_block: 1,
        resubmissions: 0,
    }
}

/// Register `payer` (at on-chain nonce 0) and submit one entry against
/// `balance`.
pub fn submit(
    queue: &mut PendingQueue,
    payer: Address,
    nonce: u64,
    max_fee: u64,
    balance: u64,
) -> Result<(), proof_batcher::RejectReason> {
    queue.register_user(payer, 0);
    let e = entry(queue, payer, nonce, max_fee, (nonce % 251) as u8);
    queue.submit(e, U256::from(balance))
}
