//! Property-based tests over the queue and batch selection.
//!
//! These verify the scheduling invariants for arbitrary submission
//! patterns: replace-by-fee, nonce contiguity, fee monotonicity, and the
//! guarantees of a frozen selection.

mod common;

use alloy::primitives::{Address, U256};
use proptest::prelude::*;

use common::{entry, submit};
use proof_batcher::queue::{
    fee_per_proof_floor, select_batch, PendingQueue, QueueEntry, SelectionLimits,
};
use proof_batcher::RejectReason;

// ============================================================================
// Strategies
// ============================================================================

/// A small pool of payer addresses so collisions actually happen.
fn arb_payer() -> impl Strategy<Value = Address> {
    (1u8..=5).prop_map(Address::repeat_byte)
}

/// Fees in a narrow band, again to force interesting collisions.
fn arb_fee() -> impl Strategy<Value = u64> {
    1_000u64..1_020
}

/// A batch of submission attempts: (payer, nonce, fee).
fn arb_attempts() -> impl Strategy<Value = Vec<(Address, u64, u64)>> {
    prop::collection::vec((arb_payer(), 0u64..6, arb_fee()), 1..40)
}

const BALANCE: u64 = u64::MAX / 2;

// ============================================================================
// Replace-by-fee and nonce rules
// ============================================================================

proptest! {
    /// Property: a second submission at the same (payer, nonce) is
    /// accepted iff it does not lower the fee.
    #[test]
    fn replace_by_fee_law(first in arb_fee(), second in arb_fee()) {
        let mut queue = PendingQueue::new();
        let payer = Address::repeat_byte(1);

        submit(&mut queue, payer, 0, first, BALANCE).unwrap();
        let outcome = submit(&mut queue, payer, 0, second, BALANCE);

        if second >= first {
            prop_assert!(outcome.is_ok());
            prop_assert_eq!(
                queue.snapshot_by_priority()[0].max_fee(),
                U256::from(second)
            );
        } else {
            prop_assert_eq!(outcome, Err(RejectReason::InvalidReplacement));
            prop_assert_eq!(
                queue.snapshot_by_priority()[0].max_fee(),
                U256::from(first)
            );
        }
        prop_assert_eq!(queue.len(), 1);
    }

    /// Property: whatever the submission pattern, each payer's queued
    /// nonces form a contiguous run starting at the ledger nonce (0 in
    /// these tests).
    #[test]
    fn queued_nonces_are_contiguous(attempts in arb_attempts()) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            let _ = submit(&mut queue, payer, nonce, fee, BALANCE);
        }

        for payer_byte in 1u8..=5 {
            let payer = Address::repeat_byte(payer_byte);
            let mut nonces: Vec<u64> = queue
                .snapshot_by_priority()
                .into_iter()
                .filter(|e| e.payer == payer)
                .map(|e| e.nonce())
                .collect();
            nonces.sort_unstable();
            for (i, nonce) in nonces.iter().enumerate() {
                prop_assert_eq!(*nonce, i as u64);
            }
        }
    }

    /// Property: per payer, fees never increase along the nonce sequence.
    #[test]
    fn fees_are_monotone_in_the_nonce(attempts in arb_attempts()) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            let _ = submit(&mut queue, payer, nonce, fee, BALANCE);
        }

        for payer_byte in 1u8..=5 {
            let payer = Address::repeat_byte(payer_byte);
            let mut entries: Vec<QueueEntry> = queue
                .snapshot_by_priority()
                .into_iter()
                .filter(|e| e.payer == payer)
                .collect();
            entries.sort_by_key(QueueEntry::nonce);
            for pair in entries.windows(2) {
                prop_assert!(pair[0].max_fee() >= pair[1].max_fee());
            }
        }
    }

    /// Property: the sum of pending fees per payer never exceeds the
    /// balance the submissions were checked against.
    #[test]
    fn pending_fees_fit_in_the_balance(attempts in arb_attempts(), balance in 1_000u64..10_000) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            queue.register_user(payer, 0);
            let e = entry(&mut queue, payer, nonce, fee, (nonce % 251) as u8);
            let _ = queue.submit(e, U256::from(balance));
        }

        for payer_byte in 1u8..=5 {
            let payer = Address::repeat_byte(payer_byte);
            if let Some(user) = queue.user(&payer) {
                prop_assert!(user.total_pending_fees <= U256::from(balance));
            }
        }
    }
}

// ============================================================================
// Selection invariants
// ============================================================================

fn limits() -> SelectionLimits {
    SelectionLimits {
        max_batch_byte_size: 1 << 20,
        max_batch_proof_qty: 64,
        constant_gas_cost: 10_000,
    }
}

proptest! {
    /// Property: for any accepted selection, every entry bids at least
    /// `fee_per_proof`, and `fee_per_proof` covers the gas-derived floor
    /// (so the gross fee covers the aggregator cost with margin).
    #[test]
    fn selection_entries_cover_the_fee(attempts in arb_attempts(), gas_price in 1u64..3) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            // Scale fees up so some selections clear the floor.
            let _ = submit(&mut queue, payer, nonce, fee * 16, BALANCE);
        }

        let gas_price = U256::from(gas_price);
        let limits = limits();
        if let Ok(selected) = select_batch(queue.snapshot_by_priority(), gas_price, &limits) {
            prop_assert!(!selected.entries.is_empty());
            prop_assert!(selected.entries.len() <= limits.max_batch_proof_qty);

            let floor = fee_per_proof_floor(
                selected.entries.len(),
                gas_price,
                limits.constant_gas_cost,
            );
            prop_assert!(selected.fee_per_proof >= floor);

            for entry in &selected.entries {
                prop_assert!(entry.max_fee() >= selected.fee_per_proof);
            }

            // The gross fee strictly exceeds the batch's constant cost,
            // which includes the aggregator's share.
            let gross = selected.fee_per_proof * U256::from(selected.entries.len() as u64);
            let constant_cost = U256::from(limits.constant_gas_cost) * gas_price;
            prop_assert!(gross > constant_cost);
        }
    }

    /// Property: leaf order is arrival order, and per payer that is also
    /// nonce order.
    #[test]
    fn selection_preserves_arrival_and_nonce_order(attempts in arb_attempts()) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            let _ = submit(&mut queue, payer, nonce, fee * 16, BALANCE);
        }

        if let Ok(selected) =
            select_batch(queue.snapshot_by_priority(), U256::from(1u8), &limits())
        {
            for pair in selected.entries.windows(2) {
                prop_assert!(pair[0].arrival < pair[1].arrival);
            }
            for payer_byte in 1u8..=5 {
                let payer = Address::repeat_byte(payer_byte);
                let nonces: Vec<u64> = selected
                    .entries
                    .iter()
                    .filter(|e| e.payer == payer)
                    .map(|e| e.nonce())
                    .collect();
                for pair in nonces.windows(2) {
                    prop_assert!(pair[0] < pair[1]);
                }
            }
        }
    }

    /// Property: a payer's selected nonces are a prefix of their queued
    /// run; the chain consumes nonces in order, so a gap would revert.
    #[test]
    fn selection_never_skips_a_nonce(attempts in arb_attempts()) {
        let mut queue = PendingQueue::new();
        for (payer, nonce, fee) in attempts {
            let _ = submit(&mut queue, payer, nonce, fee * 16, BALANCE);
        }

        if let Ok(selected) =
            select_batch(queue.snapshot_by_priority(), U256::from(1u8), &limits())
        {
            for payer_byte in 1u8..=5 {
                let payer = Address::repeat_byte(payer_byte);
                let mut nonces: Vec<u64> = selected
                    .entries
                    .iter()
                    .filter(|e| e.payer == payer)
                    .map(|e| e.nonce())
                    .collect();
                nonces.sort_unstable();
                for (i, nonce) in nonces.iter().enumerate() {
                    prop_assert_eq!(*nonce, i as u64);
                }
            }
        }
    }
}

// ============================================================================
// Gas bump schedule (submission boundary behavior)
// ============================================================================

proptest! {
    /// Property: the bump schedule reaches its cap in exactly
    /// `ceil((limit - base) / inc) + 1` attempts and never overshoots.
    #[test]
    fn bump_schedule_reaches_the_cap(
        base in 1u128..20,
        inc in 1u128..20,
        extra in 0u128..100,
    ) {
        use proof_batcher::submitter::{bump_percent, bumped_gas_price, max_bump_attempts};

        let limit = base + extra;
        let attempts = max_bump_attempts(base, inc, limit);
        let price = U256::from(1_000_000u64);

        // The last scheduled attempt is at the cap...
        prop_assert_eq!(bump_percent(attempts - 1, base, inc, limit), limit);
        // ...and no attempt exceeds it.
        for attempt in 0..attempts {
            let bumped = bumped_gas_price(price, attempt, base, inc, limit);
            prop_assert!(bumped <= price * U256::from(100 + limit) / U256::from(100u8));
        }
        // One fewer attempt would not have reached the cap.
        if attempts > 1 {
            prop_assert!(bump_percent(attempts - 2, base, inc, limit) < limit);
        }
    }
}
