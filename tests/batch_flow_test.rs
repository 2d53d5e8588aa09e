//! End-to-end scenarios over the pure batching pipeline: queue rules,
//! selection, sealing, payload upload, and acknowledgment plumbing.

mod common;

use alloy::primitives::{Address, U256};

use common::{entry, submit, verification_data};
use proof_batcher::crypto::MerkleTree;
use proof_batcher::domain::{VerificationCommitment, VerificationData};
use proof_batcher::queue::{select_batch, PendingQueue, ReplyHandle, SelectionLimits};
use proof_batcher::store::{batch_key, MemoryStore, ObjectStore};
use proof_batcher::wire::{cbor_deserialize, cbor_serialize, ServerMessage};
use proof_batcher::RejectReason;

/// Wei per 0.001 ETH, the scale the scenarios speak in.
const MILLI_ETH: u64 = 1_000_000_000_000_000;

/// Default production-shaped fee policy: constant gas cost of the
/// default config (125k base + 125% of 330k aggregator gas), 2 gwei.
fn eth_limits() -> (SelectionLimits, U256) {
    let limits = SelectionLimits {
        max_batch_byte_size: 256 * 1024 * 1024,
        max_batch_proof_qty: 1024,
        constant_gas_cost: 537_500,
    };
    let gas_price = U256::from(2_000_000_000u64);
    (limits, gas_price)
}

#[test]
fn replacement_with_higher_fee_seals_the_replacement() {
    // Nonce 0 at 0.02 ETH, then nonce 0 again at 0.03 ETH.
    let mut queue = PendingQueue::new();
    let sender = Address::repeat_byte(1);
    submit(&mut queue, sender, 0, 20 * MILLI_ETH, u64::MAX).unwrap();
    submit(&mut queue, sender, 0, 30 * MILLI_ETH, u64::MAX).unwrap();

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();

    assert_eq!(selected.entries.len(), 1);
    assert_eq!(selected.fee_per_proof, U256::from(30 * MILLI_ETH));
}

#[test]
fn replacement_with_lower_fee_is_rejected() {
    // Nonce 0 at 0.02 ETH, then nonce 0 again at 0.01 ETH.
    let mut queue = PendingQueue::new();
    let sender = Address::repeat_byte(1);
    submit(&mut queue, sender, 0, 20 * MILLI_ETH, u64::MAX).unwrap();
    assert_eq!(
        submit(&mut queue, sender, 0, 10 * MILLI_ETH, u64::MAX),
        Err(RejectReason::InvalidReplacement)
    );

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();
    assert_eq!(selected.fee_per_proof, U256::from(20 * MILLI_ETH));
}

#[test]
fn three_submitters_pay_the_minimum_fee_in_arrival_order() {
    // Max fees 0.05, 0.01, 0.02 ETH arriving in that order.
    let mut queue = PendingQueue::new();
    let senders = [
        Address::repeat_byte(1),
        Address::repeat_byte(2),
        Address::repeat_byte(3),
    ];
    submit(&mut queue, senders[0], 0, 50 * MILLI_ETH, u64::MAX).unwrap();
    submit(&mut queue, senders[1], 0, 10 * MILLI_ETH, u64::MAX).unwrap();
    submit(&mut queue, senders[2], 0, 20 * MILLI_ETH, u64::MAX).unwrap();

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();

    assert_eq!(selected.entries.len(), 3);
    assert_eq!(selected.fee_per_proof, U256::from(10 * MILLI_ETH));
    // Leaf order equals arrival order.
    let order: Vec<Address> = selected.entries.iter().map(|e| e.payer).collect();
    assert_eq!(order, senders);
}

#[test]
fn single_entry_batch_covers_the_aggregator_fee() {
    // One proof at 0.01 ETH against a ~0.000825 ETH aggregator fee.
    let mut queue = PendingQueue::new();
    submit(
        &mut queue,
        Address::repeat_byte(1),
        0,
        10 * MILLI_ETH,
        100 * MILLI_ETH,
    )
    .unwrap();

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();

    assert_eq!(selected.entries.len(), 1);
    assert_eq!(selected.fee_per_proof, U256::from(10 * MILLI_ETH));

    let aggregator_fee = U256::from(330_000u64) * gas_price * U256::from(125u8) / U256::from(100u8);
    assert!(selected.fee_per_proof > aggregator_fee);
}

#[test]
fn evicted_submitter_leaves_a_viable_batch() {
    // Two payers; the broke one is evicted at seal time and the batch
    // proceeds with the rest.
    let mut queue = PendingQueue::new();
    let solvent = Address::repeat_byte(1);
    let broke = Address::repeat_byte(2);
    submit(&mut queue, solvent, 0, 20 * MILLI_ETH, u64::MAX).unwrap();
    submit(&mut queue, broke, 0, 20 * MILLI_ETH, u64::MAX).unwrap();

    let evicted = queue.evict_from(broke, 0);
    assert_eq!(evicted.len(), 1);

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();
    assert_eq!(selected.entries.len(), 1);
    assert_eq!(selected.entries[0].payer, solvent);
}

#[tokio::test]
async fn payload_upload_is_idempotent_and_recomputable() {
    let mut queue = PendingQueue::new();
    for byte in 1u8..=4 {
        submit(
            &mut queue,
            Address::repeat_byte(byte),
            0,
            20 * MILLI_ETH,
            u64::MAX,
        )
        .unwrap();
    }

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();

    let leaves: Vec<[u8; 32]> = selected
        .entries
        .iter()
        .map(|e| e.commitment.merkle_leaf())
        .collect();
    let tree = MerkleTree::build(&leaves).unwrap();
    let root = tree.root();

    let payload: Vec<&VerificationData> = selected
        .entries
        .iter()
        .map(|e| &e.submission.verification_data)
        .collect();
    let payload_bytes = cbor_serialize(&payload).unwrap();

    // Same key, same content, same URL: idempotent by construction.
    let store = MemoryStore::new();
    let key = batch_key(&root);
    let url_a = store.put(&key, payload_bytes.clone()).await.unwrap();
    let url_b = store.put(&key, payload_bytes.clone()).await.unwrap();
    assert_eq!(url_a, url_b);
    assert_eq!(store.len(), 1);

    // An operator recomputing the tree over the fetched payload lands on
    // the anchored root.
    let fetched = store.get(&key).unwrap();
    let decoded: Vec<VerificationData> = cbor_deserialize(&fetched).unwrap();
    let recomputed: Vec<[u8; 32]> = decoded
        .iter()
        .map(|data| VerificationCommitment::from(data).merkle_leaf())
        .collect();
    assert_eq!(MerkleTree::build(&recomputed).unwrap().root(), root);
}

#[tokio::test]
async fn inclusion_replies_reach_each_entry_exactly_once() {
    let mut queue = PendingQueue::new();
    let payer = Address::repeat_byte(1);
    queue.register_user(payer, 0);

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut queued = entry(&mut queue, payer, 0, 20 * MILLI_ETH, 7);
    queued.reply = Some(ReplyHandle::new(reply_tx, None));
    queue.submit(queued, U256::from(u64::MAX)).unwrap();

    let (limits, gas_price) = eth_limits();
    let selected = select_batch(queue.snapshot_by_priority(), gas_price, &limits).unwrap();
    let leaves: Vec<[u8; 32]> = selected
        .entries
        .iter()
        .map(|e| e.commitment.merkle_leaf())
        .collect();
    let tree = MerkleTree::build(&leaves).unwrap();

    let handle = selected.entries[0].reply.as_ref().unwrap();
    handle.send_terminal(ServerMessage::BatchInclusion {
        batch_merkle_root: tree.root(),
        merkle_proof: tree.prove(0).unwrap(),
        index_in_batch: 0,
    });
    // A second terminal reply must be swallowed.
    handle.send_terminal(ServerMessage::rejection(RejectReason::Internal));

    let first = reply_rx.recv().await.unwrap();
    match first {
        ServerMessage::BatchInclusion {
            batch_merkle_root,
            merkle_proof,
            index_in_batch,
        } => {
            assert_eq!(batch_merkle_root, tree.root());
            assert_eq!(index_in_batch, 0);
            assert!(merkle_proof.verify(&leaves[0], &tree.root()));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert!(reply_rx.try_recv().is_err());
}

#[test]
fn fingerprints_are_stable_across_the_wire() {
    // The fingerprint computed at ingress matches one recomputed from a
    // CBOR round-trip of the same data, so dedup holds across clients.
    let data = verification_data(9);
    let direct = VerificationCommitment::from(&data).fingerprint();

    let bytes = cbor_serialize(&data).unwrap();
    let decoded: VerificationData = cbor_deserialize(&bytes).unwrap();
    assert_eq!(VerificationCommitment::from(&decoded).fingerprint(), direct);
}
