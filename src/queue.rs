//! Fee-priority queue of pending entries
//!
//! Entries are identified by `(payer, nonce)`: a second submission with the
//! same key is a replace-by-fee attempt. Per-payer accounting enforces the
//! nonce and fee monotonicity rules at enqueue time so that seal-time
//! selection only has to re-confirm against the chain.
//!
//! The queue lock is held for short, synchronous critical sections only;
//! nothing here awaits.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, OwnedSemaphorePermit};

use crate::config::{CBOR_ARRAY_MAX_OVERHEAD, SUBMISSION_GAS_COST_PER_PROOF};
use crate::domain::{NoncedVerificationData, VerificationCommitment};
use crate::errors::{BatcherError, RejectReason, Result};
use crate::wire::ServerMessage;

/// Reply path of one submission back to its connection.
///
/// Carries the connection's in-flight window permit: delivering the
/// terminal reply (or dropping the handle, e.g. on replacement) frees the
/// slot. At most one terminal reply ever goes out per submission.
pub struct ReplyHandle {
    sink: mpsc::UnboundedSender<ServerMessage>,
    permit: std::sync::Mutex<Option<OwnedSemaphorePermit>>,
    done: AtomicBool,
}

impl ReplyHandle {
    pub fn new(
        sink: mpsc::UnboundedSender<ServerMessage>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            permit: std::sync::Mutex::new(permit),
            done: AtomicBool::new(false),
        })
    }

    /// Deliver the terminal reply. Later calls are ignored; sends to a
    /// closed connection are silently discarded.
    pub fn send_terminal(&self, message: ServerMessage) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let _permit = self
            .permit
            .lock()
            .expect("reply permit lock poisoned")
            .take();
        let _ = self.sink.send(message);
    }
}

/// One pending submission.
#[derive(Clone)]
pub struct QueueEntry {
    pub submission: NoncedVerificationData,
    pub commitment: VerificationCommitment,
    /// The paying address (after any non-paying substitution).
    pub payer: Address,
    /// Wire signature, republished to operators with the batch.
    pub signature: Vec<u8>,
    pub reply: Option<Arc<ReplyHandle>>,
    /// CBOR size of the verification data, fixed at ingress.
    pub serialized_size: usize,
    /// Global arrival sequence; determines leaf order and fee ties.
    pub arrival: u64,
    /// Block height when the entry was queued.
    pub queued_block: u64,
    /// Times this entry re-entered the queue after a failed batch.
    pub resubmissions: u32,
}

impl QueueEntry {
    pub fn nonce(&self) -> u64 {
        self.submission.nonce
    }

    pub fn max_fee(&self) -> U256 {
        self.submission.max_fee
    }

    fn key(&self) -> (Address, u64) {
        (self.payer, self.nonce())
    }
}

impl Eq for QueueEntry {}

// Two entries are the same queue slot when payer and nonce match; this is
// what makes replace-by-fee a remove-and-push.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Hash for QueueEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.payer.hash(state);
        self.nonce().hash(state);
    }
}

/// Queue priority: higher fee first, ties broken by earliest arrival.
#[derive(Clone, PartialEq, Eq)]
pub struct EntryPriority {
    max_fee: U256,
    arrival: u64,
}

impl EntryPriority {
    fn of(entry: &QueueEntry) -> Self {
        Self {
            max_fee: entry.max_fee(),
            arrival: entry.arrival,
        }
    }
}

impl PartialOrd for EntryPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.max_fee
            .cmp(&other.max_fee)
            .then(other.arrival.cmp(&self.arrival))
    }
}

/// Per-payer accounting over the pending entries.
#[derive(Debug, Clone)]
pub struct UserQueueState {
    /// The next nonce this payer may submit.
    pub expected_nonce: u64,
    /// Minimum `max_fee` among pending entries: the ceiling for the next
    /// submission (`U256::MAX` when nothing is pending).
    pub fee_limit: U256,
    /// Sum of pending `max_fee`s, reserved against the on-chain balance.
    pub total_pending_fees: U256,
    pub pending_count: usize,
}

impl UserQueueState {
    fn new(onchain_nonce: u64) -> Self {
        Self {
            expected_nonce: onchain_nonce,
            fee_limit: U256::MAX,
            total_pending_fees: U256::ZERO,
            pending_count: 0,
        }
    }
}

/// The queue plus its indices. Owned behind one mutex by the batcher.
pub struct PendingQueue {
    queue: PriorityQueue<QueueEntry, EntryPriority>,
    users: HashMap<Address, UserQueueState>,
    arrival_counter: u64,
    payload_bytes: usize,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            users: HashMap::new(),
            arrival_counter: 0,
            payload_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Serialized size of the batch the current queue would produce.
    pub fn size_bytes(&self) -> usize {
        if self.queue.is_empty() {
            0
        } else {
            CBOR_ARRAY_MAX_OVERHEAD + self.payload_bytes
        }
    }

    pub fn next_arrival(&mut self) -> u64 {
        let arrival = self.arrival_counter;
        self.arrival_counter += 1;
        arrival
    }

    /// Seed the payer's accounting from the on-chain nonce. A no-op if the
    /// payer is already tracked.
    pub fn register_user(&mut self, payer: Address, onchain_nonce: u64) {
        self.users
            .entry(payer)
            .or_insert_with(|| UserQueueState::new(onchain_nonce));
    }

    pub fn user(&self, payer: &Address) -> Option<&UserQueueState> {
        self.users.get(payer)
    }

    pub fn is_user_tracked(&self, payer: &Address) -> bool {
        self.users.contains_key(payer)
    }

    /// Block height of the oldest pending entry, if any.
    pub fn oldest_queued_block(&self) -> Option<u64> {
        self.queue.iter().map(|(e, _)| e.queued_block).min()
    }

    fn find(&self, payer: Address, nonce: u64) -> Option<QueueEntry> {
        self.queue
            .iter()
            .find(|(e, _)| e.payer == payer && e.nonce() == nonce)
            .map(|(e, _)| e.clone())
    }

    fn recompute_user(&mut self, payer: Address) {
        let mut fee_limit = U256::MAX;
        let mut total = U256::ZERO;
        let mut count = 0usize;
        for (entry, _) in self.queue.iter() {
            if entry.payer == payer {
                fee_limit = fee_limit.min(entry.max_fee());
                total += entry.max_fee();
                count += 1;
            }
        }
        if let Some(user) = self.users.get_mut(&payer) {
            user.fee_limit = fee_limit;
            user.total_pending_fees = total;
            user.pending_count = count;
        }
    }

    /// Enqueue a validated entry for `balance`-backed payer, applying the
    /// nonce, fee-monotonicity, and replace-by-fee rules.
    ///
    /// The caller must have registered the payer and read its balance from
    /// the ledger beforehand.
    pub fn submit(&mut self, entry: QueueEntry, balance: U256) -> std::result::Result<(), RejectReason> {
        let payer = entry.payer;
        let Some(user) = self.users.get(&payer) else {
            return Err(RejectReason::Internal);
        };

        // Everything pending plus this entry must fit in the balance; a
        // replacement is charged conservatively on top of the entry it
        // frees, as the old entry may still seal if this one is rejected.
        if balance < user.total_pending_fees + entry.max_fee() {
            return Err(RejectReason::InsufficientBalance(payer));
        }

        let nonce = entry.nonce();
        let expected = user.expected_nonce;

        if nonce > expected {
            return Err(RejectReason::InvalidNonce);
        }

        if nonce < expected {
            return self.replace(entry);
        }

        if entry.max_fee() > user.fee_limit {
            return Err(RejectReason::InvalidMaxFee);
        }

        let fee = entry.max_fee();
        let size = entry.serialized_size;
        let priority = EntryPriority::of(&entry);
        self.queue.push(entry, priority);
        self.payload_bytes += size;

        let user = self.users.get_mut(&payer).expect("user checked above");
        user.expected_nonce = nonce + 1;
        user.fee_limit = user.fee_limit.min(fee);
        user.total_pending_fees += fee;
        user.pending_count += 1;
        Ok(())
    }

    /// Replace-by-fee: accepted iff the new fee is at least the queued
    /// entry's fee and does not break monotonicity against lower nonces.
    fn replace(&mut self, entry: QueueEntry) -> std::result::Result<(), RejectReason> {
        let payer = entry.payer;
        let nonce = entry.nonce();

        let Some(existing) = self.find(payer, nonce) else {
            return Err(RejectReason::InvalidNonce);
        };

        if entry.max_fee() < existing.max_fee() {
            return Err(RejectReason::InvalidReplacement);
        }

        let lower_nonce_floor = self
            .queue
            .iter()
            .filter(|(e, _)| e.payer == payer && e.nonce() < nonce)
            .map(|(e, _)| e.max_fee())
            .min()
            .unwrap_or(U256::MAX);
        if entry.max_fee() > lower_nonce_floor {
            return Err(RejectReason::InvalidReplacement);
        }

        // The replaced submission gets no further reply; its reply path is
        // released here, exactly as if the client had closed it.
        self.queue.remove(&existing);
        self.payload_bytes -= existing.serialized_size;

        // Replacement keeps the original arrival slot.
        let mut entry = entry;
        entry.arrival = existing.arrival;
        entry.queued_block = existing.queued_block;
        let size = entry.serialized_size;
        let priority = EntryPriority::of(&entry);
        self.queue.push(entry, priority);
        self.payload_bytes += size;

        self.recompute_user(payer);
        Ok(())
    }

    /// Clone the pending entries, highest fee first (arrival breaks ties).
    pub fn snapshot_by_priority(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.queue.iter().map(|(e, _)| e.clone()).collect();
        entries.sort_by(|a, b| {
            b.max_fee()
                .cmp(&a.max_fee())
                .then(a.arrival.cmp(&b.arrival))
        });
        entries
    }

    /// Drop entries confirmed on-chain. The expected nonce is untouched:
    /// the chain advanced to match it.
    pub fn remove_confirmed(&mut self, keys: &[(Address, u64)]) {
        for &(payer, nonce) in keys {
            if let Some(existing) = self.find(payer, nonce) {
                self.queue.remove(&existing);
                self.payload_bytes -= existing.serialized_size;
            } else {
                tracing::error!(
                    %payer,
                    nonce,
                    "confirmed entry missing from queue; accounting bug"
                );
            }
        }
        let payers: Vec<Address> = keys.iter().map(|(p, _)| *p).collect();
        for payer in payers {
            self.recompute_user(payer);
        }
    }

    /// Evict a payer's entries from `from_nonce` upward. Later nonces must
    /// go too or the contiguity invariant breaks. Returns the evicted
    /// entries in nonce order so callers can notify their connections.
    pub fn evict_from(&mut self, payer: Address, from_nonce: u64) -> Vec<QueueEntry> {
        let mut evicted: Vec<QueueEntry> = self
            .queue
            .iter()
            .filter(|(e, _)| e.payer == payer && e.nonce() >= from_nonce)
            .map(|(e, _)| e.clone())
            .collect();
        evicted.sort_by_key(QueueEntry::nonce);

        for entry in &evicted {
            self.queue.remove(entry);
            self.payload_bytes -= entry.serialized_size;
        }

        if let Some(user) = self.users.get_mut(&payer) {
            user.expected_nonce = user.expected_nonce.min(from_nonce);
        }
        self.recompute_user(payer);
        evicted
    }

    /// Count a failed submission against each entry; entries past the cap
    /// are evicted (with their later nonces) and returned.
    pub fn bump_resubmissions(
        &mut self,
        keys: &[(Address, u64)],
        cap: u32,
    ) -> Vec<QueueEntry> {
        let mut exceeded: Vec<(Address, u64)> = Vec::new();
        for (entry, _) in self.queue.iter_mut() {
            if keys.contains(&(entry.payer, entry.nonce())) {
                entry.resubmissions += 1;
                if entry.resubmissions > cap {
                    exceeded.push((entry.payer, entry.nonce()));
                }
            }
        }

        let mut evicted = Vec::new();
        for (payer, nonce) in exceeded {
            evicted.extend(self.evict_from(payer, nonce));
        }
        evicted
    }

    /// Drain the whole queue (verifier bitmap changed or fee accounting was
    /// reset). Returns the drained entries for notification.
    pub fn flush(&mut self) -> Vec<QueueEntry> {
        let entries: Vec<QueueEntry> = self.queue.iter().map(|(e, _)| e.clone()).collect();
        self.queue.clear();
        self.users.clear();
        self.payload_bytes = 0;
        entries
    }
}

/// Selection limits, fixed from configuration.
#[derive(Debug, Clone)]
pub struct SelectionLimits {
    pub max_batch_byte_size: usize,
    pub max_batch_proof_qty: usize,
    pub constant_gas_cost: u128,
}

/// A frozen selection: entries in leaf (arrival) order plus the uniform fee.
pub struct SelectedBatch {
    pub entries: Vec<QueueEntry>,
    pub fee_per_proof: U256,
}

/// Gas-derived floor under `fee_per_proof` for a batch of `batch_len`
/// proofs: the per-proof share of the constant cost plus the marginal
/// per-proof cost, at `gas_price`.
pub fn fee_per_proof_floor(batch_len: usize, gas_price: U256, constant_gas_cost: u128) -> U256 {
    debug_assert!(batch_len > 0);
    let gas_per_proof = (constant_gas_cost
        + SUBMISSION_GAS_COST_PER_PROOF * batch_len as u128)
        / batch_len as u128;
    U256::from(gas_per_proof) * gas_price
}

/// Pick the largest batch whose every member is willing to pay its share.
///
/// Starting from all candidates (highest fee first), the lowest-fee entry
/// is dropped while the batch exceeds the byte or count caps or while the
/// lowest bid is under the gas-derived floor. Shrinking the batch raises
/// the floor's constant-cost share, so the loop converges; an empty result
/// means nobody currently bids enough.
///
/// The surviving selection is reordered by arrival, which is the leaf
/// order (and, per payer, nonce order, as fees are non-increasing in the
/// nonce).
pub fn select_batch(
    candidates: Vec<QueueEntry>,
    gas_price: U256,
    limits: &SelectionLimits,
) -> Result<SelectedBatch> {
    let mut selection = candidates;
    selection.sort_by(|a, b| {
        b.max_fee()
            .cmp(&a.max_fee())
            .then(a.arrival.cmp(&b.arrival))
    });

    let mut batch_bytes =
        CBOR_ARRAY_MAX_OVERHEAD + selection.iter().map(|e| e.serialized_size).sum::<usize>();

    loop {
        let Some(lowest) = selection.last() else {
            return Err(BatcherError::BatchCostTooHigh);
        };

        let floor = fee_per_proof_floor(selection.len(), gas_price, limits.constant_gas_cost);
        if batch_bytes > limits.max_batch_byte_size
            || selection.len() > limits.max_batch_proof_qty
            || lowest.max_fee() < floor
        {
            let dropped = selection.pop().expect("selection is non-empty");
            batch_bytes -= dropped.serialized_size;
            continue;
        }
        break;
    }

    let fee_per_proof = selection
        .iter()
        .map(QueueEntry::max_fee)
        .min()
        .expect("selection is non-empty");

    let mut entries = selection;
    entries.sort_by_key(|e| e.arrival);

    Ok(SelectedBatch {
        entries,
        fee_per_proof,
    })
}
