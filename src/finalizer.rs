//! Batch finalizer
//!
//! A single task that reacts to new blocks: decides when the queue is
//! ripe, freezes a selection, re-confirms every selected payer against
//! the chain, uploads the payload, and hands the task to the submission
//! engine. Entries stay in the queue until their batch confirms, so a
//! failed submission needs no explicit re-queue.
//!
//! There is at most one open batch at a time; the finalizer owns it
//! exclusively and everything else communicates through channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, U256};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::PERCENTAGE_DIVIDER;
use crate::crypto::MerkleTree;
use crate::domain::{Batch, BatchState, VerificationData};
use crate::errors::{BatcherError, RejectReason, Result, SubmissionError};
use crate::queue::{select_batch, QueueEntry, SelectedBatch, SelectionLimits};
use crate::server::BatcherState;
use crate::store::{batch_key, ObjectStore};
use crate::shutdown::ShutdownSignal;
use crate::submitter::{SubmissionEngine, SubmitOutcome, TaskParams};
use crate::telemetry::TelemetrySender;
use crate::wire::{cbor_serialize, ServerMessage};

/// Deliver a terminal reply to an entry's connection, if it still exists.
pub fn notify_entry(entry: &QueueEntry, message: ServerMessage) {
    if let Some(reply) = &entry.reply {
        reply.send_terminal(message);
    }
}

/// Outcome of one seal-time confirmation round.
enum SealCheck {
    /// Every payer checked out; the selection may seal.
    Stable,
    /// At least one payer was evicted; reselect.
    Evicted,
    /// The ledger could not answer; try again on a later block.
    Defer,
}

pub struct Finalizer {
    state: Arc<BatcherState>,
    store: Arc<dyn ObjectStore>,
    engine: SubmissionEngine,
    telemetry: TelemetrySender,
}

impl Finalizer {
    pub fn new(
        state: Arc<BatcherState>,
        store: Arc<dyn ObjectStore>,
        engine: SubmissionEngine,
        telemetry: TelemetrySender,
    ) -> Self {
        Self {
            state,
            store,
            engine,
            telemetry,
        }
    }

    /// Main loop: blocks drive finalization, bitmap changes flush the
    /// queue, shutdown discards open work.
    pub async fn run(
        self,
        mut blocks_rx: mpsc::Receiver<u64>,
        mut bitmap_rx: mpsc::Receiver<U256>,
        shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    self.discard_open_work();
                    return;
                }
                bitmap = bitmap_rx.recv() => {
                    let Some(bitmap) = bitmap else { return };
                    self.apply_bitmap(bitmap).await;
                }
                block = blocks_rx.recv() => {
                    let Some(mut block) = block else { return };
                    // A slow submission can back blocks up; only the
                    // newest height matters.
                    while let Ok(later) = blocks_rx.try_recv() {
                        block = later;
                    }
                    self.state
                        .current_block
                        .store(block, std::sync::atomic::Ordering::SeqCst);

                    if let Err(e) = self.handle_new_block(block).await {
                        error!(block, error = %e, "block handling failed");
                    }
                }
            }
        }
    }

    /// Swap in a new disabled-verifier bitmap. Entries already verified
    /// under the old bitmap are flushed back to their clients.
    async fn apply_bitmap(&self, bitmap: U256) {
        let changed = {
            let mut current = self
                .state
                .disabled_verifiers
                .lock()
                .expect("bitmap lock poisoned");
            if *current == bitmap {
                false
            } else {
                *current = bitmap;
                true
            }
        };
        if !changed {
            return;
        }

        warn!(%bitmap, "disabled-verifier bitmap changed, flushing queue");
        let flushed = {
            let mut queue = self.state.queue.lock().expect("queue lock poisoned");
            queue.flush()
        };
        for entry in &flushed {
            notify_entry(entry, ServerMessage::rejection(RejectReason::BatchReset));
        }
        self.state.ledger.clear_cache();
        self.update_queue_metrics();
    }

    async fn handle_new_block(&self, block: u64) -> Result<()> {
        let (gas_price, bitmap) = tokio::join!(
            self.state.ledger.gas_price(),
            self.state.ledger.disabled_verifiers(),
        );
        if let Ok(bitmap) = bitmap {
            self.apply_bitmap(bitmap).await;
        }
        let gas_price = gas_price?;
        let gas_price = gas_price * U256::from(self.state.config.gas_price_percentage_multiplier)
            / U256::from(PERCENTAGE_DIVIDER);

        if !self.batch_is_due(block) {
            return Ok(());
        }

        let Some(selected) = self.freeze_selection(gas_price).await else {
            return Ok(());
        };

        self.seal_and_submit(block, gas_price, selected).await
    }

    /// Any of: queue byte size past the interval threshold, entry count
    /// at the cap, or the oldest entry aged past the block interval.
    fn batch_is_due(&self, block: u64) -> bool {
        let config = &self.state.config;
        let queue = self.state.queue.lock().expect("queue lock poisoned");
        if queue.is_empty() {
            return false;
        }

        let by_size = queue.size_bytes() >= config.batch_size_interval;
        let by_count = queue.len() >= config.max_batch_proof_qty;
        let by_age = queue
            .oldest_queued_block()
            .is_some_and(|oldest| block >= oldest + config.block_interval);

        if !(by_size || by_count || by_age) {
            info!(
                len = queue.len(),
                bytes = queue.size_bytes(),
                "batch not ready, waiting for more proofs or blocks"
            );
        }
        by_size || by_count || by_age
    }

    /// Select under the fee policy, then re-confirm every selected payer
    /// on-chain, evicting mismatches and reselecting until stable.
    async fn freeze_selection(&self, gas_price: U256) -> Option<SelectedBatch> {
        let config = &self.state.config;
        let limits = SelectionLimits {
            max_batch_byte_size: config.max_batch_byte_size,
            max_batch_proof_qty: config.max_batch_proof_qty,
            constant_gas_cost: config.constant_gas_cost(),
        };

        // Each round either returns a stable selection or evicts at least
        // one entry, so the loop is bounded by the queue length; the cap
        // is a backstop against surprises.
        for _ in 0..64 {
            let snapshot = {
                let queue = self.state.queue.lock().expect("queue lock poisoned");
                queue.snapshot_by_priority()
            };
            if snapshot.is_empty() {
                return None;
            }

            let selected = match select_batch(snapshot, gas_price, &limits) {
                Ok(selected) => selected,
                Err(BatcherError::BatchCostTooHigh) => {
                    info!("no fee-covering batch found, waiting for more proofs");
                    return None;
                }
                Err(e) => {
                    error!(error = %e, "batch selection failed");
                    return None;
                }
            };

            match self.confirm_payers(&selected).await {
                SealCheck::Stable => return Some(selected),
                SealCheck::Evicted => continue,
                SealCheck::Defer => return None,
            }
        }
        warn!("selection did not stabilize, deferring batch");
        None
    }

    /// Seal-time ledger confirmation.
    async fn confirm_payers(&self, selected: &SelectedBatch) -> SealCheck {
        // Per payer: lowest selected nonce and entry count.
        let mut payers: HashMap<Address, (u64, usize)> = HashMap::new();
        for entry in &selected.entries {
            let slot = payers
                .entry(entry.payer)
                .or_insert((entry.nonce(), 0));
            slot.0 = slot.0.min(entry.nonce());
            slot.1 += 1;
        }

        let mut outcome = SealCheck::Stable;
        for (payer, (first_nonce, count)) in payers {
            self.state.ledger.invalidate(payer).await;
            let view = match self.state.ledger.get(payer).await {
                Ok(view) => view,
                Err(e) => {
                    // Missing data is no grounds for eviction; the batch
                    // waits for the ledger to come back.
                    warn!(error = %e, "ledger unavailable at seal time, deferring");
                    return SealCheck::Defer;
                }
            };

            let needed = selected.fee_per_proof * U256::from(count as u64);
            if view.withdrawal_initiated() || view.balance < needed {
                warn!(%payer, "insufficient or locked balance at seal time, evicting");
                self.evict(payer, first_nonce, RejectReason::InsufficientBalance(payer));
                outcome = SealCheck::Evicted;
                continue;
            }

            if view.nonce != first_nonce {
                warn!(
                    %payer,
                    onchain = view.nonce,
                    queued = first_nonce,
                    "nonce mismatch at seal time, evicting"
                );
                self.evict(payer, view.nonce.min(first_nonce), RejectReason::InvalidNonce);
                outcome = SealCheck::Evicted;
            }
        }
        outcome
    }

    fn evict(&self, payer: Address, from_nonce: u64, reason: RejectReason) {
        let evicted = {
            let mut queue = self.state.queue.lock().expect("queue lock poisoned");
            queue.evict_from(payer, from_nonce)
        };
        for entry in &evicted {
            notify_entry(entry, ServerMessage::rejection(reason.clone()));
            self.state.metrics.rejection(reason.metric_label());
        }
        self.update_queue_metrics();
    }

    async fn seal_and_submit(
        &self,
        block: u64,
        gas_price: U256,
        selected: SelectedBatch,
    ) -> Result<()> {
        let config = &self.state.config;
        let entry_count = selected.entries.len();

        let leaves: Vec<[u8; 32]> = selected
            .entries
            .iter()
            .map(|entry| entry.commitment.merkle_leaf())
            .collect();
        let tree = MerkleTree::build(&leaves).ok_or_else(|| {
            BatcherError::Internal("sealed an empty batch".to_string())
        })?;
        let merkle_root = tree.root();
        let root_hex = hex::encode(merkle_root);

        info!(
            root = %root_hex,
            entries = entry_count,
            fee_per_proof = %selected.fee_per_proof,
            "sealing batch"
        );
        self.state.metrics.sealed_batches.inc();
        self.telemetry.batch_sealed(&root_hex, entry_count).await;

        // The payload operators fetch: the verification data in leaf
        // order, nothing else.
        let payload: Vec<&VerificationData> = selected
            .entries
            .iter()
            .map(|entry| &entry.submission.verification_data)
            .collect();
        let payload_bytes = cbor_serialize(&payload)?;

        let upload_started = Instant::now();
        let data_pointer = self
            .store
            .put(&batch_key(&merkle_root), payload_bytes)
            .await?;
        self.state
            .metrics
            .upload_duration_ms
            .set(upload_started.elapsed().as_millis() as i64);
        self.telemetry.batch_uploaded(&root_hex, &data_pointer).await;
        info!(root = %root_hex, data_pointer, "batch payload uploaded");

        let fee_for_aggregator = U256::from(config.aggregator_gas_cost)
            * gas_price
            * U256::from(config.aggregator_fee_percentage_multiplier)
            / U256::from(PERCENTAGE_DIVIDER);
        let respond_to_task_fee_limit = fee_for_aggregator
            * U256::from(config.respond_to_task_fee_limit_percentage)
            / U256::from(PERCENTAGE_DIVIDER);

        let mut batch = Batch {
            merkle_root,
            data_pointer,
            fee_per_proof: selected.fee_per_proof,
            aggregator_fee: fee_for_aggregator,
            respond_to_task_fee_limit,
            gas_price,
            entry_count,
            created_block: selected
                .entries
                .iter()
                .map(|e| e.queued_block)
                .min()
                .unwrap_or(block),
            sealed_block: block,
            submit_attempts: 0,
            state: BatchState::Sealing,
        };

        // The selection floor already prices the aggregator in; a batch
        // that slipped under it anyway must not reach the chain.
        if !batch.covers_aggregator_fee() {
            warn!(
                root = %root_hex,
                gross = %batch.gross_fee(),
                aggregator_fee = %batch.aggregator_fee,
                "sealed batch does not cover the aggregator fee, deferring"
            );
            return Ok(());
        }

        let params = TaskParams {
            merkle_root: batch.merkle_root,
            data_pointer: batch.data_pointer.clone(),
            submitters: selected.entries.iter().map(|e| e.payer).collect(),
            fee_for_aggregator: batch.aggregator_fee,
            fee_per_proof: batch.fee_per_proof,
            respond_to_task_fee_limit: batch.respond_to_task_fee_limit,
            gas_price: batch.gas_price,
        };

        let submit_started = Instant::now();
        batch.state = BatchState::Submitted;
        batch.submit_attempts += 1;
        let outcome = self.engine.submit(&params).await;
        self.state
            .metrics
            .submission_duration_ms
            .set(submit_started.elapsed().as_millis() as i64);

        match outcome {
            Ok(outcome) => {
                batch.state = BatchState::Confirmed;
                if let SubmitOutcome::Confirmed { tx_hash, .. } = &outcome {
                    self.telemetry
                        .task_sent(&root_hex, &format!("{tx_hash}"))
                        .await;
                }
                self.confirm_batch(&batch, &selected, &tree, &root_hex).await;
                Ok(())
            }
            Err(e) => {
                batch.state = BatchState::Failed;
                self.state.metrics.failed_batches.inc();
                self.telemetry.batch_failed(&root_hex, &e.to_string()).await;
                self.handle_submission_failure(&selected, e).await
            }
        }
    }

    async fn confirm_batch(
        &self,
        batch: &Batch,
        selected: &SelectedBatch,
        tree: &MerkleTree,
        root_hex: &str,
    ) {
        let keys: Vec<(Address, u64)> = selected
            .entries
            .iter()
            .map(|entry| (entry.payer, entry.nonce()))
            .collect();
        {
            let mut queue = self.state.queue.lock().expect("queue lock poisoned");
            queue.remove_confirmed(&keys);
        }
        self.update_queue_metrics();

        for (index, entry) in selected.entries.iter().enumerate() {
            let Some(merkle_proof) = tree.prove(index) else {
                error!(index, "no proof for sealed leaf; tree accounting bug");
                notify_entry(entry, ServerMessage::rejection(RejectReason::Internal));
                continue;
            };
            notify_entry(
                entry,
                ServerMessage::BatchInclusion {
                    batch_merkle_root: tree.root(),
                    merkle_proof,
                    index_in_batch: index,
                },
            );
        }

        self.state.metrics.confirmed_batches.inc();
        let gas_gauge = u64::try_from(batch.gas_price)
            .map(|v| v.min(i64::MAX as u64) as i64)
            .unwrap_or(i64::MAX);
        self.state.metrics.gas_price_last_batch.set(gas_gauge);
        self.telemetry.batch_confirmed(root_hex).await;
        info!(
            root = %root_hex,
            block = batch.sealed_block,
            entries = batch.entry_count,
            attempts = batch.submit_attempts,
            "batch confirmed, inclusion proofs dispatched"
        );
    }

    async fn handle_submission_failure(
        &self,
        selected: &SelectedBatch,
        error: SubmissionError,
    ) -> Result<()> {
        warn!(error = %error, "batch submission failed");

        match error {
            SubmissionError::InsufficientFunds => {
                // The batcher wallet itself cannot pay. Nothing in the
                // queue can proceed; reset and resync nonces.
                warn!("batcher wallet underfunded, flushing queue");
                let flushed = {
                    let mut queue = self.state.queue.lock().expect("queue lock poisoned");
                    queue.flush()
                };
                for entry in &flushed {
                    notify_entry(entry, ServerMessage::rejection(RejectReason::BatchReset));
                }
                self.state.ledger.clear_cache();
                self.update_queue_metrics();
                Err(BatcherError::BatchSubmission(
                    SubmissionError::InsufficientFunds,
                ))
            }
            error => {
                // Entries are still queued; count the failure and evict
                // the ones past their retry budget.
                let keys: Vec<(Address, u64)> = selected
                    .entries
                    .iter()
                    .map(|entry| (entry.payer, entry.nonce()))
                    .collect();
                let exhausted = {
                    let mut queue = self.state.queue.lock().expect("queue lock poisoned");
                    queue.bump_resubmissions(&keys, self.state.config.max_batch_resubmissions)
                };
                for entry in &exhausted {
                    notify_entry(
                        entry,
                        ServerMessage::rejection(RejectReason::BatchSubmissionFailed),
                    );
                    self.state
                        .metrics
                        .rejection(RejectReason::BatchSubmissionFailed.metric_label());
                }
                self.update_queue_metrics();
                Err(BatcherError::BatchSubmission(error))
            }
        }
    }

    /// Shutdown: the open batch is discarded; everyone still connected
    /// learns their entries died with it.
    fn discard_open_work(&self) {
        let flushed = {
            let mut queue = self.state.queue.lock().expect("queue lock poisoned");
            queue.flush()
        };
        if !flushed.is_empty() {
            warn!(entries = flushed.len(), "discarding open work on shutdown");
        }
        for entry in &flushed {
            notify_entry(entry, ServerMessage::rejection(RejectReason::Internal));
        }
    }

    fn update_queue_metrics(&self) {
        let (len, bytes) = {
            let queue = self.state.queue.lock().expect("queue lock poisoned");
            (queue.len(), queue.size_bytes())
        };
        self.state.metrics.queue_len.set(len as i64);
        self.state.metrics.queue_bytes.set(bytes as i64);
    }
}
