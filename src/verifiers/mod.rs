//! Pre-verification pool
//!
//! CPU-bound proof verification runs on dedicated worker threads, never on
//! the async executor. Submissions reach the pool through a bounded
//! channel; a full channel is backpressure and surfaces as `RateLimited`.
//!
//! A verifier library fault (panic or equivalent) is isolated to the job:
//! the worker reports the proof as invalid and keeps serving. A worker
//! that dies anyway respawns itself on the way out.

mod groth16;
mod plonk;
mod risc0;
mod sp1;

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::crypto::Hash256;
use crate::domain::{ProvingSystem, VerificationData};
use crate::errors::RejectReason;

/// Verify one submission against its proof system. Pure and side-effect
/// free; missing required components fail verification.
pub fn verify(data: &VerificationData) -> bool {
    match data.proving_system {
        ProvingSystem::Groth16Bn254 => {
            let (Some(vk), Some(public_input)) =
                (data.verification_key.as_deref(), data.public_input.as_deref())
            else {
                return false;
            };
            groth16::verify_groth16_bn254(&data.proof, public_input, vk)
        }
        ProvingSystem::PlonkBn254 => {
            plonk::validate_plonk_bn254(
                &data.proof,
                data.public_input.as_deref(),
                data.verification_key.as_deref(),
            )
        }
        ProvingSystem::PlonkBls12_381 => {
            plonk::validate_plonk_bls12_381(
                &data.proof,
                data.public_input.as_deref(),
                data.verification_key.as_deref(),
            )
        }
        ProvingSystem::Sp1 => {
            let Some(elf) = data.vm_program.as_deref() else {
                return false;
            };
            sp1::verify_sp1(&data.proof, elf)
        }
        ProvingSystem::Risc0 => {
            let Some(image_id) = data.vm_program.as_deref() else {
                return false;
            };
            let journal = data.public_input.as_deref().unwrap_or(&[]);
            risc0::verify_risc0(&data.proof, image_id, journal)
        }
    }
}

struct Job {
    data: Arc<VerificationData>,
    reply: oneshot::Sender<bool>,
}

struct Shared {
    rx: Mutex<std::sync::mpsc::Receiver<Job>>,
    shutting_down: AtomicBool,
}

/// Fixed-size pool of verification worker threads.
pub struct VerifierPool {
    tx: std::sync::mpsc::SyncSender<Job>,
    shared: Arc<Shared>,
}

impl VerifierPool {
    /// Spawn `workers` threads with a job queue of `2 * workers`.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = std::sync::mpsc::sync_channel(workers * 2);
        let shared = Arc::new(Shared {
            rx: Mutex::new(rx),
            shutting_down: AtomicBool::new(false),
        });

        for id in 0..workers {
            spawn_worker(shared.clone(), id);
        }

        Self { tx, shared }
    }

    /// Pool sized to the machine.
    pub fn with_default_size() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(workers)
    }

    /// Verify `data`, waiting at most `timeout`.
    ///
    /// `Err(RateLimited)` means the pool is saturated and the submission
    /// was never dispatched. `Ok(false)` covers invalid proofs, verifier
    /// faults, and timeouts alike.
    pub async fn verify(
        &self,
        data: Arc<VerificationData>,
        timeout: Duration,
    ) -> std::result::Result<bool, RejectReason> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(Job {
                data,
                reply: reply_tx,
            })
            .map_err(|_| RejectReason::RateLimited)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(_)) => {
                // Worker dropped the reply without answering.
                tracing::error!("verifier worker dropped a job");
                Ok(false)
            }
            Err(_) => {
                tracing::warn!("verification timed out");
                Ok(false)
            }
        }
    }
}

impl Drop for VerifierPool {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
    }
}

fn spawn_worker(shared: Arc<Shared>, id: usize) {
    let builder = std::thread::Builder::new().name(format!("verifier-{id}"));
    let spawn_result = builder.spawn(move || {
        let _guard = RespawnGuard {
            shared: shared.clone(),
            id,
        };
        loop {
            // Hold the receiver lock only while waiting; idle peers queue
            // up behind it and take the next job in turn.
            let job = {
                let rx = match shared.rx.lock() {
                    Ok(rx) => rx,
                    Err(_) => return,
                };
                rx.recv()
            };
            let Ok(job) = job else {
                // Channel closed: orderly shutdown.
                shared.shutting_down.store(true, Ordering::SeqCst);
                return;
            };

            let system = job.data.proving_system;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| verify(&job.data)))
                .unwrap_or_else(|_| {
                    tracing::error!(%system, "verifier fault isolated; rejecting proof");
                    false
                });
            let _ = job.reply.send(outcome);
        }
    });
    if let Err(e) = spawn_result {
        tracing::error!(worker = id, error = %e, "failed to spawn verifier worker");
    }
}

/// Respawns the worker if its thread unwinds outside the per-job isolation.
struct RespawnGuard {
    shared: Arc<Shared>,
    id: usize,
}

impl Drop for RespawnGuard {
    fn drop(&mut self) {
        if std::thread::panicking() && !self.shared.shutting_down.load(Ordering::SeqCst) {
            tracing::error!(worker = self.id, "verifier worker died; spawning replacement");
            spawn_worker(self.shared.clone(), self.id);
        }
    }
}

/// Bounded memory of recently pre-verified fingerprints. A resubmission
/// whose fingerprint is present skips the verifier entirely.
pub struct RecentFingerprints {
    capacity: usize,
    set: HashSet<Hash256>,
    order: VecDeque<Hash256>,
}

impl RecentFingerprints {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains(&self, fingerprint: &Hash256) -> bool {
        self.set.contains(fingerprint)
    }

    pub fn insert(&mut self, fingerprint: Hash256) {
        if !self.set.insert(fingerprint) {
            return;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}
