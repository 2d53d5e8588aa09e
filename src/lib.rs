//! Proof Batcher
//!
//! Streaming server for a proof-aggregation service: clients submit
//! zero-knowledge proofs over WebSocket, the batcher pre-verifies them,
//! schedules them in a fee-priority queue with replace-by-fee, seals
//! Merkle batches under fee and size policies, uploads the payload to
//! object storage, and anchors the root on Ethereum while debiting
//! per-proof fees from the payment contract.
//!
//! ## Modules
//!
//! - [`domain`] - proving systems, submissions, commitments, batches
//! - [`crypto`] - Keccak commitments, the batch Merkle tree, signatures
//! - [`queue`] - fee-priority queue and batch selection
//! - [`verifiers`] - per-system pre-verification and the worker pool
//! - [`ledger`] - payment-contract client and event subscriptions
//! - [`finalizer`] - batch readiness, sealing, and acknowledgment
//! - [`submitter`] - on-chain task submission with gas bumping
//! - [`connection`] - the client WebSocket server
//! - [`store`] - batch payload storage
//! - [`metrics`] / [`telemetry`] - observability

pub mod breaker;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod domain;
pub mod errors;
pub mod finalizer;
pub mod ledger;
pub mod metrics;
pub mod nonpaying;
pub mod queue;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod submitter;
pub mod telemetry;
pub mod verifiers;
pub mod wire;

pub use config::Config;
pub use domain::{Batch, BatchState, NoncedVerificationData, ProvingSystem, VerificationData};
pub use errors::{BatcherError, RejectReason, Result};
pub use queue::{PendingQueue, QueueEntry};
pub use wire::{ClientMessage, ServerMessage, SubmitRequest};
