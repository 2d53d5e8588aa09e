//! Server bootstrap
//!
//! Wires together configuration, the Ethereum clients, the verifier
//! pool, the queue, and the background tasks, then runs until a
//! shutdown signal arrives.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::connection;
use crate::errors::BatcherError;
use crate::finalizer::Finalizer;
use crate::ledger::{self, FeeLedger};
use crate::metrics::{self, Metrics};
use crate::nonpaying::NonPayingPolicy;
use crate::queue::PendingQueue;
use crate::shutdown::{ConnectionTracker, ShutdownCoordinator};
use crate::store::S3Store;
use crate::submitter::SubmissionEngine;
use crate::telemetry::TelemetrySender;
use crate::verifiers::{RecentFingerprints, VerifierPool};

/// Shared state of the running batcher.
///
/// The queue and the fingerprint set sit behind plain mutexes: their
/// critical sections are short and synchronous, and nothing awaits while
/// holding them.
pub struct BatcherState {
    pub config: Arc<Config>,
    pub queue: std::sync::Mutex<PendingQueue>,
    pub ledger: Arc<FeeLedger>,
    pub verifier_pool: VerifierPool,
    pub recent_fingerprints: std::sync::Mutex<RecentFingerprints>,
    pub disabled_verifiers: std::sync::Mutex<U256>,
    pub non_paying: Option<NonPayingPolicy>,
    pub metrics: Arc<Metrics>,
    pub current_block: AtomicU64,
}

/// Fingerprints remembered for pre-verification dedup.
const RECENT_FINGERPRINT_CAPACITY: usize = 4096;

/// How long shutdown waits for connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Safety-net cadence for re-reading the disabled-verifier bitmap.
const BITMAP_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Start the batcher and run until SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    info!("starting proof batcher v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);
    info!(listen = %config.listen_addr, "configuration loaded");

    let metrics = Metrics::new();
    {
        let metrics = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port).await {
                warn!(error = %e, "metrics server exited");
            }
        });
    }

    let signer: PrivateKeySigner = config.private_key.parse().map_err(|_| {
        BatcherError::Configuration("BATCHER_PRIVATE_KEY is not a valid private key".into())
    })?;
    info!(wallet = %signer.address(), "batcher wallet loaded");

    let ledger = Arc::new(FeeLedger::new(&config));
    // The bitmap gates every submission; boot must not proceed blind.
    let disabled_verifiers = ledger.disabled_verifiers().await?;
    info!(bitmap = %disabled_verifiers, "initial disabled-verifier bitmap");

    let non_paying = match &config.non_paying {
        Some(non_paying_config) => {
            let policy = NonPayingPolicy::from_config(non_paying_config)?;
            warn!(
                address = %non_paying_config.address,
                replacement = %policy.replacement_address(),
                "non-paying policy active"
            );
            Some(policy)
        }
        None => None,
    };

    if !config.pre_verification_is_enabled {
        warn!("pre-verification is disabled; unverified proofs will be queued");
    }

    let store = Arc::new(
        S3Store::connect(
            config.storage_bucket.clone(),
            config.download_endpoint.clone(),
            config.upload_endpoint.clone(),
        )
        .await,
    );
    let engine = SubmissionEngine::new(&config, signer);
    let telemetry = TelemetrySender::new(config.telemetry_addr.clone());

    let state = Arc::new(BatcherState {
        config: config.clone(),
        queue: std::sync::Mutex::new(PendingQueue::new()),
        ledger: ledger.clone(),
        verifier_pool: VerifierPool::with_default_size(),
        recent_fingerprints: std::sync::Mutex::new(RecentFingerprints::new(
            RECENT_FINGERPRINT_CAPACITY,
        )),
        disabled_verifiers: std::sync::Mutex::new(disabled_verifiers),
        non_paying,
        metrics: metrics.clone(),
        current_block: AtomicU64::new(0),
    });

    let coordinator = ShutdownCoordinator::new();
    let tracker = ConnectionTracker::new();

    let (blocks_tx, blocks_rx) = mpsc::channel(64);
    let (bitmap_tx, bitmap_rx) = mpsc::channel(8);

    tokio::spawn(ledger::listen_new_blocks(
        config.eth_ws_url.clone(),
        config.eth_ws_url_fallback.clone(),
        blocks_tx,
    ));
    tokio::spawn(ledger::listen_ledger_events(
        config.eth_ws_url.clone(),
        config.eth_ws_url_fallback.clone(),
        config.payment_service_address,
        config.service_manager_address,
        ledger.clone(),
        bitmap_tx.clone(),
    ));
    tokio::spawn(ledger::poll_disabled_verifiers(
        ledger.clone(),
        bitmap_tx,
        BITMAP_POLL_INTERVAL,
    ));

    let finalizer = Finalizer::new(state.clone(), store, engine, telemetry);
    let finalizer_handle = tokio::spawn(finalizer.run(blocks_rx, bitmap_rx, coordinator.signal()));

    let server_handle = tokio::spawn(connection::run(
        state.clone(),
        tracker.clone(),
        coordinator.signal(),
    ));

    {
        let metrics = metrics.clone();
        let ledger = ledger.clone();
        let signal = coordinator.signal();
        tokio::spawn(async move {
            while !signal.is_shutdown() {
                metrics.rpc_degraded.set(ledger.is_degraded() as i64);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    info!("batcher ready");
    coordinator.listen_for_signals().await;

    // Accepting has stopped; give open connections a chance to wind
    // down, then let the finalizer discard whatever is still open.
    tracker.wait_for_drain(DRAIN_TIMEOUT).await;
    let _ = server_handle.await;
    let _ = finalizer_handle.await;

    info!("batcher stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}
