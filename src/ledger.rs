//! Fee ledger client
//!
//! Reads per-user balance, nonce, and withdrawal state from the payment
//! service contract, and the disabled-verifier bitmap from the service
//! manager. All writes happen indirectly through `createNewTask` (see
//! [`crate::submitter`]); the batcher never calls balance-mutating
//! methods.
//!
//! Every read goes through the primary RPC endpoint, falls back to the
//! secondary on failure, and is retried with jittered backoff. Per-user
//! views are cached and invalidated by the contract's balance events;
//! when both endpoints are unavailable past the retry ceiling the client
//! flips into degraded mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEventInterface;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::errors::{BatcherError, Result};
use crate::retry::{self, RetryConfig};

sol! {
    #[sol(rpc)]
    interface IBatcherPaymentService {
        function createNewTask(
            bytes32 batchMerkleRoot,
            string batchDataPointer,
            address[] proofSubmitters,
            uint256 feeForAggregator,
            uint256 feePerProof,
            uint256 respondToTaskFeeLimit
        ) external;

        function user_balances(address account) external view returns (uint256);
        function user_nonces(address account) external view returns (uint256);
        function user_unlock_block(address account) external view returns (uint256);

        event BatcherBalanceUpdated(address indexed batcher, uint256 newBalance);
        event BalanceLocked(address indexed user, uint256 unlockBlock);
        event BalanceUnlocked(address indexed user, uint256 unlockBlock);
        event NewBatchV3(
            bytes32 indexed batchMerkleRoot,
            address senderAddress,
            uint32 taskCreatedBlock,
            string batchDataPointer,
            uint256 respondToTaskFeeLimit
        );
        event BatchVerified(bytes32 indexed batchMerkleRoot);
    }

    #[sol(rpc)]
    interface IServiceManager {
        function disabledVerifiers() external view returns (uint256);
        function isVerifierDisabled(uint8 verifierIdx) external view returns (bool);

        event VerifierDisabled(uint8 verifierIdx);
        event VerifierEnabled(uint8 verifierIdx);
    }
}

/// Cached view of one user's payment-contract state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLedgerView {
    pub balance: U256,
    pub nonce: u64,
    /// Non-zero when the user has initiated a withdrawal; new submissions
    /// are rejected while set.
    pub unlock_block: U256,
}

impl UserLedgerView {
    pub fn withdrawal_initiated(&self) -> bool {
        !self.unlock_block.is_zero()
    }
}

type UserSlot = Arc<Mutex<Option<UserLedgerView>>>;

/// The ledger client. Cheap to share behind an `Arc`.
pub struct FeeLedger {
    eth_rpc_url: String,
    eth_rpc_url_fallback: String,
    payment_service: Address,
    service_manager: Address,
    primary_breaker: CircuitBreaker,
    fallback_breaker: CircuitBreaker,
    degraded: AtomicBool,
    cache: std::sync::Mutex<HashMap<Address, UserSlot>>,
}

fn is_transient(error: &BatcherError) -> bool {
    // Contract-level reverts are deterministic; transport failures are not.
    !matches!(error, BatcherError::ContractCall(_))
}

impl FeeLedger {
    pub fn new(config: &Config) -> Self {
        Self {
            eth_rpc_url: config.eth_rpc_url.clone(),
            eth_rpc_url_fallback: config.eth_rpc_url_fallback.clone(),
            payment_service: config.payment_service_address,
            service_manager: config.service_manager_address,
            primary_breaker: CircuitBreaker::new("eth_rpc_primary"),
            fallback_breaker: CircuitBreaker::new("eth_rpc_fallback"),
            degraded: AtomicBool::new(false),
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// True while both endpoints are failing past the retry ceiling.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn provider(url: &str) -> Result<impl Provider> {
        let url = url
            .parse()
            .map_err(|e| BatcherError::Configuration(format!("bad rpc url {url:?}: {e}")))?;
        Ok(ProviderBuilder::new().on_http(url))
    }

    /// One read, primary then fallback, under the endpoint breakers and
    /// the Ethereum retry schedule.
    async fn read_view<T, Fp, Ff, FutP, FutF>(
        &self,
        name: &'static str,
        primary: Fp,
        fallback: Ff,
    ) -> Result<T>
    where
        Fp: Fn() -> FutP,
        Ff: Fn() -> FutF,
        FutP: std::future::Future<Output = Result<T>>,
        FutF: std::future::Future<Output = Result<T>>,
    {
        let result = retry::retry_with_predicate(
            &RetryConfig::ethereum_call(),
            name,
            || async {
                if self.primary_breaker.is_allowed() {
                    match primary().await {
                        Ok(value) => {
                            self.primary_breaker.record_success();
                            return Ok(value);
                        }
                        Err(e) => {
                            self.primary_breaker.record_failure();
                            warn!(call = name, error = %e, "primary rpc failed, using fallback");
                        }
                    }
                }
                if self.fallback_breaker.is_allowed() {
                    match fallback().await {
                        Ok(value) => {
                            self.fallback_breaker.record_success();
                            return Ok(value);
                        }
                        Err(e) => {
                            self.fallback_breaker.record_failure();
                            warn!(call = name, error = %e, "fallback rpc failed");
                            return Err(e);
                        }
                    }
                }
                Err(BatcherError::RpcUnavailable(name.to_string()))
            },
            is_transient,
        )
        .await;

        match &result {
            Ok(_) => self.degraded.store(false, Ordering::SeqCst),
            Err(BatcherError::RpcUnavailable(_)) => {
                self.degraded.store(true, Ordering::SeqCst);
            }
            Err(_) => {}
        }
        result
    }

    async fn balance_on(&self, url: &str, account: Address) -> Result<U256> {
        let provider = Self::provider(url)?;
        let contract = IBatcherPaymentService::new(self.payment_service, &provider);
        let result = contract
            .user_balances(account)
            .call()
            .await
            .map_err(|e| BatcherError::ContractCall(e.to_string()))?;
        Ok(result._0)
    }

    async fn nonce_on(&self, url: &str, account: Address) -> Result<U256> {
        let provider = Self::provider(url)?;
        let contract = IBatcherPaymentService::new(self.payment_service, &provider);
        let result = contract
            .user_nonces(account)
            .call()
            .await
            .map_err(|e| BatcherError::ContractCall(e.to_string()))?;
        Ok(result._0)
    }

    async fn unlock_block_on(&self, url: &str, account: Address) -> Result<U256> {
        let provider = Self::provider(url)?;
        let contract = IBatcherPaymentService::new(self.payment_service, &provider);
        let result = contract
            .user_unlock_block(account)
            .call()
            .await
            .map_err(|e| BatcherError::ContractCall(e.to_string()))?;
        Ok(result._0)
    }

    pub async fn balance_of(&self, account: Address) -> Result<U256> {
        self.read_view(
            "user_balances",
            || self.balance_on(&self.eth_rpc_url, account),
            || self.balance_on(&self.eth_rpc_url_fallback, account),
        )
        .await
    }

    pub async fn nonce_of(&self, account: Address) -> Result<u64> {
        let nonce = self
            .read_view(
                "user_nonces",
                || self.nonce_on(&self.eth_rpc_url, account),
                || self.nonce_on(&self.eth_rpc_url_fallback, account),
            )
            .await?;
        u64::try_from(nonce)
            .map_err(|_| BatcherError::ContractCall(format!("nonce out of range: {nonce}")))
    }

    async fn unlock_block_of(&self, account: Address) -> Result<U256> {
        self.read_view(
            "user_unlock_block",
            || self.unlock_block_on(&self.eth_rpc_url, account),
            || self.unlock_block_on(&self.eth_rpc_url_fallback, account),
        )
        .await
    }

    /// Read-through cached view of one user. Concurrent lookups of the
    /// same user serialize on a per-user latch, so the chain is hit once.
    pub async fn get(&self, account: Address) -> Result<UserLedgerView> {
        let slot = self.slot(account);
        let mut guard = slot.lock().await;
        if let Some(view) = guard.as_ref() {
            return Ok(view.clone());
        }

        let (balance, nonce, unlock_block) = tokio::try_join!(
            self.balance_of(account),
            self.nonce_of(account),
            self.unlock_block_of(account),
        )?;
        let view = UserLedgerView {
            balance,
            nonce,
            unlock_block,
        };
        *guard = Some(view.clone());
        Ok(view)
    }

    /// Drop one user's cached view; the next `get` re-reads the chain.
    pub async fn invalidate(&self, account: Address) {
        let slot = self.slot(account);
        *slot.lock().await = None;
    }

    /// Drop every cached view.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("ledger cache poisoned").clear();
    }

    fn slot(&self, account: Address) -> UserSlot {
        self.cache
            .lock()
            .expect("ledger cache poisoned")
            .entry(account)
            .or_default()
            .clone()
    }

    /// Node's suggested gas price.
    pub async fn gas_price(&self) -> Result<U256> {
        let price = self
            .read_view(
                "gas_price",
                || async {
                    Self::provider(&self.eth_rpc_url)?
                        .get_gas_price()
                        .await
                        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))
                },
                || async {
                    Self::provider(&self.eth_rpc_url_fallback)?
                        .get_gas_price()
                        .await
                        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))
                },
            )
            .await?;
        Ok(U256::from(price))
    }

    async fn disabled_verifiers_on(&self, url: &str) -> Result<U256> {
        let provider = Self::provider(url)?;
        let contract = IServiceManager::new(self.service_manager, &provider);
        let result = contract
            .disabledVerifiers()
            .call()
            .await
            .map_err(|e| BatcherError::ContractCall(e.to_string()))?;
        Ok(result._0)
    }

    /// Current disabled-verifier bitmap from the service manager.
    pub async fn disabled_verifiers(&self) -> Result<U256> {
        self.read_view(
            "disabled_verifiers",
            || self.disabled_verifiers_on(&self.eth_rpc_url),
            || self.disabled_verifiers_on(&self.eth_rpc_url_fallback),
        )
        .await
    }
}

/// Forward new block numbers from the WebSocket endpoints, deduplicated
/// and monotonically increasing. Reconnects forever with backoff; returns
/// only when the receiving side is gone.
pub async fn listen_new_blocks(
    eth_ws_url: String,
    eth_ws_url_fallback: String,
    blocks_tx: mpsc::Sender<u64>,
) {
    let schedule = RetryConfig::subscription();
    let mut attempt: u32 = 0;
    let mut last_seen: u64 = 0;

    loop {
        match subscribe_blocks_once(
            &eth_ws_url,
            &eth_ws_url_fallback,
            &blocks_tx,
            &mut last_seen,
        )
        .await
        {
            Ok(()) => return, // receiver dropped
            Err(e) => {
                let delay = schedule.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "block subscription lost");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn subscribe_blocks_once(
    ws_url: &str,
    ws_url_fallback: &str,
    blocks_tx: &mpsc::Sender<u64>,
    last_seen: &mut u64,
) -> Result<()> {
    let primary = ProviderBuilder::new()
        .on_ws(WsConnect::new(ws_url))
        .await
        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?;
    let fallback = ProviderBuilder::new()
        .on_ws(WsConnect::new(ws_url_fallback))
        .await
        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?;

    let mut primary_stream = primary
        .subscribe_blocks()
        .await
        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?
        .into_stream();
    let mut fallback_stream = fallback
        .subscribe_blocks()
        .await
        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?
        .into_stream();

    info!("subscribed to new blocks");

    loop {
        let header = tokio::select! {
            header = primary_stream.next() => header,
            header = fallback_stream.next() => header,
        };
        let Some(header) = header else {
            return Err(BatcherError::RpcUnavailable(
                "block stream ended".to_string(),
            ));
        };

        let number = header.number;
        // Both endpoints deliver every block; drop the echo.
        if number <= *last_seen {
            continue;
        }
        *last_seen = number;

        debug!(block = number, "new block");
        if blocks_tx.send(number).await.is_err() {
            return Ok(());
        }
    }
}

/// Watch the payment-service and service-manager events: balance changes
/// invalidate the affected user's cached view, verifier toggles trigger a
/// bitmap refresh pushed to `bitmap_tx`. Reconnects forever with backoff.
pub async fn listen_ledger_events(
    eth_ws_url: String,
    eth_ws_url_fallback: String,
    payment_service: Address,
    service_manager: Address,
    ledger: Arc<FeeLedger>,
    bitmap_tx: mpsc::Sender<U256>,
) {
    let schedule = RetryConfig::subscription();
    let mut attempt: u32 = 0;

    loop {
        let result = subscribe_events_once(
            &eth_ws_url,
            &eth_ws_url_fallback,
            payment_service,
            service_manager,
            &ledger,
            &bitmap_tx,
        )
        .await;
        match result {
            Ok(()) => return,
            Err(e) => {
                let delay = schedule.delay_for_attempt(attempt);
                attempt = attempt.saturating_add(1);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "event subscription lost");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn subscribe_events_once(
    ws_url: &str,
    ws_url_fallback: &str,
    payment_service: Address,
    service_manager: Address,
    ledger: &Arc<FeeLedger>,
    bitmap_tx: &mpsc::Sender<U256>,
) -> Result<()> {
    let filter = Filter::new().address(vec![payment_service, service_manager]);

    let provider = match ProviderBuilder::new().on_ws(WsConnect::new(ws_url)).await {
        Ok(provider) => provider,
        Err(e) => {
            warn!(error = %e, "primary ws endpoint unavailable for events");
            ProviderBuilder::new()
                .on_ws(WsConnect::new(ws_url_fallback))
                .await
                .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?
        }
    };

    let mut stream = provider
        .subscribe_logs(&filter)
        .await
        .map_err(|e| BatcherError::RpcUnavailable(e.to_string()))?
        .into_stream();

    info!("subscribed to ledger events");

    while let Some(log) = stream.next().await {
        use IBatcherPaymentService::IBatcherPaymentServiceEvents as PaymentEvents;
        use IServiceManager::IServiceManagerEvents as ManagerEvents;

        if let Ok(event) = PaymentEvents::decode_log(&log.inner, true) {
            match event.data {
                PaymentEvents::BatcherBalanceUpdated(e) => {
                    debug!(batcher = %e.batcher, "batcher balance updated");
                    ledger.invalidate(e.batcher).await;
                }
                PaymentEvents::BalanceLocked(e) => {
                    info!(user = %e.user, "balance locked for withdrawal");
                    ledger.invalidate(e.user).await;
                }
                PaymentEvents::BalanceUnlocked(e) => {
                    info!(user = %e.user, "balance unlocked");
                    ledger.invalidate(e.user).await;
                }
                PaymentEvents::NewBatchV3(e) => {
                    debug!(root = %e.batchMerkleRoot, "batch task observed on-chain");
                }
                PaymentEvents::BatchVerified(e) => {
                    debug!(root = %e.batchMerkleRoot, "batch verified on-chain");
                }
            }
            continue;
        }

        if let Ok(event) = ManagerEvents::decode_log(&log.inner, true) {
            let toggled = match event.data {
                ManagerEvents::VerifierDisabled(e) => e.verifierIdx,
                ManagerEvents::VerifierEnabled(e) => e.verifierIdx,
            };
            info!(verifier = toggled, "verifier toggled, refreshing bitmap");
            match ledger.disabled_verifiers().await {
                Ok(bitmap) => {
                    if bitmap_tx.send(bitmap).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "failed to refresh disabled-verifier bitmap"),
            }
        }
    }

    Err(BatcherError::RpcUnavailable(
        "event stream ended".to_string(),
    ))
}

/// Sleep-based poller used when no WebSocket endpoint is reachable at
/// boot; re-reads the bitmap on a fixed cadence as a safety net.
pub async fn poll_disabled_verifiers(
    ledger: Arc<FeeLedger>,
    bitmap_tx: mpsc::Sender<U256>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match ledger.disabled_verifiers().await {
            Ok(bitmap) => {
                if bitmap_tx.send(bitmap).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "disabled-verifier poll failed"),
        }
    }
}
