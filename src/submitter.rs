//! On-chain submission engine
//!
//! Sends `createNewTask` for a sealed batch and shepherds it to
//! inclusion. The task is simulated first (an `eth_call` costs nothing
//! and classifies deterministic reverts), then sent with a pinned account
//! nonce; if no receipt arrives within the bump window the same
//! transaction is re-sent at a higher gas price. The nonce never changes
//! across bumps, so at most one of the attempts can land.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use tracing::{info, warn};

use crate::config::{Config, PERCENTAGE_DIVIDER};
use crate::crypto::Hash256;
use crate::errors::SubmissionError;
use crate::ledger::IBatcherPaymentService;

/// Everything `createNewTask` needs.
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub merkle_root: Hash256,
    pub data_pointer: String,
    /// Paying submitters, one per entry, in leaf order.
    pub submitters: Vec<Address>,
    pub fee_for_aggregator: U256,
    pub fee_per_proof: U256,
    pub respond_to_task_fee_limit: U256,
    /// Gas price of the first attempt; bumps start from here.
    pub gas_price: U256,
}

/// How the batch reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Our transaction was included and succeeded.
    Confirmed { tx_hash: B256, block: Option<u64> },
    /// A task with this root already exists on-chain; nothing was sent.
    AlreadySubmitted,
}

/// Bump percentage for bump attempt `attempt` (0-indexed):
/// `min(base + attempt * incremental, limit)`.
pub fn bump_percent(
    attempt: u32,
    base_percent: u128,
    incremental_percent: u128,
    limit_percent: u128,
) -> u128 {
    (base_percent + attempt as u128 * incremental_percent).min(limit_percent)
}

/// Gas price for bump attempt `attempt`: the original price raised by
/// [`bump_percent`].
pub fn bumped_gas_price(
    original: U256,
    attempt: u32,
    base_percent: u128,
    incremental_percent: u128,
    limit_percent: u128,
) -> U256 {
    let bump = bump_percent(attempt, base_percent, incremental_percent, limit_percent);
    original * U256::from(PERCENTAGE_DIVIDER + bump) / U256::from(PERCENTAGE_DIVIDER)
}

/// Number of bump attempts before the schedule is exhausted: one per
/// increment up to the ceiling, plus the attempt at the ceiling itself.
pub fn max_bump_attempts(
    base_percent: u128,
    incremental_percent: u128,
    limit_percent: u128,
) -> u32 {
    if incremental_percent == 0 || limit_percent <= base_percent {
        return 1;
    }
    (limit_percent - base_percent).div_ceil(incremental_percent) as u32 + 1
}

/// Classify a revert message into the submission error taxonomy.
fn classify_revert(message: &str) -> SubmissionError {
    if message.contains("BatchAlreadySubmitted") {
        SubmissionError::BatchAlreadySubmitted
    } else if message.contains("InsufficientFunds") {
        SubmissionError::InsufficientFunds
    } else if message.contains("InvalidQuorumThreshold") {
        SubmissionError::InvalidQuorumThreshold
    } else {
        SubmissionError::SimulationReverted(message.to_string())
    }
}

pub struct SubmissionEngine {
    eth_rpc_url: String,
    eth_rpc_url_fallback: String,
    payment_service: Address,
    signer: PrivateKeySigner,
    transaction_wait_timeout: std::time::Duration,
    time_to_wait_before_bump: std::time::Duration,
    gas_base_bump_percentage: u128,
    gas_bump_incremental_percentage: u128,
    gas_bump_percentage_limit: u128,
}

impl SubmissionEngine {
    pub fn new(config: &Config, signer: PrivateKeySigner) -> Self {
        Self {
            eth_rpc_url: config.eth_rpc_url.clone(),
            eth_rpc_url_fallback: config.eth_rpc_url_fallback.clone(),
            payment_service: config.payment_service_address,
            signer,
            transaction_wait_timeout: config.transaction_wait_timeout,
            time_to_wait_before_bump: config.time_to_wait_before_bump,
            gas_base_bump_percentage: config.gas_base_bump_percentage,
            gas_bump_incremental_percentage: config.gas_bump_incremental_percentage,
            gas_bump_percentage_limit: config.gas_bump_percentage_limit,
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.signer.address()
    }

    /// Simulate then send the task, bumping gas until inclusion or the
    /// bump ceiling. `Ok(AlreadySubmitted)` short-circuits without
    /// spending gas.
    pub async fn submit(&self, params: &TaskParams) -> Result<SubmitOutcome, SubmissionError> {
        match self.simulate(&self.eth_rpc_url, params).await {
            Ok(()) => {}
            Err(SubmissionError::BatchAlreadySubmitted) => {
                info!(
                    root = hex::encode(params.merkle_root),
                    "task already on-chain, skipping send"
                );
                return Ok(SubmitOutcome::AlreadySubmitted);
            }
            Err(SubmissionError::SendFailed(e)) => {
                // Transport trouble on the primary: try the fallback once
                // before giving up on the simulation gate.
                warn!(error = %e, "simulation failed on primary rpc, retrying on fallback");
                match self.simulate(&self.eth_rpc_url_fallback, params).await {
                    Ok(()) => {}
                    Err(SubmissionError::BatchAlreadySubmitted) => {
                        return Ok(SubmitOutcome::AlreadySubmitted);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }

        let account_nonce = self
            .account_nonce()
            .await
            .map_err(SubmissionError::SendFailed)?;

        // The initial send at the suggested price, then the bump ladder.
        let max_attempts = 1 + max_bump_attempts(
            self.gas_base_bump_percentage,
            self.gas_bump_incremental_percentage,
            self.gas_bump_percentage_limit,
        );

        for attempt in 0..max_attempts {
            let gas_price = if attempt == 0 {
                params.gas_price
            } else {
                bumped_gas_price(
                    params.gas_price,
                    attempt - 1,
                    self.gas_base_bump_percentage,
                    self.gas_bump_incremental_percentage,
                    self.gas_bump_percentage_limit,
                )
            };
            info!(
                root = hex::encode(params.merkle_root),
                attempt,
                %gas_price,
                nonce = account_nonce,
                "sending createNewTask"
            );

            match self
                .send_once(&self.eth_rpc_url, params, account_nonce, gas_price)
                .await
            {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {
                    // Not included within the bump window; raise the price
                    // and replace.
                    warn!(
                        root = hex::encode(params.merkle_root),
                        attempt, "no inclusion before bump window elapsed"
                    );
                }
                Err(SubmissionError::SendFailed(e)) => {
                    warn!(error = %e, attempt, "send failed on primary rpc, trying fallback");
                    match self
                        .send_once(&self.eth_rpc_url_fallback, params, account_nonce, gas_price)
                        .await
                    {
                        Ok(Some(outcome)) => return Ok(outcome),
                        Ok(None) => {}
                        Err(SubmissionError::BatchAlreadySubmitted) => {
                            return Ok(SubmitOutcome::AlreadySubmitted)
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(SubmissionError::BatchAlreadySubmitted) => {
                    return Ok(SubmitOutcome::AlreadySubmitted)
                }
                Err(e) => return Err(e),
            }
        }

        Err(SubmissionError::InclusionTimeout {
            attempts: max_attempts,
        })
    }

    async fn simulate(&self, url: &str, params: &TaskParams) -> Result<(), SubmissionError> {
        let provider = self.signing_provider(url)?;
        let contract = IBatcherPaymentService::new(self.payment_service, &provider);

        contract
            .createNewTask(
                params.merkle_root.into(),
                params.data_pointer.clone(),
                params.submitters.clone(),
                params.fee_for_aggregator,
                params.fee_per_proof,
                params.respond_to_task_fee_limit,
            )
            .call()
            .await
            .map(|_| ())
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("revert") || message.contains("execution reverted") {
                    classify_revert(&message)
                } else {
                    SubmissionError::SendFailed(message)
                }
            })
    }

    /// One send attempt. `Ok(None)` means the receipt did not arrive in
    /// time and the caller should bump.
    async fn send_once(
        &self,
        url: &str,
        params: &TaskParams,
        account_nonce: u64,
        gas_price: U256,
    ) -> Result<Option<SubmitOutcome>, SubmissionError> {
        let provider = self.signing_provider(url)?;
        let contract = IBatcherPaymentService::new(self.payment_service, &provider);

        let call = contract
            .createNewTask(
                params.merkle_root.into(),
                params.data_pointer.clone(),
                params.submitters.clone(),
                params.fee_for_aggregator,
                params.fee_per_proof,
                params.respond_to_task_fee_limit,
            )
            .nonce(account_nonce)
            .gas_price(gas_price.to::<u128>());

        let pending = match call.send().await {
            Ok(pending) => pending,
            Err(e) => {
                let message = e.to_string();
                // A replacement racing its predecessor is not a failure.
                if message.contains("already known")
                    || message.contains("replacement transaction underpriced")
                    || message.contains("nonce too low")
                {
                    warn!(error = %message, "send raced a previous attempt, waiting for inclusion");
                    return Ok(None);
                }
                if message.contains("revert") {
                    return Err(classify_revert(&message));
                }
                return Err(SubmissionError::SendFailed(message));
            }
        };

        let tx_hash = *pending.tx_hash();
        let wait = self
            .time_to_wait_before_bump
            .min(self.transaction_wait_timeout);

        match tokio::time::timeout(wait, pending.get_receipt()).await {
            Ok(Ok(receipt)) => {
                if receipt.status() {
                    Ok(Some(SubmitOutcome::Confirmed {
                        tx_hash: receipt.transaction_hash,
                        block: receipt.block_number,
                    }))
                } else {
                    Err(SubmissionError::SendFailed(format!(
                        "transaction {tx_hash} reverted on-chain"
                    )))
                }
            }
            Ok(Err(e)) => Err(SubmissionError::SendFailed(e.to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn account_nonce(&self) -> Result<u64, String> {
        let provider = self
            .signing_provider(&self.eth_rpc_url)
            .map_err(|e| e.to_string())?;
        provider
            .get_transaction_count(self.signer.address())
            .await
            .map_err(|e| e.to_string())
    }

    fn signing_provider(&self, url: &str) -> Result<impl Provider, SubmissionError> {
        let url = url
            .parse()
            .map_err(|e| SubmissionError::SendFailed(format!("bad rpc url {url:?}: {e}")))?;
        Ok(ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(EthereumWallet::from(self.signer.clone()))
            .on_http(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_schedule_grows_linearly_to_the_cap() {
        let price = U256::from(1_000u64);
        // bump attempt 0: +5%, attempt 1: +10%, ...
        assert_eq!(bump_percent(0, 5, 5, 90), 5);
        assert_eq!(bumped_gas_price(price, 0, 5, 5, 90), U256::from(1_050u64));
        assert_eq!(bumped_gas_price(price, 1, 5, 5, 90), U256::from(1_100u64));
        assert_eq!(bumped_gas_price(price, 2, 5, 5, 90), U256::from(1_150u64));
        // Far past the cap: +90% and no more.
        assert_eq!(
            bumped_gas_price(price, 100, 5, 5, 90),
            U256::from(1_900u64)
        );
    }

    #[test]
    fn attempt_count_matches_the_bump_ceiling() {
        // ceil((90 - 5) / 5) + 1 = 18 bump attempts.
        assert_eq!(max_bump_attempts(5, 5, 90), 18);
        // Non-divisible: ceil((90 - 4) / 10) + 1 = 10.
        assert_eq!(max_bump_attempts(4, 10, 90), 10);
        // Degenerate schedules bump exactly once.
        assert_eq!(max_bump_attempts(5, 0, 90), 1);
        assert_eq!(max_bump_attempts(90, 5, 90), 1);
    }

    #[test]
    fn revert_classification_matches_contract_errors() {
        assert!(matches!(
            classify_revert("execution reverted: BatchAlreadySubmitted()"),
            SubmissionError::BatchAlreadySubmitted
        ));
        assert!(matches!(
            classify_revert("execution reverted: InsufficientFunds()"),
            SubmissionError::InsufficientFunds
        ));
        assert!(matches!(
            classify_revert("execution reverted: InvalidQuorumThreshold()"),
            SubmissionError::InvalidQuorumThreshold
        ));
        assert!(matches!(
            classify_revert("execution reverted: SomethingElse()"),
            SubmissionError::SimulationReverted(_)
        ));
    }
}
