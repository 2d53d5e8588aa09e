//! Batcher configuration
//!
//! All options are read from the environment once at boot. Validation
//! failures are fatal: a batcher with a half-configured fee policy or a
//! missing wallet must not accept connections.

use std::net::SocketAddr;
use std::time::Duration;

use alloy::primitives::Address;

use crate::errors::{BatcherError, Result};

/// Expected wire protocol version, sent to every client on connect.
pub const PROTOCOL_VERSION: u16 = 1;

/// Seconds a new connection may take to complete the handshake and send
/// its first frame before being dropped.
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Base gas consumed by `createNewTask` regardless of batch size.
pub const SUBMISSION_BASE_GAS_COST: u128 = 125_000;

/// Additional gas consumed per proof in the batch.
pub const SUBMISSION_GAS_COST_PER_PROOF: u128 = 2_000;

/// Divider for all percentage-multiplier config values (100 = x1).
pub const PERCENTAGE_DIVIDER: u128 = 100;

/// Fee charged per proof to non-paying submitters' replacement wallet:
/// per-proof gas at a 100 gwei gas-price upper bound.
pub const DEFAULT_MAX_FEE_PER_PROOF: u128 = SUBMISSION_GAS_COST_PER_PROOF * 100_000_000_000;

/// Worst-case CBOR framing overhead when wrapping entries into an array.
///
/// Per RFC 8949 §3.1 an array head is at most 9 bytes. Budgeting for the
/// maximum keeps a full batch under the operator-side size cap.
pub const CBOR_ARRAY_MAX_OVERHEAD: usize = 9;

/// Non-paying submitter substitution: proofs arriving from `address` are
/// paid for by the wallet behind `replacement_private_key`.
#[derive(Debug, Clone)]
pub struct NonPayingConfig {
    pub address: Address,
    pub replacement_private_key: String,
}

/// Complete batcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket listen address for client connections.
    pub listen_addr: SocketAddr,
    /// Port for the metrics / health HTTP server.
    pub metrics_port: u16,
    /// Optional telemetry collector endpoint (`host:port`).
    pub telemetry_addr: Option<String>,

    /// Primary and fallback HTTP RPC endpoints.
    pub eth_rpc_url: String,
    pub eth_rpc_url_fallback: String,
    /// Primary and fallback WebSocket RPC endpoints.
    pub eth_ws_url: String,
    pub eth_ws_url_fallback: String,

    /// Payment service contract (task creation, balances, nonces).
    pub payment_service_address: Address,
    /// Service manager contract (disabled-verifier bitmap).
    pub service_manager_address: Address,
    /// Hex-encoded private key of the batcher wallet.
    pub private_key: String,

    /// Object storage bucket for batch payloads.
    pub storage_bucket: String,
    /// Public base URL under which uploaded payloads are readable.
    pub download_endpoint: String,
    /// Optional storage endpoint override for local development.
    pub upload_endpoint: Option<String>,

    /// Minimum blocks between sealed batches.
    pub block_interval: u64,
    /// Queue byte size that triggers finalization before the block interval.
    pub batch_size_interval: usize,
    /// Maximum proofs per sealed batch.
    pub max_batch_proof_qty: usize,
    /// Maximum serialized batch payload size in bytes.
    pub max_batch_byte_size: usize,
    /// Maximum serialized size of a single submission in bytes.
    pub max_proof_size: usize,

    /// Seconds to wait for a transaction receipt on each attempt.
    pub transaction_wait_timeout: Duration,
    /// Seconds to wait for inclusion before re-sending at a bumped price.
    pub time_to_wait_before_bump: Duration,
    /// Gas bump percentages: attempt `i` bumps by
    /// `min(base + i * incremental, limit)` percent.
    pub gas_base_bump_percentage: u128,
    pub gas_bump_incremental_percentage: u128,
    pub gas_bump_percentage_limit: u128,
    /// Suggested gas price is scaled by this percentage for fee math.
    pub gas_price_percentage_multiplier: u128,

    /// Aggregator fee = aggregator_gas_cost * gas_price * multiplier / 100.
    pub aggregator_fee_percentage_multiplier: u128,
    pub aggregator_gas_cost: u128,
    /// respondToTaskFeeLimit = aggregator fee * this percentage / 100.
    pub respond_to_task_fee_limit_percentage: u128,

    /// Whether proofs are verified before queuing. Required in production;
    /// the switch exists for load testing only.
    pub pre_verification_is_enabled: bool,
    /// Per-submission verification timeout.
    pub verification_timeout: Duration,

    /// Maximum unanswered submissions per connection.
    pub max_inflight_per_connection: usize,
    /// How many times a failed batch's entries re-enter the queue before
    /// being surfaced as `BatchSubmissionFailed`.
    pub max_batch_resubmissions: u32,

    pub non_paying: Option<NonPayingConfig>,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| BatcherError::Configuration(format!("{name} is not set")))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BatcherError::Configuration(format!("{name} is not valid: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn parse_address(name: &str) -> Result<Address> {
    let raw = required(name)?;
    raw.parse()
        .map_err(|_| BatcherError::Configuration(format!("{name} is not a valid address: {raw:?}")))
}

fn parse_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load and validate the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = parse_var(
            "BATCHER_LISTEN_ADDR",
            "0.0.0.0:8080".parse().expect("static addr"),
        )?;

        let non_paying = match (
            std::env::var("NON_PAYING_ADDRESS").ok(),
            std::env::var("NON_PAYING_REPLACEMENT_PRIVATE_KEY").ok(),
        ) {
            (Some(addr), Some(key)) => {
                let address = addr.parse().map_err(|_| {
                    BatcherError::Configuration(format!(
                        "NON_PAYING_ADDRESS is not a valid address: {addr:?}"
                    ))
                })?;
                Some(NonPayingConfig {
                    address,
                    replacement_private_key: key,
                })
            }
            (None, None) => None,
            _ => {
                return Err(BatcherError::Configuration(
                    "NON_PAYING_ADDRESS and NON_PAYING_REPLACEMENT_PRIVATE_KEY \
                     must be set together"
                        .into(),
                ))
            }
        };

        let config = Self {
            listen_addr,
            metrics_port: parse_var("METRICS_PORT", 9093)?,
            telemetry_addr: std::env::var("TELEMETRY_IP_PORT_ADDRESS").ok(),

            eth_rpc_url: required("ETH_RPC_URL")?,
            eth_rpc_url_fallback: required("ETH_RPC_URL_FALLBACK")?,
            eth_ws_url: required("ETH_WS_URL")?,
            eth_ws_url_fallback: required("ETH_WS_URL_FALLBACK")?,

            payment_service_address: parse_address("PAYMENT_SERVICE_ADDRESS")?,
            service_manager_address: parse_address("SERVICE_MANAGER_ADDRESS")?,
            private_key: required("BATCHER_PRIVATE_KEY")?,

            storage_bucket: required("STORAGE_BUCKET")?,
            download_endpoint: required("DOWNLOAD_ENDPOINT")?,
            upload_endpoint: std::env::var("UPLOAD_ENDPOINT").ok(),

            block_interval: parse_var("BLOCK_INTERVAL", 10)?,
            batch_size_interval: parse_var("BATCH_SIZE_INTERVAL", 8 * 1024 * 1024)?,
            max_batch_proof_qty: parse_var("MAX_BATCH_PROOF_QTY", 1024)?,
            max_batch_byte_size: parse_var("MAX_BATCH_BYTE_SIZE", 256 * 1024 * 1024)?,
            max_proof_size: parse_var("MAX_PROOF_SIZE", 64 * 1024 * 1024)?,

            transaction_wait_timeout: Duration::from_secs(parse_var(
                "TRANSACTION_WAIT_TIMEOUT",
                96,
            )?),
            time_to_wait_before_bump: Duration::from_secs(parse_var(
                "TIME_TO_WAIT_BEFORE_BUMP",
                36,
            )?),
            gas_base_bump_percentage: parse_var("GAS_BASE_BUMP_PERCENTAGE", 5)?,
            gas_bump_incremental_percentage: parse_var("GAS_BUMP_INCREMENTAL_PERCENTAGE", 5)?,
            gas_bump_percentage_limit: parse_var("GAS_BUMP_PERCENTAGE_LIMIT", 90)?,
            gas_price_percentage_multiplier: parse_var("GAS_PRICE_PERCENTAGE_MULTIPLIER", 110)?,

            aggregator_fee_percentage_multiplier: parse_var(
                "AGGREGATOR_FEE_PERCENTAGE_MULTIPLIER",
                125,
            )?,
            aggregator_gas_cost: parse_var("AGGREGATOR_GAS_COST", 330_000)?,
            respond_to_task_fee_limit_percentage: parse_var(
                "RESPOND_TO_TASK_FEE_LIMIT_PERCENTAGE",
                250,
            )?,

            pre_verification_is_enabled: parse_bool("PRE_VERIFICATION_IS_ENABLED", true),
            verification_timeout: Duration::from_secs(parse_var("VERIFICATION_TIMEOUT", 30)?),

            max_inflight_per_connection: parse_var("MAX_INFLIGHT_PER_CONNECTION", 16)?,
            max_batch_resubmissions: parse_var("MAX_BATCH_RESUBMISSIONS", 3)?,

            non_paying,
        };

        config.validate()?;
        Ok(config)
    }

    /// Boot-time invariants. Violations abort start-up.
    pub fn validate(&self) -> Result<()> {
        if self.max_proof_size + CBOR_ARRAY_MAX_OVERHEAD > self.max_batch_byte_size {
            return Err(BatcherError::Configuration(format!(
                "MAX_BATCH_BYTE_SIZE ({}) cannot hold one MAX_PROOF_SIZE ({}) proof \
                 plus framing",
                self.max_batch_byte_size, self.max_proof_size
            )));
        }
        if self.gas_base_bump_percentage > self.gas_bump_percentage_limit {
            return Err(BatcherError::Configuration(format!(
                "GAS_BASE_BUMP_PERCENTAGE ({}) exceeds GAS_BUMP_PERCENTAGE_LIMIT ({})",
                self.gas_base_bump_percentage, self.gas_bump_percentage_limit
            )));
        }
        if self.max_batch_proof_qty == 0 {
            return Err(BatcherError::Configuration(
                "MAX_BATCH_PROOF_QTY must be at least 1".into(),
            ));
        }
        if self.max_inflight_per_connection == 0 {
            return Err(BatcherError::Configuration(
                "MAX_INFLIGHT_PER_CONNECTION must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Gas not proportional to batch size: the aggregator's response cost
    /// (scaled by its multiplier) plus the submission base cost.
    pub fn constant_gas_cost(&self) -> u128 {
        (self.aggregator_fee_percentage_multiplier * self.aggregator_gas_cost)
            / PERCENTAGE_DIVIDER
            + SUBMISSION_BASE_GAS_COST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            metrics_port: 9093,
            telemetry_addr: None,
            eth_rpc_url: "http://localhost:8545".into(),
            eth_rpc_url_fallback: "http://localhost:8545".into(),
            eth_ws_url: "ws://localhost:8546".into(),
            eth_ws_url_fallback: "ws://localhost:8546".into(),
            payment_service_address: Address::ZERO,
            service_manager_address: Address::ZERO,
            private_key: "0x01".into(),
            storage_bucket: "batches".into(),
            download_endpoint: "https://storage.example.com".into(),
            upload_endpoint: None,
            block_interval: 10,
            batch_size_interval: 8 * 1024 * 1024,
            max_batch_proof_qty: 1024,
            max_batch_byte_size: 256 * 1024 * 1024,
            max_proof_size: 64 * 1024 * 1024,
            transaction_wait_timeout: Duration::from_secs(96),
            time_to_wait_before_bump: Duration::from_secs(36),
            gas_base_bump_percentage: 5,
            gas_bump_incremental_percentage: 5,
            gas_bump_percentage_limit: 90,
            gas_price_percentage_multiplier: 110,
            aggregator_fee_percentage_multiplier: 125,
            aggregator_gas_cost: 330_000,
            respond_to_task_fee_limit_percentage: 250,
            pre_verification_is_enabled: true,
            verification_timeout: Duration::from_secs(30),
            max_inflight_per_connection: 16,
            max_batch_resubmissions: 3,
            non_paying: None,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn batch_must_hold_one_max_size_proof() {
        let mut config = base_config();
        config.max_batch_byte_size = config.max_proof_size; // no room for framing
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_BATCH_BYTE_SIZE"));
    }

    #[test]
    fn bump_base_cannot_exceed_limit() {
        let mut config = base_config();
        config.gas_base_bump_percentage = 95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn constant_gas_cost_folds_aggregator_multiplier() {
        let config = base_config();
        // 125% of 330_000 plus the 125_000 submission base
        assert_eq!(config.constant_gas_cost(), 412_500 + 125_000);
    }
}
