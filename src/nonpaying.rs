//! Non-paying submitter policy
//!
//! A single configured address may submit without paying: its fees are
//! billed to a batcher-held replacement wallet instead. The substitution
//! is a pure ingress transform on the payer, fee, nonce, and signature;
//! the verification data, and with it the `proof_generator_address` in
//! the Merkle leaf, is untouched.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;

use crate::config::{NonPayingConfig, DEFAULT_MAX_FEE_PER_PROOF};
use crate::crypto::signature::sign_submission;
use crate::domain::NoncedVerificationData;
use crate::errors::{BatcherError, Result};
use crate::wire::cbor_serialize;

pub struct NonPayingPolicy {
    address: Address,
    replacement: PrivateKeySigner,
}

/// A submission rewritten to the replacement payer.
pub struct RewrittenSubmission {
    pub submission: NoncedVerificationData,
    pub signature: Vec<u8>,
    pub payer: Address,
}

impl NonPayingPolicy {
    pub fn from_config(config: &NonPayingConfig) -> Result<Self> {
        let replacement: PrivateKeySigner =
            config.replacement_private_key.parse().map_err(|_| {
                BatcherError::Configuration(
                    "NON_PAYING_REPLACEMENT_PRIVATE_KEY is not a valid private key".into(),
                )
            })?;
        Ok(Self {
            address: config.address,
            replacement,
        })
    }

    pub fn applies_to(&self, submitter: &Address) -> bool {
        *submitter == self.address
    }

    pub fn replacement_address(&self) -> Address {
        self.replacement.address()
    }

    /// Rebind `submission` to the replacement wallet: the payer's own
    /// nonce sequence, the default capped fee, and a fresh signature.
    pub fn rewrite(
        &self,
        submission: &NoncedVerificationData,
        replacement_nonce: u64,
    ) -> Result<RewrittenSubmission> {
        let submission = NoncedVerificationData {
            verification_data: submission.verification_data.clone(),
            nonce: replacement_nonce,
            max_fee: U256::from(DEFAULT_MAX_FEE_PER_PROOF),
        };
        let payload = cbor_serialize(&submission)?;
        let signature = sign_submission(&self.replacement, &payload)?;

        Ok(RewrittenSubmission {
            submission,
            signature: signature.to_vec(),
            payer: self.replacement.address(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signature::{recover_submitter, submission_digest};
    use crate::domain::{ProvingSystem, VerificationData};

    fn policy() -> NonPayingPolicy {
        let key = PrivateKeySigner::random();
        NonPayingPolicy {
            address: Address::repeat_byte(0xaa),
            replacement: key,
        }
    }

    fn submission() -> NoncedVerificationData {
        NoncedVerificationData {
            verification_data: VerificationData {
                proving_system: ProvingSystem::Sp1,
                proof: vec![1, 2, 3],
                public_input: None,
                verification_key: None,
                vm_program: Some(vec![0u8; 8]),
                proof_generator_addr: Address::repeat_byte(0x77),
            },
            nonce: 12,
            max_fee: U256::from(5u8),
        }
    }

    #[test]
    fn applies_only_to_the_configured_address() {
        let p = policy();
        assert!(p.applies_to(&Address::repeat_byte(0xaa)));
        assert!(!p.applies_to(&Address::repeat_byte(0xab)));
    }

    #[test]
    fn rewrite_swaps_payer_fee_and_nonce_but_not_the_leaf_identity() {
        let p = policy();
        let original = submission();
        let rewritten = p.rewrite(&original, 3).unwrap();

        assert_eq!(rewritten.payer, p.replacement_address());
        assert_eq!(rewritten.submission.nonce, 3);
        assert_eq!(
            rewritten.submission.max_fee,
            U256::from(DEFAULT_MAX_FEE_PER_PROOF)
        );
        // Leaf identity survives the substitution.
        assert_eq!(
            rewritten.submission.verification_data.proof_generator_addr,
            Address::repeat_byte(0x77)
        );
        assert_eq!(
            rewritten.submission.verification_data.proof,
            original.verification_data.proof
        );
    }

    #[test]
    fn rewritten_signature_recovers_to_the_replacement() {
        let p = policy();
        let rewritten = p.rewrite(&submission(), 0).unwrap();

        let payload = cbor_serialize(&rewritten.submission).unwrap();
        let recovered = recover_submitter(&rewritten.signature, &submission_digest(&payload));
        assert_eq!(recovered, Some(p.replacement_address()));
    }
}
