//! Submitter authentication
//!
//! Submissions are authenticated with an EIP-191 personal-sign signature
//! over the CBOR-serialized signed payload. The recovered address is the
//! submitter (the payer); it is never taken from the payload itself.

use alloy::primitives::{eip191_hash_message, Address, PrimitiveSignature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use crate::errors::{BatcherError, Result};

/// EIP-191 digest of a serialized submission payload.
pub fn submission_digest(payload: &[u8]) -> B256 {
    eip191_hash_message(payload)
}

/// Recover the submitter address from a 65-byte `r || s || v` signature
/// over `digest`. Returns `None` for malformed or unrecoverable signatures.
pub fn recover_submitter(signature: &[u8], digest: &B256) -> Option<Address> {
    let signature = PrimitiveSignature::try_from(signature).ok()?;
    signature.recover_address_from_prehash(digest).ok()
}

/// Sign a submission payload with the given wallet, producing the 65-byte
/// wire signature. Used by the non-paying replacement wallet and by tests.
pub fn sign_submission(signer: &PrivateKeySigner, payload: &[u8]) -> Result<[u8; 65]> {
    let signature = signer
        .sign_hash_sync(&submission_digest(payload))
        .map_err(|e| BatcherError::Internal(format!("signing failed: {e}")))?;
    Ok(signature.as_bytes())
}
