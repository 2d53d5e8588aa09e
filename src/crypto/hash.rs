//! Keccak commitments over submission payloads
//!
//! Every queued entry is committed to by a 32-byte fingerprint:
//!
//! ```text
//! proof_commitment        = keccak(proof)
//! public_input_commitment = keccak(public_input | "")
//! aux_commitment          = keccak(verification_key | "" || vm_program | "")
//! fingerprint = keccak(proof_commitment || public_input_commitment
//!                      || aux_commitment || proof_generator_address)
//! ```
//!
//! The fingerprint doubles as the Merkle leaf: the leaf preimage is the
//! 116-byte concatenation above, so operators recomputing leaves from the
//! published payload land on the same tree.

use alloy::primitives::{keccak256, Address};

/// 32-byte Keccak-256 hash
pub type Hash256 = [u8; 32];

/// Keccak-256 over raw bytes.
pub fn keccak(data: &[u8]) -> Hash256 {
    keccak256(data).0
}

/// Commitment to the proof bytes.
pub fn proof_commitment(proof: &[u8]) -> Hash256 {
    keccak(proof)
}

/// Commitment to the public input; an absent input commits to the empty
/// string so the fingerprint layout is uniform across proof systems.
pub fn public_input_commitment(public_input: Option<&[u8]>) -> Hash256 {
    keccak(public_input.unwrap_or(&[]))
}

/// Commitment to the proving-system auxiliary data: the verification key
/// and/or VM program image, whichever the variant carries.
pub fn aux_commitment(verification_key: Option<&[u8]>, vm_program: Option<&[u8]>) -> Hash256 {
    let mut data = Vec::with_capacity(
        verification_key.map_or(0, <[u8]>::len) + vm_program.map_or(0, <[u8]>::len),
    );
    if let Some(vk) = verification_key {
        data.extend_from_slice(vk);
    }
    if let Some(program) = vm_program {
        data.extend_from_slice(program);
    }
    keccak(&data)
}

/// The fingerprint preimage: `proof_commitment || public_input_commitment
/// || aux_commitment || proof_generator_address` (116 bytes).
pub fn fingerprint_preimage(
    proof_commitment: &Hash256,
    public_input_commitment: &Hash256,
    aux_commitment: &Hash256,
    proof_generator_addr: &Address,
) -> [u8; 116] {
    let mut preimage = [0u8; 116];
    preimage[..32].copy_from_slice(proof_commitment);
    preimage[32..64].copy_from_slice(public_input_commitment);
    preimage[64..96].copy_from_slice(aux_commitment);
    preimage[96..].copy_from_slice(proof_generator_addr.as_slice());
    preimage
}

/// The entry fingerprint, also the Merkle leaf.
pub fn fingerprint(
    proof_commitment: &Hash256,
    public_input_commitment: &Hash256,
    aux_commitment: &Hash256,
    proof_generator_addr: &Address,
) -> Hash256 {
    keccak(&fingerprint_preimage(
        proof_commitment,
        public_input_commitment,
        aux_commitment,
        proof_generator_addr,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_public_input_commits_to_empty() {
        assert_eq!(public_input_commitment(None), keccak(&[]));
        assert_ne!(public_input_commitment(Some(b"input")), keccak(&[]));
    }

    #[test]
    fn aux_commitment_concatenates_present_parts() {
        let both = aux_commitment(Some(b"vk"), Some(b"program"));
        assert_eq!(both, keccak(b"vkprogram"));
        assert_eq!(aux_commitment(Some(b"vk"), None), keccak(b"vk"));
        assert_eq!(aux_commitment(None, None), keccak(&[]));
    }

    #[test]
    fn fingerprint_binds_the_generator_address() {
        let proof = proof_commitment(b"proof");
        let input = public_input_commitment(Some(b"input"));
        let aux = aux_commitment(Some(b"vk"), None);

        let a = fingerprint(&proof, &input, &aux, &Address::repeat_byte(0x11));
        let b = fingerprint(&proof, &input, &aux, &Address::repeat_byte(0x22));
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_keccak_of_preimage() {
        let proof = proof_commitment(b"p");
        let input = public_input_commitment(None);
        let aux = aux_commitment(None, Some(b"elf"));
        let addr = Address::repeat_byte(0xab);

        let preimage = fingerprint_preimage(&proof, &input, &aux, &addr);
        assert_eq!(fingerprint(&proof, &input, &aux, &addr), keccak(&preimage));
    }
}
