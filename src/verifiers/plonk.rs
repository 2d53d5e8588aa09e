//! PLONK envelope validation
//!
//! PLONK submissions are produced by the gnark toolchain, whose verifier
//! is not reachable from this process; operators run it downstream.
//! Pre-verification here is the cheap fast-reject layer: the envelope
//! must carry a verification key, the public input must be whole field
//! elements, and the proof must be at least as long as its mandatory
//! commitments and evaluations.

/// G1 sizes in gnark's compressed encoding.
const G1_COMPRESSED_BN254: usize = 32;
const G1_COMPRESSED_BLS12_381: usize = 48;

/// Scalar field elements are 32 bytes on both curves.
const SCALAR_SIZE: usize = 32;

/// A PLONK proof carries at minimum: three wire commitments, the grand
/// product commitment, three quotient pieces, and two opening proofs.
const MIN_G1_POINTS: usize = 9;

/// Linearization and wire evaluations included in the proof.
const MIN_EVALUATIONS: usize = 6;

fn validate(
    proof: &[u8],
    public_input: Option<&[u8]>,
    verification_key: Option<&[u8]>,
    g1_size: usize,
) -> bool {
    let Some(vk) = verification_key else {
        return false;
    };
    if vk.is_empty() {
        return false;
    }
    if let Some(input) = public_input {
        if input.len() % SCALAR_SIZE != 0 {
            return false;
        }
    }
    proof.len() >= MIN_G1_POINTS * g1_size + MIN_EVALUATIONS * SCALAR_SIZE
}

pub fn validate_plonk_bn254(
    proof: &[u8],
    public_input: Option<&[u8]>,
    verification_key: Option<&[u8]>,
) -> bool {
    validate(proof, public_input, verification_key, G1_COMPRESSED_BN254)
}

pub fn validate_plonk_bls12_381(
    proof: &[u8],
    public_input: Option<&[u8]>,
    verification_key: Option<&[u8]>,
) -> bool {
    validate(
        proof,
        public_input,
        verification_key,
        G1_COMPRESSED_BLS12_381,
    )
}
