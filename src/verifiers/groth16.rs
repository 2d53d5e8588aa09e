//! Groth16 verification over BN254
//!
//! Proof and verifying key arrive in arkworks compressed canonical form;
//! the public input is a concatenation of 32-byte big-endian field
//! elements.

use ark_bn254::{Bn254, Fr};
use ark_ff::PrimeField;
use ark_groth16::{prepare_verifying_key, Groth16, Proof, VerifyingKey};
use ark_serialize::CanonicalDeserialize;

pub fn verify_groth16_bn254(proof_bytes: &[u8], public_input: &[u8], vk_bytes: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::<Bn254>::deserialize_compressed(vk_bytes) else {
        return false;
    };
    let Ok(proof) = Proof::<Bn254>::deserialize_compressed(proof_bytes) else {
        return false;
    };
    if public_input.len() % 32 != 0 {
        return false;
    }
    let inputs: Vec<Fr> = public_input
        .chunks(32)
        .map(Fr::from_be_bytes_mod_order)
        .collect();

    let pvk = prepare_verifying_key(&vk);
    Groth16::<Bn254>::verify_proof(&pvk, &proof, &inputs).unwrap_or(false)
}
