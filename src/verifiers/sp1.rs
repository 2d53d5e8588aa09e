//! SP1 proof verification
//!
//! The proof envelope is the bincode-serialized `SP1ProofWithPublicValues`
//! produced by the SP1 prover; the verifying key is derived from the guest
//! ELF shipped in the submission's `vm_program`.

use once_cell::sync::Lazy;
use sp1_sdk::Prover as _;
use sp1_sdk::{EnvProver, ProverClient, SP1ProofWithPublicValues};

static SP1_CLIENT: Lazy<EnvProver> = Lazy::new(ProverClient::from_env);

pub fn verify_sp1(proof_bytes: &[u8], elf: &[u8]) -> bool {
    let Ok(proof) = bincode::deserialize::<SP1ProofWithPublicValues>(proof_bytes) else {
        return false;
    };
    let (_, vk) = SP1_CLIENT.setup(elf);
    SP1_CLIENT.verify(&proof, &vk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_envelope_is_rejected() {
        assert!(!verify_sp1(&[0xde, 0xad, 0xbe, 0xef], &[]));
    }

    #[test]
    fn empty_envelope_is_rejected() {
        assert!(!verify_sp1(&[], &[]));
    }
}
