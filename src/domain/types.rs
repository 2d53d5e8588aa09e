//! Submission payloads and their commitments

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::hash::{
    self, aux_commitment, proof_commitment, public_input_commitment, Hash256,
};

/// Supported proof systems.
///
/// Discriminants are stable: they appear on the wire and index the
/// service manager's disabled-verifier bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProvingSystem {
    Groth16Bn254 = 0,
    PlonkBn254 = 1,
    PlonkBls12_381 = 2,
    Sp1 = 3,
    Risc0 = 4,
}

impl ProvingSystem {
    /// Bit position in the service manager's disabled-verifier bitmap.
    pub fn bitmap_position(self) -> u8 {
        self as u8
    }

    /// Whether this system is flagged in `bitmap`.
    pub fn is_disabled_in(self, bitmap: U256) -> bool {
        bitmap.bit(self.bitmap_position() as usize)
    }
}

impl std::fmt::Display for ProvingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProvingSystem::Groth16Bn254 => "Groth16Bn254",
            ProvingSystem::PlonkBn254 => "PlonkBn254",
            ProvingSystem::PlonkBls12_381 => "PlonkBls12_381",
            ProvingSystem::Sp1 => "SP1",
            ProvingSystem::Risc0 => "Risc0",
        };
        write!(f, "{name}")
    }
}

/// The verifier-relevant payload of one submission. Which optional
/// components must be present depends on the proof system:
///
/// - Groth16/PLONK: `verification_key` and `public_input`
/// - SP1: `vm_program` (the ELF image)
/// - Risc0: `vm_program` (the 32-byte image id), `public_input` (journal)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationData {
    pub proving_system: ProvingSystem,
    pub proof: Vec<u8>,
    #[serde(default)]
    pub public_input: Option<Vec<u8>>,
    #[serde(default)]
    pub verification_key: Option<Vec<u8>>,
    #[serde(default)]
    pub vm_program: Option<Vec<u8>>,
    /// Identity stamped into the Merkle leaf. Not the payer.
    pub proof_generator_addr: Address,
}

/// A submission bound to the submitter's fee bid and nonce. This is the
/// struct the client signs (as CBOR) and the queue schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoncedVerificationData {
    pub verification_data: VerificationData,
    pub nonce: u64,
    pub max_fee: U256,
}

/// Keccak commitments over one entry; see [`crate::crypto::hash`] for the
/// exact preimages. The fingerprint is the Merkle leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCommitment {
    pub proof_commitment: Hash256,
    pub public_input_commitment: Hash256,
    pub aux_commitment: Hash256,
    pub proof_generator_addr: Address,
}

impl VerificationCommitment {
    pub fn fingerprint(&self) -> Hash256 {
        hash::fingerprint(
            &self.proof_commitment,
            &self.public_input_commitment,
            &self.aux_commitment,
            &self.proof_generator_addr,
        )
    }

    /// Alias for [`Self::fingerprint`]; the leaf and the fingerprint are
    /// the same 32 bytes by construction.
    pub fn merkle_leaf(&self) -> Hash256 {
        self.fingerprint()
    }
}

impl From<&VerificationData> for VerificationCommitment {
    fn from(data: &VerificationData) -> Self {
        Self {
            proof_commitment: proof_commitment(&data.proof),
            public_input_commitment: public_input_commitment(data.public_input.as_deref()),
            aux_commitment: aux_commitment(
                data.verification_key.as_deref(),
                data.vm_program.as_deref(),
            ),
            proof_generator_addr: data.proof_generator_addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_data(system: ProvingSystem) -> VerificationData {
        VerificationData {
            proving_system: system,
            proof: vec![0xaa; 64],
            public_input: Some(vec![0x01; 32]),
            verification_key: Some(vec![0x02; 48]),
            vm_program: None,
            proof_generator_addr: Address::repeat_byte(0x42),
        }
    }

    #[test]
    fn bitmap_positions_are_stable() {
        assert_eq!(ProvingSystem::Groth16Bn254.bitmap_position(), 0);
        assert_eq!(ProvingSystem::PlonkBn254.bitmap_position(), 1);
        assert_eq!(ProvingSystem::PlonkBls12_381.bitmap_position(), 2);
        assert_eq!(ProvingSystem::Sp1.bitmap_position(), 3);
        assert_eq!(ProvingSystem::Risc0.bitmap_position(), 4);
    }

    #[test]
    fn disabled_bitmap_checks_the_right_bit() {
        let bitmap = U256::from(0b01000u8); // bit 3 = SP1
        assert!(ProvingSystem::Sp1.is_disabled_in(bitmap));
        assert!(!ProvingSystem::Risc0.is_disabled_in(bitmap));
        assert!(!ProvingSystem::Groth16Bn254.is_disabled_in(bitmap));
    }

    #[test]
    fn commitment_changes_with_any_component() {
        let data = sample_data(ProvingSystem::Groth16Bn254);
        let base = VerificationCommitment::from(&data).fingerprint();

        let mut other = data.clone();
        other.proof[0] ^= 1;
        assert_ne!(VerificationCommitment::from(&other).fingerprint(), base);

        let mut other = data.clone();
        other.public_input = None;
        assert_ne!(VerificationCommitment::from(&other).fingerprint(), base);

        let mut other = data;
        other.proof_generator_addr = Address::repeat_byte(0x43);
        assert_ne!(VerificationCommitment::from(&other).fingerprint(), base);
    }

    #[test]
    fn cbor_roundtrip_preserves_payload() {
        let data = NoncedVerificationData {
            verification_data: sample_data(ProvingSystem::Sp1),
            nonce: 7,
            max_fee: U256::from(1_000_000_000u64),
        };

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&data, &mut bytes).unwrap();
        let decoded: NoncedVerificationData = ciborium::de::from_reader(bytes.as_slice()).unwrap();

        assert_eq!(decoded, data);
    }
}
