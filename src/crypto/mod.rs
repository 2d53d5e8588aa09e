//! Cryptographic utilities: Keccak commitments, the batch Merkle tree,
//! and submitter signature recovery.

pub mod hash;
pub mod merkle;
pub mod signature;

pub use hash::Hash256;
pub use merkle::{MerkleProof, MerkleTree};
