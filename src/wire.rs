//! Client wire protocol
//!
//! Frames are CBOR-encoded binary WebSocket messages; text frames are a
//! protocol violation. The server pushes its protocol version on connect,
//! then answers each client frame with exactly one terminal reply, in
//! request order per connection.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash256, MerkleProof};
use crate::domain::{NoncedVerificationData, VerificationData};
use crate::errors::{BatcherError, RejectReason, Result};

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Declare the client's protocol version. A version newer than the
    /// server's is refused with a typed error and the stream closes;
    /// anything up to the server's version is accepted.
    ProtocolVersion(u16),
    /// Ask for the next usable nonce of `0` before submitting.
    GetNonce(Address),
    /// Submit one proof for batching.
    Submit(Box<SubmitRequest>),
}

/// A proof submission: the signed payload plus its signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub verification_data: VerificationData,
    pub nonce: u64,
    pub max_fee: U256,
    /// 65-byte `r || s || v` EIP-191 signature over the CBOR encoding of
    /// the corresponding [`NoncedVerificationData`].
    pub signature: Vec<u8>,
}

impl SubmitRequest {
    /// The payload the signature covers.
    pub fn signed_payload(&self) -> NoncedVerificationData {
        NoncedVerificationData {
            verification_data: self.verification_data.clone(),
            nonce: self.nonce,
            max_fee: self.max_fee,
        }
    }
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every connection.
    ProtocolVersion(u16),
    /// Reply to [`ClientMessage::GetNonce`].
    Nonce(u64),
    /// Terminal success reply: the entry was anchored on-chain.
    BatchInclusion {
        batch_merkle_root: Hash256,
        merkle_proof: MerkleProof,
        index_in_batch: usize,
    },
    /// Terminal failure reply.
    Error {
        error_kind: RejectReason,
        message: String,
    },
}

impl ServerMessage {
    pub fn rejection(reason: RejectReason) -> Self {
        let message = reason.to_string();
        ServerMessage::Error {
            error_kind: reason,
            message,
        }
    }
}

/// CBOR-encode a frame.
pub fn cbor_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| BatcherError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// CBOR-decode a frame.
pub fn cbor_deserialize<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| BatcherError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProvingSystem;

    fn request() -> SubmitRequest {
        SubmitRequest {
            verification_data: VerificationData {
                proving_system: ProvingSystem::Risc0,
                proof: vec![1, 2, 3],
                public_input: Some(vec![4]),
                verification_key: None,
                vm_program: Some(vec![0u8; 32]),
                proof_generator_addr: Address::repeat_byte(7),
            },
            nonce: 3,
            max_fee: U256::from(42u8),
            signature: vec![0u8; 65],
        }
    }

    #[test]
    fn version_frame_roundtrips() {
        let bytes = cbor_serialize(&ClientMessage::ProtocolVersion(2)).unwrap();
        let decoded: ClientMessage = cbor_deserialize(&bytes).unwrap();
        match decoded {
            ClientMessage::ProtocolVersion(version) => assert_eq!(version, 2),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn client_frame_roundtrips() {
        let frame = ClientMessage::Submit(Box::new(request()));
        let bytes = cbor_serialize(&frame).unwrap();
        let decoded: ClientMessage = cbor_deserialize(&bytes).unwrap();
        match decoded {
            ClientMessage::Submit(req) => {
                assert_eq!(req.nonce, 3);
                assert_eq!(req.max_fee, U256::from(42u8));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_frame_roundtrips() {
        let frame = ServerMessage::BatchInclusion {
            batch_merkle_root: [9u8; 32],
            merkle_proof: MerkleProof {
                siblings: vec![[1u8; 32]],
                index: 0,
            },
            index_in_batch: 0,
        };
        let bytes = cbor_serialize(&frame).unwrap();
        let decoded: ServerMessage = cbor_deserialize(&bytes).unwrap();
        match decoded {
            ServerMessage::BatchInclusion {
                batch_merkle_root, ..
            } => assert_eq!(batch_merkle_root, [9u8; 32]),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn signed_payload_excludes_the_signature() {
        let req = request();
        let payload = req.signed_payload();
        assert_eq!(payload.nonce, req.nonce);
        assert_eq!(payload.max_fee, req.max_fee);
        assert_eq!(payload.verification_data, req.verification_data);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(cbor_deserialize::<ClientMessage>(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn rejection_carries_the_display_message() {
        match ServerMessage::rejection(RejectReason::ProofTooLarge) {
            ServerMessage::Error {
                error_kind,
                message,
            } => {
                assert_eq!(error_kind, RejectReason::ProofTooLarge);
                assert_eq!(message, "proof too large");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
