//! Risc0 receipt verification
//!
//! The proof envelope is a bincode-serialized `InnerReceipt`; `vm_program`
//! carries the 32-byte image id and `public_input` the journal the guest
//! committed.

use risc0_zkvm::{InnerReceipt, Receipt};

pub fn verify_risc0(receipt_bytes: &[u8], image_id: &[u8], journal: &[u8]) -> bool {
    let Ok(image_id) = <[u8; 32]>::try_from(image_id) else {
        return false;
    };
    let Ok(inner) = bincode::deserialize::<InnerReceipt>(receipt_bytes) else {
        return false;
    };
    let receipt = Receipt::new(inner, journal.to_vec());
    receipt.verify(image_id).is_ok()
}
