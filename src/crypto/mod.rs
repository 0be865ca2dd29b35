//! Cryptographic primitives for consensus artifacts
//!
//! - Ed25519 signing keys (`keys`)
//! - Domain-separated SHA-256 helpers used for proposal ids, state hashes,
//!   randomness commitments and dispute ids

pub mod keys;

pub use keys::{require_valid_signature, verify_signature, SigningKeyPair};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::protocol::Hash256;

/// SHA-256 over a domain tag followed by each part in order
pub fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Fill a 32-byte buffer from the OS CSPRNG
pub fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
