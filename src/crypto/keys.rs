//! Ed25519 identity keys
//!
//! A participant's [`PeerId`] is its Ed25519 verifying key, so any signed
//! consensus artifact can be checked against the sender id alone.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};
use crate::protocol::{PeerId, Signature};

#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Peer id derived from the verifying key
    pub fn peer_id(&self) -> PeerId {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Verify `signature` over `message` with the key encoded in `peer`.
///
/// Returns false for malformed keys as well as bad signatures.
pub fn verify_signature(peer: &PeerId, message: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(peer) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify(message, &sig).is_ok()
}

/// Like [`verify_signature`] but as a `Result` for `?` call sites
pub fn require_valid_signature(
    peer: &PeerId,
    message: &[u8],
    signature: &Signature,
    what: &str,
) -> Result<()> {
    if verify_signature(peer, message, signature) {
        Ok(())
    } else {
        Err(Error::InvalidSignature(format!(
            "{} signature from {} does not verify",
            what,
            crate::protocol::short_hex(peer)
        )))
    }
}
