/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives used for node identity.
//!
//! The definitions and re-exports in this module provide two categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Digital Signatures**: provided by the [`ed25519_dalek`] crate.
//!
//! The threshold (BLS) primitives used by the random beacon live in [`crate::beacon`].

use super::data_types::{SignatureBytes, VerifyingKeyBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};

/// A facade around [`SigningKey`] that implements method for [`sign`](Self::sign)-ing messages as well
/// as a getter for the [`public`](Self::public) key associated with the signing key.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    /// Create a `Keypair` that wraps over `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Sign an arbitrary `message` with the `Keypair`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the `VerifyingKey` of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Check that `signature` was produced over `message` by the key whose bytes are `signer`.
///
/// Returns `false` (never an error) if `signer` does not decode into a valid verifying key.
pub(crate) fn is_signed_by(signer: &VerifyingKeyBytes, message: &[u8], signature: &SignatureBytes) -> bool {
    match VerifyingKey::from_bytes(signer) {
        Ok(verifying_key) => verifying_key
            .verify(message, &Signature::from_bytes(&signature.bytes()))
            .is_ok(),
        Err(_) => false,
    }
}

/// SHA256 of `bytes`.
pub(crate) fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = CryptoHasher::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
