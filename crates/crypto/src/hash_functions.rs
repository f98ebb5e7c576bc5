//! Hash functions used for content addressing and key fingerprints.

use sha2::{Digest, Sha256};

/// Trait for hash functions
pub trait HashFunction {
    /// Hash input data and return a fixed-size array
    fn hash_fixed(&self, data: &[u8]) -> [u8; 32];

    fn name(&self) -> &'static str;
}

/// SHA256 hash implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SHA256;

impl HashFunction for SHA256 {
    fn hash_fixed(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn name(&self) -> &'static str {
        "SHA256"
    }
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    SHA256.hash_fixed(data)
}

/// Fingerprint of an encoded public key, compared against the owner hash
/// recorded in stored data.
pub fn hash_public_key(public_key: &[u8]) -> [u8; 32] {
    sha256(public_key)
}
