use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};

pub mod hash_functions;

pub use hash_functions::{hash_public_key, sha256, HashFunction, SHA256};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key length: expected 32, got {0}")]
    InvalidPublicKeyLength(usize),
    #[error("Invalid signature length: expected 64, got {0}")]
    InvalidSignatureLength(usize),
    #[error("Malformed public key: {0}")]
    MalformedPublicKey(String),
    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Ed25519 key pair used to sign store mutations.
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let mut secret_key = [0u8; 32];
        OsRng.fill_bytes(&mut secret_key);
        Self::from_seed(&secret_key)
    }

    /// Deterministic key pair from a 32 byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// SHA-256 of the encoded public key.
    pub fn public_key_hash(&self) -> [u8; 32] {
        hash_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        verify(&self.public_key(), message, signature)
    }
}

/// Verify `signature` over `message` with a public key given as raw bytes.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let public_key: [u8; PUBLIC_KEY_LENGTH] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKeyLength(public_key.len()))?;
    let signature: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignatureLength(signature.len()))?;
    let verifying_key = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))?;
    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Boolean form of [`verify`]; any decoding problem counts as an invalid signature.
pub fn is_signature_valid(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    verify(public_key, message, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let first = KeyPair::generate();
        let second = KeyPair::generate();
        assert_ne!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let message = b"hello tradenet";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature).is_ok());
        assert!(is_signature_valid(&keypair.public_key(), message, &signature));
        assert!(!is_signature_valid(&keypair.public_key(), b"other", &signature));
    }

    #[test]
    fn test_rejects_wrong_lengths() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"msg");
        assert!(matches!(
            verify(&[1, 2, 3], b"msg", &signature),
            Err(CryptoError::InvalidPublicKeyLength(3))
        ));
        assert!(matches!(
            verify(&keypair.public_key(), b"msg", &signature[..10]),
            Err(CryptoError::InvalidSignatureLength(10))
        ));
    }
}
