use rand::RngCore;
use serde::{Deserialize, Serialize};
use tradenet_crypto::sha256;

/// Anti-spam credential attached to every post-handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub message_type: String,
    pub nonce: u64,
    #[serde(with = "serde_bytes")]
    pub proof: Vec<u8>,
}

/// Issues and checks authorization tokens.
pub trait AuthorizationService: Send + Sync {
    fn create_token(&self, message_type: &str) -> AuthorizationToken;

    fn is_authorized(&self, message_type: &str, token: &AuthorizationToken) -> bool;
}

/// Tokens bound to the message type they were minted for.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageTypeAuthorization;

impl MessageTypeAuthorization {
    fn proof(message_type: &str, nonce: u64) -> [u8; 32] {
        let mut preimage = Vec::with_capacity(message_type.len() + 8);
        preimage.extend_from_slice(message_type.as_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        sha256(&preimage)
    }
}

impl AuthorizationService for MessageTypeAuthorization {
    fn create_token(&self, message_type: &str) -> AuthorizationToken {
        let nonce = rand::thread_rng().next_u64();
        AuthorizationToken {
            message_type: message_type.to_string(),
            nonce,
            proof: Self::proof(message_type, nonce).to_vec(),
        }
    }

    fn is_authorized(&self, message_type: &str, token: &AuthorizationToken) -> bool {
        token.message_type == message_type
            && token.proof.as_slice() == Self::proof(message_type, token.nonce).as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_bound_to_message_type() {
        let service = MessageTypeAuthorization;
        let token = service.create_token("data_request");
        assert!(service.is_authorized("data_request", &token));
        assert!(!service.is_authorized("application", &token));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let service = MessageTypeAuthorization;
        let mut token = service.create_token("data_request");
        token.nonce = token.nonce.wrapping_add(1);
        assert!(!service.is_authorized("data_request", &token));
    }
}
