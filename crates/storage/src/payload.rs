use serde::{Deserialize, Serialize};
use std::fmt;
use tradenet_crypto::sha256;

/// 32 byte content hash keying the data store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataHash(pub [u8; 32]);

impl DataHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataHash({})", self.to_hex())
    }
}

impl fmt::Display for DataHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for DataHash {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<DataHash> for String {
    fn from(value: DataHash) -> Self {
        value.to_hex()
    }
}

impl TryFrom<String> for DataHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid hash '{value}': {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("hash '{value}' is not 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Declared limits of a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaData {
    /// Time to live in milliseconds.
    pub ttl: u64,
    /// Maximum accepted size of the payload data in bytes.
    pub max_size: usize,
    /// Identifier of the payload type.
    pub class_name: String,
}

impl MetaData {
    pub fn new(ttl: u64, max_size: usize, class_name: impl Into<String>) -> Self {
        Self {
            ttl,
            max_size,
            class_name: class_name.into(),
        }
    }
}

/// Opaque signed record distributed through the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthenticatedPayload {
    pub meta_data: MetaData,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl AuthenticatedPayload {
    pub fn new(meta_data: MetaData, data: Vec<u8>) -> Self {
        Self { meta_data, data }
    }

    /// Canonical encoding used for content addressing.
    pub fn serialize_for_hash(&self) -> Vec<u8> {
        let class_name = self.meta_data.class_name.as_bytes();
        let mut bytes = Vec::with_capacity(24 + class_name.len() + self.data.len());
        bytes.extend_from_slice(&(class_name.len() as u32).to_be_bytes());
        bytes.extend_from_slice(class_name);
        bytes.extend_from_slice(&self.meta_data.ttl.to_be_bytes());
        bytes.extend_from_slice(&(self.meta_data.max_size as u64).to_be_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn hash(&self) -> DataHash {
        DataHash(sha256(&self.serialize_for_hash()))
    }

    /// A payload is invalid when it exceeds its declared size, has no type
    /// identifier or declares no lifetime.
    pub fn is_data_invalid(&self) -> bool {
        self.data.len() > self.meta_data.max_size
            || self.meta_data.class_name.is_empty()
            || self.meta_data.ttl == 0
    }
}

/// A payload together with its ordering and ownership information.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthenticatedSequentialData {
    pub payload: AuthenticatedPayload,
    pub sequence_number: u32,
    /// SHA-256 of the owner's encoded public key.
    pub pub_key_hash: [u8; 32],
    /// Creation time in milliseconds since the unix epoch.
    pub created: u64,
}

impl AuthenticatedSequentialData {
    pub fn new(
        payload: AuthenticatedPayload,
        sequence_number: u32,
        pub_key_hash: [u8; 32],
        created: u64,
    ) -> Self {
        Self {
            payload,
            sequence_number,
            pub_key_hash,
            created,
        }
    }

    /// Copy of `data` carrying a new sequence number.
    pub fn from(data: &AuthenticatedSequentialData, sequence_number: u32) -> Self {
        Self {
            sequence_number,
            ..data.clone()
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created) > self.payload.meta_data.ttl
    }

    /// True unless `sequence_number` is strictly greater than the stored one.
    pub fn is_sequence_nr_invalid(&self, seq_nr_from_map: u32) -> bool {
        self.sequence_number <= seq_nr_from_map
    }

    /// Bytes covered by the owner's signature.
    pub fn serialize_for_signature(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(76);
        bytes.extend_from_slice(self.payload.hash().as_bytes());
        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.pub_key_hash);
        bytes.extend_from_slice(&self.created.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(data: &[u8]) -> AuthenticatedPayload {
        AuthenticatedPayload::new(MetaData::new(60_000, 1024, "Offer"), data.to_vec())
    }

    #[test]
    fn hash_depends_on_data_and_metadata() {
        let a = payload(b"a");
        assert_eq!(a.hash(), payload(b"a").hash());
        assert_ne!(a.hash(), payload(b"b").hash());

        let mut other_type = payload(b"a");
        other_type.meta_data.class_name = "Chat".into();
        assert_ne!(a.hash(), other_type.hash());
    }

    #[test]
    fn data_invalid_when_oversized() {
        let mut p = payload(&[0u8; 16]);
        assert!(!p.is_data_invalid());
        p.meta_data.max_size = 8;
        assert!(p.is_data_invalid());
    }

    #[test]
    fn expiry_uses_ttl() {
        let data = AuthenticatedSequentialData::new(payload(b"x"), 1, [0; 32], 1_000);
        assert!(!data.is_expired(61_000));
        assert!(data.is_expired(61_001));
        assert!(!data.is_expired(0));
    }

    #[test]
    fn sequence_number_must_increase() {
        let data = AuthenticatedSequentialData::new(payload(b"x"), 5, [0; 32], 0);
        assert!(data.is_sequence_nr_invalid(5));
        assert!(data.is_sequence_nr_invalid(6));
        assert!(!data.is_sequence_nr_invalid(4));
        let bumped = AuthenticatedSequentialData::from(&data, 7);
        assert_eq!(bumped.sequence_number, 7);
        assert_eq!(bumped.payload, data.payload);
    }

    #[test]
    fn data_hash_hex_round_trip() {
        let hash = payload(b"x").hash();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: DataHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(DataHash::try_from("abcd".to_string()).is_err());
    }
}
