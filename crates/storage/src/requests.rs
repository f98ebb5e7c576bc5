use crate::payload::{AuthenticatedPayload, AuthenticatedSequentialData, DataHash, MetaData};
use serde::{Deserialize, Serialize};
use tradenet_crypto::{hash_public_key, is_signature_valid, KeyPair};

/// Publishes a payload, or replaces it with a higher sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAuthenticatedDataRequest {
    pub sequential_data: AuthenticatedSequentialData,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub owner_public_key: Vec<u8>,
}

impl AddAuthenticatedDataRequest {
    /// Build and sign an add request for `payload`.
    pub fn from(
        payload: AuthenticatedPayload,
        sequence_number: u32,
        key_pair: &KeyPair,
        created: u64,
    ) -> Self {
        let sequential_data = AuthenticatedSequentialData::new(
            payload,
            sequence_number,
            key_pair.public_key_hash(),
            created,
        );
        let signature = key_pair.sign(&sequential_data.serialize_for_signature());
        Self {
            sequential_data,
            signature: signature.to_vec(),
            owner_public_key: key_pair.public_key().to_vec(),
        }
    }

    pub fn hash(&self) -> DataHash {
        self.sequential_data.payload.hash()
    }

    pub fn payload(&self) -> &AuthenticatedPayload {
        &self.sequential_data.payload
    }

    pub fn is_public_key_invalid(&self) -> bool {
        hash_public_key(&self.owner_public_key) != self.sequential_data.pub_key_hash
    }

    pub fn is_signature_invalid(&self) -> bool {
        !is_signature_valid(
            &self.owner_public_key,
            &self.sequential_data.serialize_for_signature(),
            &self.signature,
        )
    }
}

/// Tombstone for a payload. The signature covers only the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAuthenticatedDataRequest {
    pub meta_data: MetaData,
    pub hash: DataHash,
    #[serde(with = "serde_bytes")]
    pub owner_public_key: Vec<u8>,
    pub sequence_number: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub created: u64,
}

/// Bumps the sequence number of a stored add without touching its payload.
/// Same wire shape as a remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshAuthenticatedDataRequest {
    pub meta_data: MetaData,
    pub hash: DataHash,
    #[serde(with = "serde_bytes")]
    pub owner_public_key: Vec<u8>,
    pub sequence_number: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub created: u64,
}

macro_rules! hash_signed_request {
    ($request:ident) => {
        impl $request {
            pub fn from(
                payload: &AuthenticatedPayload,
                sequence_number: u32,
                key_pair: &KeyPair,
                created: u64,
            ) -> Self {
                let hash = payload.hash();
                Self {
                    meta_data: payload.meta_data.clone(),
                    hash,
                    owner_public_key: key_pair.public_key().to_vec(),
                    sequence_number,
                    signature: key_pair.sign(hash.as_bytes()).to_vec(),
                    created,
                }
            }

            pub fn is_sequence_nr_invalid(&self, seq_nr_from_map: u32) -> bool {
                self.sequence_number <= seq_nr_from_map
            }

            /// The signer must be the key recorded when the payload was added.
            pub fn is_public_key_hash_invalid(&self, stored: &AuthenticatedSequentialData) -> bool {
                hash_public_key(&self.owner_public_key) != stored.pub_key_hash
            }

            pub fn is_signature_invalid(&self) -> bool {
                !is_signature_valid(&self.owner_public_key, self.hash.as_bytes(), &self.signature)
            }
        }
    };
}

hash_signed_request!(RemoveAuthenticatedDataRequest);
hash_signed_request!(RefreshAuthenticatedDataRequest);

/// Mutation of the replicated store as it travels over the wire.
///
/// Only `Add` and `Remove` are ever kept in a [`crate::DataStore`]; a refresh
/// rewrites the stored add in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticatedDataRequest {
    Add(AddAuthenticatedDataRequest),
    Remove(RemoveAuthenticatedDataRequest),
    Refresh(RefreshAuthenticatedDataRequest),
}

impl AuthenticatedDataRequest {
    pub fn hash(&self) -> DataHash {
        match self {
            Self::Add(request) => request.hash(),
            Self::Remove(request) => request.hash,
            Self::Refresh(request) => request.hash,
        }
    }

    pub fn sequence_number(&self) -> u32 {
        match self {
            Self::Add(request) => request.sequential_data.sequence_number,
            Self::Remove(request) => request.sequence_number,
            Self::Refresh(request) => request.sequence_number,
        }
    }

    pub fn created(&self) -> u64 {
        match self {
            Self::Add(request) => request.sequential_data.created,
            Self::Remove(request) => request.created,
            Self::Refresh(request) => request.created,
        }
    }

    pub fn meta_data(&self) -> &MetaData {
        match self {
            Self::Add(request) => &request.sequential_data.payload.meta_data,
            Self::Remove(request) => &request.meta_data,
            Self::Refresh(request) => &request.meta_data,
        }
    }

    /// Adds whose payload outlived its own TTL. Tombstones never expire this way.
    pub fn is_expired(&self, now: u64) -> bool {
        match self {
            Self::Add(request) => request.sequential_data.is_expired(now),
            Self::Remove(_) | Self::Refresh(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Remove(_) => "remove",
            Self::Refresh(_) => "refresh",
        }
    }
}

impl From<AddAuthenticatedDataRequest> for AuthenticatedDataRequest {
    fn from(value: AddAuthenticatedDataRequest) -> Self {
        Self::Add(value)
    }
}

impl From<RemoveAuthenticatedDataRequest> for AuthenticatedDataRequest {
    fn from(value: RemoveAuthenticatedDataRequest) -> Self {
        Self::Remove(value)
    }
}

impl From<RefreshAuthenticatedDataRequest> for AuthenticatedDataRequest {
    fn from(value: RefreshAuthenticatedDataRequest) -> Self {
        Self::Refresh(value)
    }
}
