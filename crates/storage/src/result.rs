use crate::payload::AuthenticatedPayload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a store mutation was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStorageReason {
    RequestAlreadyReceived,
    SequenceNrInvalid,
    Expired,
    DataInvalid,
    PublicKeyHashInvalid,
    SignatureInvalid,
    MaxMapSizeReached,
    NoEntry,
    AlreadyRemoved,
}

impl fmt::Display for DataStorageReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of an add, remove or refresh. Only successful results should be
/// relayed to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStorageResult {
    pub success: bool,
    pub reason: Option<DataStorageReason>,
    /// Payload superseded by a successful remove.
    pub removed_payload: Option<AuthenticatedPayload>,
}

impl DataStorageResult {
    pub fn success() -> Self {
        Self {
            success: true,
            reason: None,
            removed_payload: None,
        }
    }

    pub fn rejected(reason: DataStorageReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            removed_payload: None,
        }
    }

    pub fn removed(payload: AuthenticatedPayload) -> Self {
        Self {
            removed_payload: Some(payload),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_rejected_with(&self, reason: DataStorageReason) -> bool {
        self.reason == Some(reason)
    }
}
