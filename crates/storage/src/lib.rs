//! Authenticated data storage
//!
//! A bounded map from content hash to the latest signed add or remove
//! request for that hash. Conflicts are resolved by sequence number and
//! only the key that first published a payload may mutate it.

pub mod data_store;
pub mod payload;
pub mod persistence;
pub mod requests;
pub mod result;
pub mod retention;
pub mod service;

pub use data_store::DataStore;
pub use payload::{AuthenticatedPayload, AuthenticatedSequentialData, DataHash, MetaData};
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence};
pub use requests::{
    AddAuthenticatedDataRequest, AuthenticatedDataRequest, RefreshAuthenticatedDataRequest,
    RemoveAuthenticatedDataRequest,
};
pub use result::{DataStorageReason, DataStorageResult};
pub use retention::{PruneReport, RetentionPolicy};
pub use service::{AuthenticatedDataStorageService, DataStorageListener, StorageConfig};

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
