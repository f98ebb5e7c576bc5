use crate::payload::DataHash;
use crate::requests::AuthenticatedDataRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Latest accepted request per content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStore {
    map: HashMap<DataHash, AuthenticatedDataRequest>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &DataHash) -> Option<&AuthenticatedDataRequest> {
        self.map.get(hash)
    }

    pub fn contains(&self, hash: &DataHash) -> bool {
        self.map.contains_key(hash)
    }

    pub fn put(&mut self, hash: DataHash, request: AuthenticatedDataRequest) {
        self.map.insert(hash, request);
    }

    pub fn remove(&mut self, hash: &DataHash) -> Option<AuthenticatedDataRequest> {
        self.map.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataHash, &AuthenticatedDataRequest)> {
        self.map.iter()
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&DataHash, &mut AuthenticatedDataRequest) -> bool,
    {
        self.map.retain(f);
    }

    pub(crate) fn into_entries(self) -> Vec<(DataHash, AuthenticatedDataRequest)> {
        self.map.into_iter().collect()
    }

    pub(crate) fn from_entries(entries: impl IntoIterator<Item = (DataHash, AuthenticatedDataRequest)>) -> Self {
        Self {
            map: entries.into_iter().collect(),
        }
    }
}
