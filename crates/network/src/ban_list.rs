use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::info;
use tradenet_types::Address;

/// Addresses we refuse to handshake with.
#[derive(Debug, Default)]
pub struct BanList {
    banned: RwLock<HashSet<Address>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&self, address: Address) {
        info!("Banning {}", address);
        self.banned.write().insert(address);
    }

    pub fn unban(&self, address: &Address) -> bool {
        self.banned.write().remove(address)
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.read().contains(address)
    }

    pub fn len(&self) -> usize {
        self.banned.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.read().is_empty()
    }
}
