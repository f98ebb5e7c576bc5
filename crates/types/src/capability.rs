use crate::address::{Address, TransportType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a node announces about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// The address the node is reachable at.
    pub address: Address,
    pub supported_transport_types: BTreeSet<TransportType>,
}

impl Capability {
    pub fn new(address: Address, supported_transport_types: BTreeSet<TransportType>) -> Self {
        Self {
            address,
            supported_transport_types,
        }
    }

    /// Capability advertising only the transport of `address`.
    pub fn for_address(address: Address) -> Self {
        let supported_transport_types = BTreeSet::from([address.transport_type()]);
        Self {
            address,
            supported_transport_types,
        }
    }

    pub fn supports(&self, transport_type: TransportType) -> bool {
        self.supported_transport_types.contains(&transport_type)
    }
}

/// Load information a node reports to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Load {
    pub num_connections: u32,
}

impl Load {
    pub const INITIAL: Load = Load { num_connections: 0 };

    pub fn new(num_connections: u32) -> Self {
        Self { num_connections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_for_address_supports_its_transport() {
        let capability = Capability::for_address(Address::localhost(7000));
        assert!(capability.supports(TransportType::Clear));
        assert!(!capability.supports(TransportType::Tor));
    }

    #[test]
    fn capability_serializes_address_as_string() {
        let capability = Capability::for_address(Address::localhost(7000));
        let json = serde_json::to_value(&capability).unwrap();
        assert_eq!(json["address"], "127.0.0.1:7000");
        assert_eq!(json["supported_transport_types"][0], "clear");
    }

    #[test]
    fn initial_load_has_no_connections() {
        assert_eq!(Load::INITIAL, Load::default());
        assert_eq!(Load::new(3).num_connections, 3);
    }
}
