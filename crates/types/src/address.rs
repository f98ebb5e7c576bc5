use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Errors that can occur when parsing a peer address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("port must be in range 1..=65535, got {0}")]
    InvalidPort(u64),
    #[error("address '{0}' is missing a port")]
    MissingPort(String),
    #[error("address '{0}' is malformed")]
    Malformed(String),
    #[error("'{0}' is not a valid onion v3 host")]
    InvalidTorHost(String),
    #[error("'{0}' is not a valid i2p destination")]
    InvalidI2pHost(String),
    #[error("'{0}' is not an IP literal")]
    InvalidClearNetHost(String),
}

/// Transport networks a node can be reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Tor,
    I2p,
    Clear,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            TransportType::Tor => "tor",
            TransportType::I2p => "i2p",
            TransportType::Clear => "clear",
        };
        f.write_str(value)
    }
}

const ONION_SUFFIX: &str = ".onion";
const ONION_V3_HOST_LENGTH: usize = 56;
const I2P_B32_SUFFIX: &str = ".b32.i2p";
const I2P_B32_HOST_LENGTH: usize = 52;
const I2P_B64_MIN_LENGTH: usize = 516;
const I2P_B64_MAX_LENGTH: usize = 616;

/// A reachable peer endpoint.
///
/// `localhost` is normalised to `127.0.0.1` so that the same peer never shows
/// up under two keys in the connection maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Build an address from a host and port, validating the host for the
    /// transport it belongs to.
    pub fn from_host_port(host: &str, port: u64) -> Result<Self, AddressError> {
        if port == 0 || port > u16::MAX as u64 {
            return Err(AddressError::InvalidPort(port));
        }
        let host = normalize_host(host);
        match transport_type_of(&host) {
            TransportType::Tor => validate_onion_host(&host)?,
            TransportType::I2p => validate_i2p_host(&host)?,
            TransportType::Clear => {
                host.parse::<IpAddr>()
                    .map_err(|_| AddressError::InvalidClearNetHost(host.clone()))?;
            }
        }
        Ok(Self {
            host,
            port: port as u16,
        })
    }

    /// Loopback clear-net address on the given port.
    pub fn localhost(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Parse `host:port`, accepting `[v6]:port` for IPv6 literals.
    pub fn from_full_address(full_address: &str) -> Result<Self, AddressError> {
        let full_address = full_address.trim();
        let (host, port) = if let Some(rest) = full_address.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| AddressError::Malformed(full_address.to_string()))?;
            (host, port)
        } else {
            let (host, port) = full_address
                .rsplit_once(':')
                .ok_or_else(|| AddressError::MissingPort(full_address.to_string()))?;
            if host.contains(':') || host.contains(']') {
                return Err(AddressError::Malformed(full_address.to_string()));
            }
            (host, port)
        };
        if host.is_empty() {
            return Err(AddressError::Malformed(full_address.to_string()));
        }
        let port: u64 = port
            .parse()
            .map_err(|_| AddressError::MissingPort(full_address.to_string()))?;
        if host.contains(':') && host.parse::<IpAddr>().is_err() {
            return Err(AddressError::Malformed(full_address.to_string()));
        }
        Self::from_host_port(host, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport_type(&self) -> TransportType {
        transport_type_of(&self.host)
    }

    pub fn is_clear_net_address(&self) -> bool {
        self.transport_type() == TransportType::Clear
    }

    /// `host:port`, with IPv6 hosts wrapped in brackets.
    pub fn full_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_address())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_full_address(s)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.full_address()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_full_address(&value)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.eq_ignore_ascii_case("localhost") {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

fn transport_type_of(host: &str) -> TransportType {
    if host.ends_with(ONION_SUFFIX) {
        TransportType::Tor
    } else if host.ends_with(".i2p") || host.len() >= I2P_B64_MIN_LENGTH {
        TransportType::I2p
    } else {
        TransportType::Clear
    }
}

fn is_base32(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c))
}

fn validate_onion_host(host: &str) -> Result<(), AddressError> {
    let name = &host[..host.len() - ONION_SUFFIX.len()];
    if name.len() == ONION_V3_HOST_LENGTH && is_base32(name) {
        Ok(())
    } else {
        Err(AddressError::InvalidTorHost(host.to_string()))
    }
}

fn validate_i2p_host(host: &str) -> Result<(), AddressError> {
    if let Some(name) = host.strip_suffix(I2P_B32_SUFFIX) {
        if name.len() == I2P_B32_HOST_LENGTH && is_base32(name) {
            return Ok(());
        }
        return Err(AddressError::InvalidI2pHost(host.to_string()));
    }
    // Base64 destinations use the i2p alphabet ('-' and '~' instead of '+' and '/').
    let valid_len = (I2P_B64_MIN_LENGTH..=I2P_B64_MAX_LENGTH).contains(&host.len());
    let valid_chars = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '~' || c == '=');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(AddressError::InvalidI2pHost(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONION: &str = "m3h2p7j2mfl6w2u6g5hx7o5fek7e6fhb4i2h6h6syh5w4slf6xqrv7ad.onion";

    #[test]
    fn localhost_is_normalized() {
        let address = Address::from_host_port("localhost", 8000).unwrap();
        assert_eq!(address.host(), "127.0.0.1");
        assert_eq!(address, Address::localhost(8000));
        assert_eq!(
            Address::from_full_address("localhost:8000").unwrap(),
            Address::localhost(8000)
        );
    }

    #[test]
    fn clear_net_addresses() {
        assert!(Address::from_host_port("192.168.0.10", 8080).is_ok());
        assert!(Address::from_host_port("::", 8080).is_ok());
        let v6 = Address::from_full_address("[2001:db8:85a3::8a2e:370:7334]:9000").unwrap();
        assert_eq!(v6.port(), 9000);
        assert_eq!(v6.full_address(), "[2001:db8:85a3::8a2e:370:7334]:9000");
        assert_eq!(v6.transport_type(), TransportType::Clear);
    }

    #[test]
    fn invalid_clear_net_addresses() {
        assert_eq!(
            Address::from_host_port("127.0.0.1", 0),
            Err(AddressError::InvalidPort(0))
        );
        assert!(Address::from_host_port("127.0.0.1", 10_000_000).is_err());
        assert!(Address::from_host_port("127.0.0.256", 4444).is_err());
        assert!(Address::from_host_port("example.com", 80).is_err());
        assert!(Address::from_full_address("127.0.0.1").is_err());
        assert!(Address::from_full_address("2001:db8:85a3::8a2e:370:7334]:9000").is_err());
        assert!(Address::from_full_address("[2001:db8:85a3::8a2e:370:7334:9000").is_err());
        assert!(Address::from_full_address("2001:db8:85a3::8a2e:370:7334:9000").is_err());
    }

    #[test]
    fn tor_addresses() {
        let address = Address::from_host_port(ONION, 3333).unwrap();
        assert_eq!(address.transport_type(), TransportType::Tor);
        assert!(!address.is_clear_net_address());
        assert!(Address::from_host_port("duskgytldkxiuqc6.onion", 1234).is_err());
        assert!(Address::from_full_address(ONION).is_err());
    }

    #[test]
    fn i2p_b32_address() {
        let host = "wgglodqww5sifflx4ptugbn2yjey3x3xlkstozs7dmzw22wo6qfa.b32.i2p";
        let address = Address::from_host_port(host, 1234).unwrap();
        assert_eq!(address.transport_type(), TransportType::I2p);
    }

    #[test]
    fn serde_uses_full_address() {
        let address = Address::localhost(9999);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"127.0.0.1:9999\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
