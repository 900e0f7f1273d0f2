//! Peer addressing and discovered-peer records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CentralError;

/// Length of a BLE device address in bytes
pub const ADDRESS_LEN: usize = 6;

/// BLE address type tag as reported by the dongle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Public (IEEE) address
    Public,
    /// Random static address
    RandomStatic,
    /// Random private resolvable address
    RandomPrivateResolvable,
    /// Random private non-resolvable address
    RandomPrivateNonResolvable,
    /// Any tag value the dongle reports that has no name here
    Other(u8),
}

impl AddressType {
    /// Raw tag passed back to the driver
    pub fn as_u8(self) -> u8 {
        match self {
            AddressType::Public => 0,
            AddressType::RandomStatic => 1,
            AddressType::RandomPrivateResolvable => 2,
            AddressType::RandomPrivateNonResolvable => 3,
            AddressType::Other(raw) => raw,
        }
    }
}

impl From<u8> for AddressType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => AddressType::Public,
            1 => AddressType::RandomStatic,
            2 => AddressType::RandomPrivateResolvable,
            3 => AddressType::RandomPrivateNonResolvable,
            other => AddressType::Other(other),
        }
    }
}

/// Hardware address of a peer: six bytes plus the address-type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Address type tag
    pub kind: AddressType,
    /// Address bytes in the order the dongle reports them
    pub bytes: [u8; ADDRESS_LEN],
}

impl PeerAddress {
    /// Create an address from its parts
    pub fn new(kind: AddressType, bytes: [u8; ADDRESS_LEN]) -> Self {
        Self { kind, bytes }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Strip `:`/`-` separators and upper-case an address string
///
/// The dongle reports addresses as 12 upper-case hex digits; users tend to
/// type them with separators.
pub fn normalize_address(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

impl FromStr for PeerAddress {
    type Err = CentralError;

    /// Parses `112233445566` or `11:22:33:44:55:66`, tagged as public
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = normalize_address(s);
        if digits.len() != ADDRESS_LEN * 2 || !digits.is_ascii() {
            return Err(CentralError::InvalidAddress(s.to_string()));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| CentralError::InvalidAddress(s.to_string()))?;
        }

        Ok(Self::new(AddressType::Public, bytes))
    }
}

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    /// Hardware address (identity)
    pub address: PeerAddress,
    /// Address string as formatted by the dongle
    pub address_label: String,
    /// Most recent non-empty advertised name
    pub name: Option<String>,
    /// Most recent signal strength in dBm
    pub rssi: i8,
}

impl DiscoveredPeer {
    /// One-line description used in device lists and logs
    pub fn label(&self) -> String {
        format!(
            "{} {} {}",
            self.address_label,
            self.name.as_deref().unwrap_or("-"),
            self.rssi
        )
    }
}

/// Peer chosen for connection, frozen at selection time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Address and type tag used for `conn_start`
    pub address: PeerAddress,
    /// Address string as formatted by the dongle
    pub address_label: String,
}

impl From<&DiscoveredPeer> for ConnectionTarget {
    fn from(peer: &DiscoveredPeer) -> Self {
        Self {
            address: peer.address,
            address_label: peer.address_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_type_round_trip_of_known_tags() {
        for raw in 0..4u8 {
            assert_eq!(AddressType::from(raw).as_u8(), raw);
        }
        assert_eq!(AddressType::from(0x7F), AddressType::Other(0x7F));
    }

    #[test]
    fn test_parse_address_with_separators() {
        let addr: PeerAddress = "c1:02:a3:44:55:f6".parse().unwrap();
        assert_eq!(addr.bytes, [0xC1, 0x02, 0xA3, 0x44, 0x55, 0xF6]);
        assert_eq!(addr.to_string(), "C102A34455F6");
    }

    #[test]
    fn test_parse_address_rejects_bad_input() {
        assert!("1122334455".parse::<PeerAddress>().is_err());
        assert!("11223344556G".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" aa-bb-cc:dd:ee:ff "), "AABBCCDDEEFF");
    }

    #[test]
    fn test_peer_label() {
        let peer = DiscoveredPeer {
            address: PeerAddress::new(AddressType::RandomStatic, [1, 2, 3, 4, 5, 6]),
            address_label: "010203040506".to_string(),
            name: None,
            rssi: -61,
        };
        assert_eq!(peer.label(), "010203040506 - -61");
    }
}
