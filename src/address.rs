//! Tagged socket-address wire codec.
//!
//! Wire format: type(1B) | host(4B or 16B) | port(2B BE)
//!   type = tag (low bits) with 0x80 set for IPv6 hosts
//!   tag 0x01: public address
//!   tag 0x02: local (LAN) address
//!   tag 0x03: redirection (rendezvous server) address

use crate::wire::{Reader, WireError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IPv6 flag in the address type byte.
const IPV6_FLAG: u8 = 0x80;

/// Semantic tag of an advertised address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// Publicly reachable address.
    Public,
    /// LAN-scoped address, never gossiped.
    Local,
    /// Rendezvous server address.
    Redirection,
}

impl AddressType {
    /// Returns the wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            AddressType::Public => 0x01,
            AddressType::Local => 0x02,
            AddressType::Redirection => 0x03,
        }
    }

    /// Parses a wire tag (IPv6 flag already stripped).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(AddressType::Public),
            0x02 => Some(AddressType::Local),
            0x03 => Some(AddressType::Redirection),
            _ => None,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Local => write!(f, "local"),
            AddressType::Redirection => write!(f, "redirection"),
        }
    }
}

/// Address codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// Data too short.
    TooShort,
    /// Unknown address tag.
    InvalidTag(u8),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::TooShort => write!(f, "address data too short"),
            AddressError::InvalidTag(t) => write!(f, "unknown address tag 0x{:02x}", t),
        }
    }
}

impl std::error::Error for AddressError {}

impl From<WireError> for AddressError {
    fn from(_: WireError) -> Self {
        AddressError::TooShort
    }
}

/// Appends a tagged address to a buffer.
pub fn write_address(buf: &mut Vec<u8>, addr: SocketAddr, typ: AddressType) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(typ.tag());
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(IPV6_FLAG | typ.tag());
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Encoded size of a tagged address.
pub fn address_size(addr: &SocketAddr) -> usize {
    match addr.ip() {
        IpAddr::V4(_) => 1 + 4 + 2,
        IpAddr::V6(_) => 1 + 16 + 2,
    }
}

/// Encoded size of the host bytes alone (4 or 16).
pub fn host_size(addr: &SocketAddr) -> usize {
    match addr.ip() {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

/// Reads one tagged address.
pub fn read_address(r: &mut Reader<'_>) -> Result<(SocketAddr, AddressType), AddressError> {
    let type_byte = r.read_u8()?;
    let typ = AddressType::from_tag(type_byte & !IPV6_FLAG)
        .ok_or(AddressError::InvalidTag(type_byte & !IPV6_FLAG))?;
    let ip: IpAddr = if type_byte & IPV6_FLAG != 0 {
        let bytes: [u8; 16] = r.read_bytes(16)?.try_into().unwrap();
        Ipv6Addr::from(bytes).into()
    } else {
        let bytes: [u8; 4] = r.read_bytes(4)?.try_into().unwrap();
        Ipv4Addr::from(bytes).into()
    };
    let port = r.read_u16()?;
    Ok((SocketAddr::new(ip, port), typ))
}

/// Reads a packed list of tagged addresses until the reader is exhausted.
///
/// Redirection entries update the returned host address instead of joining
/// the list. Returns false when nothing could be read.
pub fn read_address_list(
    r: &mut Reader<'_>,
    addresses: &mut Vec<(SocketAddr, AddressType)>,
    host_address: &mut SocketAddr,
) -> bool {
    let mut any = false;
    while r.available() > 0 {
        match read_address(r) {
            Ok((addr, AddressType::Redirection)) => {
                *host_address = addr;
                any = true;
            }
            Ok(entry) => {
                if !addresses.contains(&entry) {
                    addresses.push(entry);
                }
                any = true;
            }
            Err(_) => break,
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_roundtrip() {
        let addr = v4("192.0.2.5:1935");
        let mut buf = Vec::new();
        write_address(&mut buf, addr, AddressType::Public);
        assert_eq!(buf.len(), 7);
        assert_eq!(buf[0], 0x01);
        assert_eq!(address_size(&addr), 7);

        let mut r = Reader::new(&buf);
        let (decoded, typ) = read_address(&mut r).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(typ, AddressType::Public);
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut buf = Vec::new();
        write_address(&mut buf, addr, AddressType::Local);
        assert_eq!(buf.len(), 19);
        assert_eq!(buf[0], IPV6_FLAG | 0x02);

        let mut r = Reader::new(&buf);
        let (decoded, typ) = read_address(&mut r).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(typ, AddressType::Local);
    }

    #[test]
    fn test_list_extracts_redirection_host() {
        let mut buf = Vec::new();
        write_address(&mut buf, v4("10.0.0.2:1935"), AddressType::Local);
        write_address(&mut buf, v4("198.51.100.1:1935"), AddressType::Redirection);
        write_address(&mut buf, v4("203.0.113.9:1935"), AddressType::Public);

        let mut addresses = Vec::new();
        let mut host = v4("0.0.0.0:0");
        let mut r = Reader::new(&buf);
        assert!(read_address_list(&mut r, &mut addresses, &mut host));

        assert_eq!(host, v4("198.51.100.1:1935"));
        assert_eq!(
            addresses,
            vec![
                (v4("10.0.0.2:1935"), AddressType::Local),
                (v4("203.0.113.9:1935"), AddressType::Public),
            ]
        );
    }

    #[test]
    fn test_list_deduplicates() {
        let mut buf = Vec::new();
        write_address(&mut buf, v4("203.0.113.9:1935"), AddressType::Public);
        write_address(&mut buf, v4("203.0.113.9:1935"), AddressType::Public);

        let mut addresses = Vec::new();
        let mut host = v4("0.0.0.0:0");
        read_address_list(&mut Reader::new(&buf), &mut addresses, &mut host);
        assert_eq!(addresses.len(), 1);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            read_address(&mut Reader::new(&[])).unwrap_err(),
            AddressError::TooShort
        );
        assert_eq!(
            read_address(&mut Reader::new(&[0x01, 1, 2])).unwrap_err(),
            AddressError::TooShort
        );
        assert_eq!(
            read_address(&mut Reader::new(&[0x7F, 0, 0, 0, 0, 0, 0])).unwrap_err(),
            AddressError::InvalidTag(0x7F)
        );
    }
}
