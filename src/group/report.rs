//! Group report (message 0A) encoding and parsing.
//!
//! A report tells the recipient how we see its public address, which
//! rendezvous server we use, and a best-list slice of peers with their
//! addresses and the seconds elapsed since we last heard each one.

use crate::address::{self, host_size, read_address, read_address_list, AddressType};
use crate::consts::{message_type, report_marker, RAW_ID_PREFIX, RAW_ID_SIZE};
use crate::peer_id::PeerId;
use crate::wire::{self, Reader, WireError};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{error, trace};

/// One best-list peer advertised in an outgoing report.
pub struct ReportEntry {
    pub raw_id: [u8; RAW_ID_SIZE],
    pub elapsed_secs: u64,
    pub host_address: SocketAddr,
    pub addresses: Vec<(SocketAddr, AddressType)>,
}

impl ReportEntry {
    fn addresses_size(&self) -> usize {
        let mut size = host_size(&self.host_address) + 4;
        for (addr, typ) in &self.addresses {
            if *typ != AddressType::Local {
                size += host_size(addr) + 3;
            }
        }
        size
    }
}

/// A peer extracted from an incoming report.
#[derive(Debug)]
pub struct ReportPeer {
    pub peer_id: PeerId,
    pub raw_id: [u8; RAW_ID_SIZE],
    pub elapsed_secs: u64,
    pub addresses: Vec<(SocketAddr, AddressType)>,
    pub host_address: SocketAddr,
}

/// Everything parsed out of an incoming report.
#[derive(Debug)]
pub struct ParsedReport {
    /// Our own address as the sender sees it.
    pub own_address: SocketAddr,
    /// The sender's rendezvous server.
    pub sender_host: SocketAddr,
    /// Advertised peers, unfiltered; the controller decides which are new.
    pub peers: Vec<ReportPeer>,
}

/// Report parse errors. Header errors abort the whole message.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("unexpected marker 0x{got:02x}, expected 0x{expected:02x}")]
    UnexpectedMarker { got: u8, expected: u8 },
    #[error("truncated report: {0}")]
    Truncated(#[from] WireError),
    #[error("malformed address record: {0}")]
    Address(#[from] address::AddressError),
}

/// Builds the report payload, including the leading 0A type byte.
pub fn write_group_report(
    peer_address: SocketAddr,
    server_address: SocketAddr,
    entries: &[ReportEntry],
) -> Vec<u8> {
    let mut size_total = host_size(&peer_address) + host_size(&server_address) + 12;
    for entry in entries {
        size_total += RAW_ID_SIZE + 3 + entry.addresses_size() + wire::varint_size(entry.elapsed_secs);
    }
    let mut buf = Vec::with_capacity(size_total);

    buf.push(message_type::GROUP_REPORT);
    buf.push((host_size(&peer_address) + 4) as u8);
    buf.push(report_marker::SELF_ADDRESS);
    address::write_address(&mut buf, peer_address, AddressType::Public);
    buf.push((host_size(&server_address) + 4) as u8);
    buf.push(report_marker::HOST);
    address::write_address(&mut buf, server_address, AddressType::Redirection);
    buf.push(report_marker::END);

    for entry in entries {
        buf.push(0x22);
        buf.extend_from_slice(&entry.raw_id);
        wire::write_varint(&mut buf, entry.elapsed_secs);
        buf.push(entry.addresses_size() as u8);
        buf.push(report_marker::HOST);
        address::write_address(&mut buf, entry.host_address, AddressType::Redirection);
        for (addr, typ) in &entry.addresses {
            if *typ != AddressType::Local {
                address::write_address(&mut buf, *addr, *typ);
            }
        }
        buf.push(report_marker::END);
    }

    buf
}

/// Parses a report payload (without the leading 0A type byte).
///
/// `default_host` seeds the host address of every advertised peer whose
/// address block carries no redirection entry (our own server). A marker
/// mismatch in the entry loop stops the loop but keeps the peers already
/// collected.
pub fn read_group_report(
    payload: &[u8],
    default_host: SocketAddr,
) -> Result<ParsedReport, ReportError> {
    let mut r = Reader::new(payload);

    let mut size = r.read_u8()?;
    while size == 1 {
        r.skip(1);
        size = r.read_u8()?;
    }

    let marker = r.read_u8()?;
    if marker != report_marker::SELF_ADDRESS {
        return Err(ReportError::UnexpectedMarker {
            got: marker,
            expected: report_marker::SELF_ADDRESS,
        });
    }
    let (own_address, _) = read_address(&mut r)?;

    let size = r.read_u8()? as usize;
    let marker = r.read_u8()?;
    if marker != report_marker::HOST {
        return Err(ReportError::UnexpectedMarker {
            got: marker,
            expected: report_marker::HOST,
        });
    }
    let mut sender_addresses = Vec::new();
    let mut sender_host = default_host;
    let block = r.read_bytes(size.saturating_sub(1))?;
    read_address_list(&mut Reader::new(block), &mut sender_addresses, &mut sender_host);

    let mut peers = Vec::new();
    while r.available() > 4 {
        let marker = r.read_u8()?;
        if marker != report_marker::END {
            error!(marker, "unexpected marker in report entry, expected 00");
            break;
        }
        let size = r.read_u8()? as usize;
        let mut current: Option<(PeerId, [u8; RAW_ID_SIZE])> = None;
        if size == RAW_ID_SIZE {
            let raw: [u8; RAW_ID_SIZE] = r.read_bytes(size)?.try_into().unwrap();
            if raw[..2] != RAW_ID_PREFIX {
                error!("unexpected parameter in report, expected peer id");
                break;
            }
            if let Some(peer_id) = PeerId::from_raw(&raw) {
                current = Some((peer_id, raw));
            }
        } else if size > 7 {
            // Address block without a peer id: skip it.
            r.skip(size);
        } else {
            trace!("empty report parameter");
        }

        let elapsed_secs = r.read_varint()?;
        let size = r.read_u8()? as usize;

        if size >= 8 && r.peek_u8() == Some(report_marker::HOST) {
            if let Some((peer_id, raw_id)) = current {
                let block = &r.read_bytes(size)?[1..];
                let mut addresses = Vec::new();
                let mut host_address = default_host;
                if read_address_list(&mut Reader::new(block), &mut addresses, &mut host_address) {
                    peers.push(ReportPeer {
                        peer_id,
                        raw_id,
                        elapsed_secs,
                        addresses,
                        host_address,
                    });
                }
            } else {
                r.skip(size);
            }
        } else {
            r.skip(size);
        }
    }

    Ok(ParsedReport {
        own_address,
        sender_host,
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn server() -> SocketAddr {
        v4("198.51.100.1:1935")
    }

    #[test]
    fn test_report_round_trip() {
        // One best entry heard 12.5s ago: the elapsed varint carries 12.
        let peer = PeerId::new([0xA1; 32]);
        let entry = ReportEntry {
            raw_id: peer.raw(),
            elapsed_secs: 12,
            host_address: server(),
            addresses: vec![(v4("203.0.113.9:1935"), AddressType::Public)],
        };
        let buf = write_group_report(v4("192.0.2.5:1935"), server(), &[entry]);
        assert_eq!(buf[0], message_type::GROUP_REPORT);

        let parsed = read_group_report(&buf[1..], server()).unwrap();
        assert_eq!(parsed.own_address, v4("192.0.2.5:1935"));
        assert_eq!(parsed.sender_host, server());
        assert_eq!(parsed.peers.len(), 1);

        let p = &parsed.peers[0];
        assert_eq!(p.peer_id, peer);
        assert_eq!(p.elapsed_secs, 12);
        assert_eq!(p.host_address, server());
        assert_eq!(p.addresses, vec![(v4("203.0.113.9:1935"), AddressType::Public)]);
    }

    #[test]
    fn test_host_defaults_to_ours_when_absent() {
        // Hand-built entry block with only a public address: the parsed
        // host falls back to the receiver's own server.
        let peer = PeerId::new([0xB2; 32]);
        let mut buf = Vec::new();
        buf.push((host_size(&v4("192.0.2.5:1935")) + 4) as u8);
        buf.push(report_marker::SELF_ADDRESS);
        address::write_address(&mut buf, v4("192.0.2.5:1935"), AddressType::Public);
        buf.push((host_size(&server()) + 4) as u8);
        buf.push(report_marker::HOST);
        address::write_address(&mut buf, server(), AddressType::Redirection);
        buf.push(report_marker::END);

        buf.push(0x22);
        buf.extend_from_slice(&peer.raw());
        wire::write_varint(&mut buf, 3);
        let mut block = vec![report_marker::HOST];
        address::write_address(&mut block, v4("203.0.113.9:1935"), AddressType::Public);
        buf.push(block.len() as u8);
        buf.extend_from_slice(&block);
        buf.push(report_marker::END);

        let fallback = v4("198.51.100.99:1935");
        let parsed = read_group_report(&buf, fallback).unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].host_address, fallback);
    }

    #[test]
    fn test_local_addresses_not_gossiped() {
        let peer = PeerId::new([0xC3; 32]);
        let entry = ReportEntry {
            raw_id: peer.raw(),
            elapsed_secs: 0,
            host_address: server(),
            addresses: vec![
                (v4("10.0.0.1:1935"), AddressType::Local),
                (v4("203.0.113.9:1935"), AddressType::Public),
            ],
        };
        let buf = write_group_report(v4("192.0.2.5:1935"), server(), &[entry]);
        let parsed = read_group_report(&buf[1..], server()).unwrap();
        assert_eq!(
            parsed.peers[0].addresses,
            vec![(v4("203.0.113.9:1935"), AddressType::Public)]
        );
    }

    #[test]
    fn test_header_marker_mismatch_aborts() {
        let buf = write_group_report(v4("192.0.2.5:1935"), server(), &[]);
        let mut broken = buf[1..].to_vec();
        broken[1] = 0x0B; // corrupt the 0D marker
        assert!(matches!(
            read_group_report(&broken, server()),
            Err(ReportError::UnexpectedMarker { expected: 0x0D, .. })
        ));
    }

    #[test]
    fn test_entry_marker_mismatch_keeps_collected_peers() {
        let a = PeerId::new([0xA1; 32]);
        let b = PeerId::new([0xB2; 32]);
        let entries: Vec<ReportEntry> = [a, b]
            .iter()
            .map(|p| ReportEntry {
                raw_id: p.raw(),
                elapsed_secs: 1,
                host_address: server(),
                addresses: vec![(v4("203.0.113.9:1935"), AddressType::Public)],
            })
            .collect();
        let buf = write_group_report(v4("192.0.2.5:1935"), server(), &entries);

        // Corrupt the terminator between the two entries.
        let entry_size = 1 + RAW_ID_SIZE + 1 + 1 + entries[1].addresses_size() + 1;
        let mut broken = buf[1..].to_vec();
        let second_start = broken.len() - entry_size;
        broken[second_start - 1] = 0x55;

        let parsed = read_group_report(&broken, server()).unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].peer_id, a);
    }

    #[test]
    fn test_empty_report_has_no_peers() {
        let buf = write_group_report(v4("192.0.2.5:1935"), server(), &[]);
        let parsed = read_group_report(&buf[1..], server()).unwrap();
        assert!(parsed.peers.is_empty());
    }
}
