//! Address book of peers the gossip has made known.
//!
//! Two mirrored indices: peer id to node, and group address to peer id
//! (the distance ring). Every mutation touches both sides.

use crate::address::{host_size, AddressType};
use crate::consts::RAW_ID_SIZE;
use crate::peer_id::{GroupAddress, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A peer known through gossip or direct connection.
pub struct HeardNode {
    pub raw_id: [u8; RAW_ID_SIZE],
    pub group_address: GroupAddress,
    pub addresses: Vec<(SocketAddr, AddressType)>,
    pub host_address: SocketAddr,
    /// When the last group report from this peer arrived.
    pub last_group_report: Instant,
}

impl HeardNode {
    /// Size of this node's address block inside a group report: the host
    /// record (0A marker, type, port, host) plus every non-local address
    /// (type, port, host).
    pub fn addresses_size(&self) -> usize {
        let mut size = host_size(&self.host_address) + 4;
        for (addr, typ) in &self.addresses {
            if *typ != AddressType::Local {
                size += host_size(addr) + 3;
            }
        }
        size
    }
}

/// The heard list and its distance ring.
pub struct HeardList {
    nodes: HashMap<PeerId, HeardNode>,
    ring: BTreeMap<GroupAddress, PeerId>,
}

impl HeardList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            ring: BTreeMap::new(),
        }
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no peer is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when `peer_id` is known.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.nodes.contains_key(peer_id)
    }

    /// Looks up one node.
    pub fn get(&self, peer_id: &PeerId) -> Option<&HeardNode> {
        self.nodes.get(peer_id)
    }

    /// The distance ring: group address to peer id, in ring order.
    pub fn ring(&self) -> &BTreeMap<GroupAddress, PeerId> {
        &self.ring
    }

    /// Records a peer heard `elapsed` ago. Idempotent: a second insert for
    /// the same peer id changes nothing. Returns true when the peer was
    /// new.
    pub fn insert(
        &mut self,
        peer_id: PeerId,
        raw_id: [u8; RAW_ID_SIZE],
        addresses: Vec<(SocketAddr, AddressType)>,
        host_address: SocketAddr,
        elapsed: Duration,
        now: Instant,
    ) -> bool {
        if self.nodes.contains_key(&peer_id) {
            debug!(peer = %peer_id.short_hex(), "peer is already known");
            return false;
        }
        let group_address = GroupAddress::from_raw_id(&raw_id);
        self.ring.insert(group_address, peer_id);
        self.nodes.insert(
            peer_id,
            HeardNode {
                raw_id,
                group_address,
                addresses,
                host_address,
                last_group_report: now.checked_sub(elapsed).unwrap_or(now),
            },
        );
        debug!(peer = %peer_id.short_hex(), "peer added to heard list");
        true
    }

    /// Refreshes the last-report time of a peer.
    pub fn touch(&mut self, peer_id: &PeerId, now: Instant) {
        if let Some(node) = self.nodes.get_mut(peer_id) {
            node.last_group_report = now;
        }
    }

    /// Removes a peer from both indices.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<HeardNode> {
        let node = self.nodes.remove(peer_id)?;
        if self.ring.remove(&node.group_address).is_none() {
            warn!(peer = %peer_id.short_hex(), "peer missing from the distance ring");
        }
        Some(node)
    }

    /// Evicts peers unheard for more than `timeout` and not currently
    /// connected. Returns the evicted ids.
    pub fn reap<F>(&mut self, now: Instant, timeout: Duration, is_connected: F) -> Vec<PeerId>
    where
        F: Fn(&PeerId) -> bool,
    {
        let expired: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(pid, node)| {
                !is_connected(pid) && now.duration_since(node.last_group_report) > timeout
            })
            .map(|(pid, _)| *pid)
            .collect();
        for pid in &expired {
            debug!(peer = %pid.short_hex(), "peer timeout, deleting from the heard list");
            self.remove(pid);
        }
        expired
    }
}

impl Default for HeardList {
    fn default() -> Self {
        Self::new()
    }
}
