//! Target neighbor-set selection over the distance ring.
//!
//! The ring is the sorted set of group addresses; all walks are modular.
//! The best list combines four sources: the six ring neighbors around our
//! own address, up to six lowest-latency connected peers, one random ring
//! entry, and logarithmically spaced probes up to the target count.

use crate::consts::MAX_PEER_COUNT;
use crate::peer_id::{GroupAddress, PeerId};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Estimates the total group size from the local ring density.
///
/// With fewer than 4 known addresses the count itself is returned.
/// Otherwise the distance between the ring neighbors two before and two
/// after `my_address` covers roughly four peers; the total is the ring
/// capacity divided by a quarter of that span.
pub fn estimated_peers_count(ring: &BTreeMap<GroupAddress, PeerId>, my_address: &GroupAddress) -> f64 {
    let n = ring.len();
    if n < 4 {
        return n as f64;
    }

    let keys: Vec<&GroupAddress> = ring.keys().collect();
    let idx = keys.partition_point(|k| *k < my_address);
    let (first, last) = if idx == n {
        (n - 2, 1)
    } else if *keys[idx] > *my_address {
        ((idx + n - 2) % n, (idx + 1) % n)
    } else {
        // Our own address sits on the ring.
        ((idx + n - 1) % n, (idx + 2) % n)
    };

    let v_first = keys[first].prefix64();
    let v_last = keys[last].prefix64();
    let span = v_last.wrapping_sub(v_first) as f64;
    MAX_PEER_COUNT / (span / 4.0) + 1.0
}

/// Target neighbor count: `2 * log2(estimate) + 13`.
///
/// An empty ring estimates 0 peers; the cast saturates the negative
/// logarithm to zero, leaving the floor of 13.
pub fn target_neighbors_count(ring: &BTreeMap<GroupAddress, PeerId>, my_address: &GroupAddress) -> u32 {
    let estimate = estimated_peers_count(ring, my_address);
    (2.0 * estimate.log2()) as u32 + 13
}

/// The six contiguous ring entries starting two before `my_address`,
/// wrap-safe. With six entries or fewer, every peer qualifies.
pub fn ring_neighborhood(
    ring: &BTreeMap<GroupAddress, PeerId>,
    my_address: &GroupAddress,
) -> Vec<PeerId> {
    let n = ring.len();
    if n <= 6 {
        return ring.values().copied().collect();
    }
    let peers: Vec<&PeerId> = ring.values().collect();
    let keys: Vec<&GroupAddress> = ring.keys().collect();

    let idx = keys.partition_point(|k| *k < my_address);
    let start = if idx == n { n - 1 } else { idx };
    let mut i = (start + n - 2) % n;

    let mut out = Vec::with_capacity(6);
    for _ in 0..6 {
        out.push(*peers[i]);
        i = (i + 1) % n;
    }
    out
}

/// Builds the best list for `my_address` given the ring and the currently
/// connected peers with their latencies.
pub fn build_best_list(
    my_address: &GroupAddress,
    ring: &BTreeMap<GroupAddress, PeerId>,
    connected: &[(PeerId, u64)],
) -> BTreeSet<PeerId> {
    let mut best: BTreeSet<PeerId> = BTreeSet::new();
    let n = ring.len();

    // The six closest ring positions; with six or fewer, that is everyone
    // and the remaining steps are skipped.
    for pid in ring_neighborhood(ring, my_address) {
        best.insert(pid);
    }
    if n <= 6 {
        return best;
    }

    // Up to six lowest-latency connected peers.
    if !connected.is_empty() {
        let mut by_latency = connected.to_vec();
        by_latency.sort_by_key(|(_, latency)| *latency);
        let mut added = 0;
        for (pid, _) in by_latency {
            if best.insert(pid) {
                added += 1;
                if added >= 6 {
                    break;
                }
            }
        }
    }

    // One random ring entry not yet selected.
    let outsiders: Vec<PeerId> = ring
        .values()
        .filter(|pid| !best.contains(pid))
        .copied()
        .collect();
    if !outsiders.is_empty() {
        let pick = rand::thread_rng().gen_range(0..outsiders.len());
        best.insert(outsiders[pick]);
    }

    // Probes spaced by (ring/2 - 1) / (2 * count) up to the target count.
    let bests = best.len();
    let target = target_neighbors_count(ring, my_address) as usize;
    if n > bests && target > bests {
        let count = (target - bests).min(n - bests);
        let peers: Vec<&PeerId> = ring.values().collect();
        let keys: Vec<&GroupAddress> = ring.keys().collect();
        let mut i = keys.partition_point(|k| *k < my_address);

        let rest = n / 2 - 1;
        let step = rest / (2 * count);
        for _ in 0..count {
            if n - i <= step {
                i = 0;
            }
            i += step;
            while !best.insert(*peers[i]) {
                i += 1;
                if i == n {
                    i = 0;
                }
            }
        }
    }

    best
}
