//! Protocol constants and maintenance timers.
//!
//! Timer defaults follow the values observed in Flash NetGroup traffic;
//! all of them are overridable through [`crate::group::NetGroupConfig`].

use std::time::Duration;

/// Size of a peer id in bytes (without the raw-form prefix).
pub const PEER_ID_SIZE: usize = 32;

/// Raw peer ids and publisher stream keys carry a 2-byte prefix.
pub const RAW_ID_SIZE: usize = PEER_ID_SIZE + 2;

/// Prefix of a raw peer id on the wire.
pub const RAW_ID_PREFIX: [u8; 2] = [0x21, 0x0F];

/// Prefix of a publisher-generated stream key.
pub const STREAM_KEY_PREFIX: [u8; 2] = [0x21, 0x01];

/// Ring capacity used by the peers-count estimate: 2^64 as a double.
pub const MAX_PEER_COUNT: f64 = 18_446_744_073_709_551_616.0;

/// Message type bytes used on group and handshake flows.
pub mod message_type {
    /// Group init ack, sent before the first GroupBegin.
    pub const GROUP_INIT: u8 = 0x02;
    /// Keepalive frame on an established connection.
    pub const KEEPALIVE: u8 = 0x09;
    /// Group report (peer-address gossip).
    pub const GROUP_REPORT: u8 = 0x0A;
    /// Ask-close request from a peer that no longer wants us.
    pub const GROUP_ASK_CLOSE: u8 = 0x0C;
    /// Group begin ack.
    pub const GROUP_BEGIN: u8 = 0x0E;
    /// AMF invoke relayed between subscribers.
    pub const GROUP_INVOKE: u8 = 0x11;
    /// Media fragment on a media flow.
    pub const GROUP_FRAGMENT: u8 = 0x20;
    /// Group media subscription metadata (stream name + key + parameters).
    pub const GROUP_MEDIA_INFOS: u8 = 0x21;
    /// Fragment availability map.
    pub const GROUP_FRAGMENTS_MAP: u8 = 0x22;
    /// Push-mode mask update from a subscriber.
    pub const GROUP_PLAY_PUSH: u8 = 0x23;
    /// Pull request for one missing fragment.
    pub const GROUP_PLAY_PULL: u8 = 0x2B;
    /// Client-to-server P2P introduction request.
    pub const HANDSHAKE_30: u8 = 0x30;
    /// Writer exception (flow close) notification.
    pub const WRITER_EXCEPTION: u8 = 0x5E;
    /// Server-to-client P2P response (far key + cookie).
    pub const HANDSHAKE_70: u8 = 0x70;
    /// Server-to-client address list for a pending introduction.
    pub const HANDSHAKE_71: u8 = 0x71;
}

/// Markers inside a group report message.
pub mod report_marker {
    /// Terminates an address record or a peer entry.
    pub const END: u8 = 0x00;
    /// Host (redirection) address record.
    pub const HOST: u8 = 0x0A;
    /// The recipient's own address as the sender sees it.
    pub const SELF_ADDRESS: u8 = 0x0D;
}

/// Delay between two best-list recomputations.
pub const BEST_LIST_DELAY: Duration = Duration::from_secs(2);

/// Delay between two spontaneous group reports.
pub const REPORT_DELAY: Duration = Duration::from_secs(10);

/// A heard peer silent for longer than this (and not connected) is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(90);

/// Minimum delay between two ask-to-disconnect requests to the same peer.
pub const DISCONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Idle time after which a connection emits a keepalive frame.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// A connection that received nothing for this long is marked failed.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Base spacing of P2P introduction retries; attempt n waits n times this.
pub const P2P_RETRY_SPACING: Duration = Duration::from_millis(1500);

/// An introduction is dropped after this many unanswered handshake 30.
pub const P2P_MAX_ATTEMPTS: u32 = 11;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_values() {
        assert_eq!(BEST_LIST_DELAY.as_secs(), 2);
        assert_eq!(REPORT_DELAY.as_secs(), 10);
        assert_eq!(PEER_TIMEOUT.as_secs(), 90);
        assert_eq!(P2P_RETRY_SPACING.as_millis(), 1500);
        assert_eq!(P2P_MAX_ATTEMPTS, 11);
    }

    #[test]
    fn test_max_peer_count_is_2_pow_64() {
        assert_eq!(MAX_PEER_COUNT, (u64::MAX as f64) + 1.0);
    }
}
