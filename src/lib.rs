//! rtmfpmesh - RTMFP NetGroup overlay engine.
//!
//! This crate provides:
//! - `socket`: shared UDP handler demultiplexing datagrams to per-address
//!   connections, with P2P introduction tracking
//! - `connection` / `peer_session`: the per-peer session substrate
//! - `group`: the NetGroup overlay (heard list, distance ring, best-list
//!   neighbor selection, group-report gossip, group-media fan-out)
//!
//! # Example
//!
//! ```rust,ignore
//! use rtmfpmesh::{NetGroup, NetGroupConfig, SessionApi};
//!
//! // The embedding layer implements SessionApi (rendezvous connection,
//! // media sink) and hands it to the controller.
//! let group = NetGroup::new("g1", "G/1", "livestream", NetGroupConfig {
//!     is_publisher: true,
//!     ..NetGroupConfig::default()
//! }, api);
//!
//! // A timer thread drives the overlay.
//! group.manage(std::time::Instant::now());
//! ```

pub mod address;
pub mod connection;
pub mod consts;
pub mod events;
pub mod group;
pub mod peer_id;
pub mod peer_session;
pub mod socket;
pub mod wire;

// Re-export commonly used types at crate root for convenience
pub use peer_id::{GroupAddress, PeerId};

pub use address::{read_address, read_address_list, write_address, AddressError, AddressType};

pub use connection::{PacketSink, Role, RtmfpConnection, RtmfpWriter, WriterError};

pub use socket::{
    Handshake30, Handshake70, P2pAddresses, SocketEvents, SocketMux, Tag, WaitingPeer,
};

pub use peer_session::{
    Command, CommandKind, GroupReportEvent, NewMediaEvent, PeerSession, PeerSessionEvents,
    SessionStatus, StatusCell,
};

pub use group::{
    best::{build_best_list, estimated_peers_count, ring_neighborhood, target_neighbors_count},
    heard::{HeardList, HeardNode},
    media::{
        read_group_config, write_group_config, GroupConfig, GroupListener, GroupMedia,
        MediaFragment, MediaPacket, PeerMedia, StreamKey,
    },
    report::{read_group_report, write_group_report, ParsedReport, ReportEntry, ReportError},
    NetGroup, NetGroupConfig, SessionApi,
};

pub use consts::{
    BEST_LIST_DELAY, PEER_ID_SIZE, PEER_TIMEOUT, RAW_ID_PREFIX, RAW_ID_SIZE, REPORT_DELAY,
};
