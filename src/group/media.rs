//! Per-stream-key media fan-out.
//!
//! A `GroupMedia` tracks one stream key: its subscription parameters, the
//! fragment window, and the set of peers attached through `PeerMedia`
//! handles. `PeerMedia` is owned by the peer session; the group media only
//! keeps weak handles.

use crate::connection::{RtmfpWriter, WriterError};
use crate::consts::{message_type, STREAM_KEY_PREFIX};
use crate::events::{Event, SubscriptionId};
use crate::peer_id::PeerId;
use crate::wire::{self, Reader};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Publisher-chosen identifier of one stream inside the group.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey(Vec<u8>);

impl StreamKey {
    /// Wraps raw key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generates a publisher key: `21 01` + 32 random bytes.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 34];
        bytes[..2].copy_from_slice(&STREAM_KEY_PREFIX);
        rand::thread_rng().fill_bytes(&mut bytes[2..]);
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for keys carrying the publisher prefix.
    pub fn is_publisher_key(&self) -> bool {
        self.0.len() == 34 && self.0[..2] == STREAM_KEY_PREFIX
    }

    /// Stable media-flow id derived from the key prefix.
    pub fn flow_id(&self) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in self.0.iter().skip(2).take(8).enumerate() {
            bytes[i] = *b;
        }
        u64::from_be_bytes(bytes)
    }

    /// First 8 hex chars, for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({}...)", self.short_hex())
    }
}

/// GroupConfig TLV parameter ids.
pub mod config_id {
    pub const UNKNOWN: u8 = 2;
    pub const WINDOW_DURATION: u8 = 3;
    pub const OBJECT_ENCODING: u8 = 4;
    pub const UPDATE_PERIOD: u8 = 5;
    pub const SEND_TO_ALL: u8 = 6;
    pub const FETCH_PERIOD: u8 = 7;
}

/// Expected OBJECT_ENCODING value (AMF3).
const OBJECT_ENCODING_AMF3: u64 = 300_000;

/// Subscription parameters of a group media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// True when this node publishes the stream.
    pub is_publisher: bool,
    /// Fragment window length.
    pub window_duration_ms: u64,
    /// Fragments-map gossip period.
    pub availability_update_period_ms: u64,
    /// Push every fragment to every subscriber.
    pub availability_send_to_all: bool,
    /// Active fragment fetch interval.
    pub fetch_period_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            is_publisher: false,
            window_duration_ms: 8000,
            availability_update_period_ms: 100,
            availability_send_to_all: false,
            fetch_period_ms: 2500,
        }
    }
}

/// Parses a subscription parameter TLV into `config`.
///
/// Each entry is `<size><id><varint value>`; size 1 means id-only.
/// SEND_TO_ALL terminates the parse immediately, matching the historical
/// behavior peers rely on. `availability_send_to_all` is reset first.
pub fn read_group_config(config: &mut GroupConfig, r: &mut Reader<'_>) {
    config.availability_send_to_all = false;
    while r.available() > 0 {
        let size = match r.read_u8() {
            Ok(s) => s,
            Err(_) => return,
        };
        if size == 0 {
            continue;
        }
        let id = match r.read_u8() {
            Ok(i) => i,
            Err(_) => return,
        };
        let value = if size > 1 {
            match r.read_varint() {
                Ok(v) => v,
                Err(_) => return,
            }
        } else {
            0
        };
        match id {
            config_id::UNKNOWN => {}
            config_id::WINDOW_DURATION => {
                config.window_duration_ms = value;
                trace!(value, "window duration");
            }
            config_id::OBJECT_ENCODING => {
                if value != OBJECT_ENCODING_AMF3 {
                    error!(value, "unexpected object encoding value");
                }
            }
            config_id::UPDATE_PERIOD => {
                config.availability_update_period_ms = value;
                trace!(value, "availability update period");
            }
            config_id::SEND_TO_ALL => {
                config.availability_send_to_all = true;
                return;
            }
            config_id::FETCH_PERIOD => {
                config.fetch_period_ms = value;
                trace!(value, "fetch period");
            }
            _ => {}
        }
    }
}

/// Encodes the subscription parameter TLV.
pub fn write_group_config(buf: &mut Vec<u8>, config: &GroupConfig) {
    let mut entry = |id: u8, value: u64| {
        buf.push(1 + wire::varint_size(value) as u8);
        buf.push(id);
        wire::write_varint(buf, value);
    };
    entry(config_id::WINDOW_DURATION, config.window_duration_ms);
    entry(config_id::OBJECT_ENCODING, OBJECT_ENCODING_AMF3);
    entry(config_id::UPDATE_PERIOD, config.availability_update_period_ms);
    entry(config_id::FETCH_PERIOD, config.fetch_period_ms);
    if config.availability_send_to_all {
        buf.push(1);
        buf.push(config_id::SEND_TO_ALL);
    }
}

/// One media fragment on the wire.
#[derive(Debug, Clone)]
pub struct MediaFragment {
    pub id: u64,
    pub time: u32,
    pub audio: bool,
    pub payload: Vec<u8>,
    pub lost_rate: f64,
}

/// A reassembled packet handed to the application.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub time: u32,
    pub payload: Vec<u8>,
    pub lost_rate: f64,
    pub audio: bool,
}

/// Media attachment between one peer session and one group media.
pub struct PeerMedia {
    pub peer_id: PeerId,
    pub stream_key: StreamKey,
    writer: Arc<RtmfpWriter>,
    flow_id: u64,
    closed: AtomicBool,
    remote_latest: AtomicU64,
    push_mode: AtomicU64,
    /// Fragments received from this peer.
    pub on_fragment: Event<MediaFragment>,
    /// Pull requests received from this peer.
    pub on_pull: Event<u64>,
}

impl PeerMedia {
    /// Creates an attachment writing through `writer`.
    pub fn new(
        peer_id: PeerId,
        stream_key: StreamKey,
        writer: Arc<RtmfpWriter>,
        flow_id: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            stream_key,
            writer,
            flow_id,
            closed: AtomicBool::new(false),
            remote_latest: AtomicU64::new(0),
            push_mode: AtomicU64::new(0),
            on_fragment: Event::new(),
            on_pull: Event::new(),
        })
    }

    /// Latest fragment the peer advertised through its fragments map.
    pub fn remote_latest(&self) -> u64 {
        self.remote_latest.load(Ordering::SeqCst)
    }

    /// Records the peer's advertised fragment availability.
    pub fn set_remote_latest(&self, fragment_id: u64) {
        self.remote_latest.fetch_max(fragment_id, Ordering::SeqCst);
    }

    /// Push mask requested by the peer.
    pub fn push_mode(&self) -> u64 {
        self.push_mode.load(Ordering::SeqCst)
    }

    /// Updates the push mask requested by the peer.
    pub fn set_push_mode(&self, mask: u64) {
        self.push_mode.store(mask, Ordering::SeqCst);
    }

    /// Media-flow id used to route inbound fragments.
    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    /// True once closed by either owner.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the attachment and its writer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.writer.close();
    }

    /// Sends the group-media subscription metadata for this stream.
    pub fn send_group_media(
        &self,
        stream_name: &str,
        config: &GroupConfig,
    ) -> Result<(), WriterError> {
        let mut buf = Vec::new();
        buf.push(message_type::GROUP_MEDIA_INFOS);
        buf.push(stream_name.len() as u8);
        buf.extend_from_slice(stream_name.as_bytes());
        buf.push(self.stream_key.as_bytes().len() as u8);
        buf.extend_from_slice(self.stream_key.as_bytes());
        write_group_config(&mut buf, config);
        self.writer.send(&buf)
    }

    /// Sends one fragment to the peer.
    pub fn send_fragment(&self, fragment: &MediaFragment) -> Result<(), WriterError> {
        let mut buf = Vec::with_capacity(16 + fragment.payload.len());
        buf.push(message_type::GROUP_FRAGMENT);
        wire::write_varint(&mut buf, self.flow_id);
        wire::write_varint(&mut buf, fragment.id);
        buf.push(u8::from(fragment.audio));
        buf.extend_from_slice(&fragment.time.to_be_bytes());
        buf.extend_from_slice(&fragment.payload);
        self.writer.send(&buf)
    }

    /// Sends the fragments-map availability message.
    pub fn send_fragments_map(&self, latest_fragment: u64) -> Result<(), WriterError> {
        let mut buf = Vec::with_capacity(21);
        buf.push(message_type::GROUP_FRAGMENTS_MAP);
        wire::write_varint(&mut buf, self.flow_id);
        wire::write_varint(&mut buf, latest_fragment);
        self.writer.send(&buf)
    }

    /// Asks the peer for one missing fragment.
    pub fn send_pull(&self, fragment_id: u64) -> Result<(), WriterError> {
        let mut buf = Vec::with_capacity(21);
        buf.push(message_type::GROUP_PLAY_PULL);
        wire::write_varint(&mut buf, self.flow_id);
        wire::write_varint(&mut buf, fragment_id);
        self.writer.send(&buf)
    }

    /// Announces which fragments we want pushed spontaneously.
    pub fn send_push_mode(&self, mask: u64) -> Result<(), WriterError> {
        let mut buf = Vec::with_capacity(21);
        buf.push(message_type::GROUP_PLAY_PUSH);
        wire::write_varint(&mut buf, self.flow_id);
        wire::write_varint(&mut buf, mask);
        self.writer.send(&buf)
    }

    /// Sends an AMF0 invoke (function name + string arguments).
    pub fn send_invoke(&self, name: &str, args: &[&str]) -> Result<(), WriterError> {
        let mut buf = Vec::new();
        buf.push(message_type::GROUP_INVOKE);
        write_amf0_string(&mut buf, name);
        for arg in args {
            write_amf0_string(&mut buf, arg);
        }
        self.writer.send(&buf)
    }
}

/// AMF0 string marker + u16 length + bytes.
fn write_amf0_string(buf: &mut Vec<u8>, s: &str) {
    buf.push(0x02);
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct StoredFragment {
    received_at: Instant,
    fragment: MediaFragment,
}

struct PeerHandle {
    media: Weak<PeerMedia>,
    fragment_sub: SubscriptionId,
    pull_sub: SubscriptionId,
}

struct GroupMediaInner {
    fragments: BTreeMap<u64, StoredFragment>,
    peers: HashMap<PeerId, PeerHandle>,
    next_fragment_id: u64,
    last_availability: Option<Instant>,
    last_fetch: Option<Instant>,
}

/// Per-stream-key subscription fan-out.
pub struct GroupMedia {
    pub id: u64,
    pub stream_name: String,
    pub stream_key: StreamKey,
    config: RwLock<GroupConfig>,
    inner: Mutex<GroupMediaInner>,
    /// Reassembled packets, bridged to the application by the controller.
    pub on_packet: Event<MediaPacket>,
}

impl GroupMedia {
    /// Creates a group media for one stream key.
    pub fn new(id: u64, stream_name: &str, stream_key: StreamKey, config: GroupConfig) -> Arc<Self> {
        debug!(id, stream = stream_name, key = %stream_key.short_hex(), "creation of GroupMedia");
        Arc::new(Self {
            id,
            stream_name: stream_name.to_string(),
            stream_key,
            config: RwLock::new(config),
            inner: Mutex::new(GroupMediaInner {
                fragments: BTreeMap::new(),
                peers: HashMap::new(),
                next_fragment_id: 1,
                last_availability: None,
                last_fetch: None,
            }),
            on_packet: Event::new(),
        })
    }

    /// Current parameters.
    pub fn config(&self) -> GroupConfig {
        self.config.read().unwrap().clone()
    }

    /// True when this node publishes the stream.
    pub fn is_publisher(&self) -> bool {
        self.config.read().unwrap().is_publisher
    }

    /// Re-parses subscription parameters received from a peer.
    pub fn update_config(&self, params: &[u8]) {
        let mut config = self.config.write().unwrap();
        read_group_config(&mut config, &mut Reader::new(params));
    }

    /// True when at least one fragment sits in the window.
    pub fn has_fragments(&self) -> bool {
        !self.inner.lock().unwrap().fragments.is_empty()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .peers
            .values()
            .filter(|h| h.media.upgrade().is_some())
            .count()
    }

    /// Attaches a peer: wires its inbound fragments into the fan-out and
    /// answers its pull requests from the window.
    pub fn add_peer(self: &Arc<Self>, peer_id: PeerId, media: &Arc<PeerMedia>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.contains_key(&peer_id) {
            return;
        }
        let this = Arc::downgrade(self);
        let fragment_sub = media.on_fragment.subscribe(move |fragment| {
            if let Some(group) = this.upgrade() {
                group.handle_fragment(peer_id, fragment);
            }
        });
        let this = Arc::downgrade(self);
        let pull_sub = media.on_pull.subscribe(move |fragment_id| {
            if let Some(group) = this.upgrade() {
                group.handle_pull(&peer_id, *fragment_id);
            }
        });
        inner.peers.insert(
            peer_id,
            PeerHandle {
                media: Arc::downgrade(media),
                fragment_sub,
                pull_sub,
            },
        );
        debug!(id = self.id, peer = %peer_id.short_hex(), "peer attached to GroupMedia");
    }

    /// Detaches a peer.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let entry = self.inner.lock().unwrap().peers.remove(peer_id);
        if let Some(handle) = entry {
            if let Some(media) = handle.media.upgrade() {
                media.on_fragment.unsubscribe(handle.fragment_sub);
                media.on_pull.unsubscribe(handle.pull_sub);
            }
        }
    }

    /// Answers a pull request with the stored fragment, if still windowed.
    fn handle_pull(&self, peer_id: &PeerId, fragment_id: u64) {
        let (media, fragment) = {
            let inner = self.inner.lock().unwrap();
            let media = inner.peers.get(peer_id).and_then(|h| h.media.upgrade());
            let fragment = inner
                .fragments
                .get(&fragment_id)
                .map(|s| s.fragment.clone());
            (media, fragment)
        };
        if let (Some(media), Some(fragment)) = (media, fragment) {
            let _ = media.send_fragment(&fragment);
        }
    }

    /// Handles a fragment received from `from`: store, deliver, relay.
    pub fn handle_fragment(&self, from: PeerId, fragment: &MediaFragment) {
        let send_to_all = {
            let mut inner = self.inner.lock().unwrap();
            if inner.fragments.contains_key(&fragment.id) {
                return; // duplicate
            }
            inner.fragments.insert(
                fragment.id,
                StoredFragment {
                    received_at: Instant::now(),
                    fragment: fragment.clone(),
                },
            );
            inner.next_fragment_id = inner.next_fragment_id.max(fragment.id + 1);
            self.config.read().unwrap().availability_send_to_all
        };

        self.on_packet.raise(&MediaPacket {
            time: fragment.time,
            payload: fragment.payload.clone(),
            lost_rate: fragment.lost_rate,
            audio: fragment.audio,
        });

        if send_to_all {
            self.relay(fragment, Some(from));
        }
    }

    /// Publisher path: assigns a fragment id and pushes to every peer.
    pub fn publish(&self, time: u32, payload: &[u8], audio: bool) {
        let fragment = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_fragment_id;
            inner.next_fragment_id += 1;
            let fragment = MediaFragment {
                id,
                time,
                audio,
                payload: payload.to_vec(),
                lost_rate: 0.0,
            };
            inner.fragments.insert(
                id,
                StoredFragment {
                    received_at: Instant::now(),
                    fragment: fragment.clone(),
                },
            );
            fragment
        };
        self.relay(&fragment, None);
    }

    fn relay(&self, fragment: &MediaFragment, skip: Option<PeerId>) {
        let peers: Vec<Arc<PeerMedia>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .peers
                .iter()
                .filter(|(pid, _)| Some(**pid) != skip)
                .filter_map(|(_, h)| h.media.upgrade())
                .collect()
        };
        for media in peers {
            if media.is_closed() {
                continue;
            }
            if let Err(e) = media.send_fragment(fragment) {
                trace!(peer = %media.peer_id.short_hex(), error = %e, "fragment relay dropped");
            }
        }
    }

    /// Sends the subscription metadata to one attachment.
    pub fn send_group_media(&self, media: &Arc<PeerMedia>) {
        let config = self.config();
        if let Err(e) = media.send_group_media(&self.stream_name, &config) {
            debug!(peer = %media.peer_id.short_hex(), error = %e, "group media subscription dropped");
        }
    }

    /// Broadcasts an AMF call to every subscriber.
    pub fn call_function(&self, name: &str, args: &[&str]) {
        let peers: Vec<Arc<PeerMedia>> = {
            let inner = self.inner.lock().unwrap();
            inner.peers.values().filter_map(|h| h.media.upgrade()).collect()
        };
        for media in peers {
            let _ = media.send_invoke(name, args);
        }
    }

    /// Periodic pass: window pruning, dead handles, availability gossip
    /// and pull-based fetching of fragments peers advertised.
    pub fn manage(&self, now: Instant) {
        let config = self.config();
        let window = Duration::from_millis(config.window_duration_ms);
        let mut inner = self.inner.lock().unwrap();

        inner
            .fragments
            .retain(|_, stored| now.duration_since(stored.received_at) <= window);
        inner.peers.retain(|_, h| h.media.upgrade().is_some());

        let availability_due = match inner.last_availability {
            None => true,
            Some(at) => {
                now.duration_since(at) >= Duration::from_millis(config.availability_update_period_ms)
            }
        };
        let fetch_due = match inner.last_fetch {
            None => true,
            Some(at) => now.duration_since(at) >= Duration::from_millis(config.fetch_period_ms),
        };

        let latest = inner.fragments.keys().next_back().copied();
        let peers: Vec<Arc<PeerMedia>> =
            inner.peers.values().filter_map(|h| h.media.upgrade()).collect();
        if availability_due {
            inner.last_availability = Some(now);
        }
        if fetch_due {
            inner.last_fetch = Some(now);
        }
        drop(inner);

        if availability_due && !config.availability_send_to_all {
            if let Some(latest) = latest {
                for media in &peers {
                    let _ = media.send_fragments_map(latest);
                }
            }
        }

        // Ask one fragment ahead from each peer that advertised more than
        // we hold.
        if fetch_due && !config.is_publisher {
            let have = latest.unwrap_or(0);
            for media in &peers {
                if media.remote_latest() > have {
                    let _ = media.send_pull(have + 1);
                }
            }
        }
    }
}

/// Pipe from the local publishing source into the publisher group media.
pub struct GroupListener {
    pub id_txt: String,
    pub stream_name: String,
    /// Raised by the embedding layer for each local media packet.
    pub on_media: Event<MediaPacket>,
}

impl GroupListener {
    /// Creates a listener for one published stream.
    pub fn new(stream_name: &str, id_txt: &str) -> Arc<Self> {
        info!(stream = stream_name, "starting group listener");
        Arc::new(Self {
            id_txt: id_txt.to_string(),
            stream_name: stream_name.to_string(),
            on_media: Event::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Role, RtmfpConnection};
    use crossbeam_channel::unbounded;
    use std::net::SocketAddr;

    fn peer_media(
        key: &StreamKey,
    ) -> (
        Arc<PeerMedia>,
        crossbeam_channel::Receiver<(SocketAddr, Vec<u8>)>,
        Arc<RtmfpConnection>,
    ) {
        let (tx, rx) = unbounded();
        let conn =
            RtmfpConnection::new("203.0.113.4:1935".parse().unwrap(), Role::Initiator, true, tx);
        let writer = conn.new_writer(b"\x00GM", 0);
        let media = PeerMedia::new(PeerId::new([5u8; 32]), key.clone(), writer, key.flow_id());
        (media, rx, conn)
    }

    #[test]
    fn test_generated_key_shape() {
        let key = StreamKey::generate();
        assert_eq!(key.as_bytes().len(), 34);
        assert!(key.is_publisher_key());
        let other = StreamKey::generate();
        assert_ne!(key, other);
    }

    #[test]
    fn test_config_tlv_roundtrip() {
        let config = GroupConfig {
            is_publisher: false,
            window_duration_ms: 4000,
            availability_update_period_ms: 250,
            availability_send_to_all: false,
            fetch_period_ms: 1000,
        };
        let mut buf = Vec::new();
        write_group_config(&mut buf, &config);

        let mut parsed = GroupConfig::default();
        read_group_config(&mut parsed, &mut Reader::new(&buf));
        assert_eq!(parsed.window_duration_ms, 4000);
        assert_eq!(parsed.availability_update_period_ms, 250);
        assert_eq!(parsed.fetch_period_ms, 1000);
        assert!(!parsed.availability_send_to_all);
    }

    #[test]
    fn test_send_to_all_short_circuits_parse() {
        let mut buf = Vec::new();
        buf.push(1);
        buf.push(config_id::SEND_TO_ALL);
        // A window duration after SEND_TO_ALL must be ignored.
        buf.push(2);
        buf.push(config_id::WINDOW_DURATION);
        buf.push(42);

        let mut config = GroupConfig::default();
        let default_window = config.window_duration_ms;
        read_group_config(&mut config, &mut Reader::new(&buf));
        assert!(config.availability_send_to_all);
        assert_eq!(config.window_duration_ms, default_window);
    }

    #[test]
    fn test_send_to_all_reset_on_each_parse() {
        let mut config = GroupConfig {
            availability_send_to_all: true,
            ..GroupConfig::default()
        };
        read_group_config(&mut config, &mut Reader::new(&[]));
        assert!(!config.availability_send_to_all);
    }

    #[test]
    fn test_unknown_id_skipped() {
        let mut buf = Vec::new();
        buf.push(2);
        buf.push(0x7E); // unrecognized id
        buf.push(9);
        buf.push(2);
        buf.push(config_id::WINDOW_DURATION);
        buf.push(50);

        let mut config = GroupConfig::default();
        read_group_config(&mut config, &mut Reader::new(&buf));
        assert_eq!(config.window_duration_ms, 50);
    }

    #[test]
    fn test_fragment_fanout_and_dedup() {
        let key = StreamKey::generate();
        let group = GroupMedia::new(1, "live", key.clone(), GroupConfig::default());
        let (media, _rx, _conn) = peer_media(&key);
        group.add_peer(media.peer_id, &media);

        let packets = Arc::new(Mutex::new(Vec::new()));
        let p = packets.clone();
        group.on_packet.subscribe(move |pkt: &MediaPacket| {
            p.lock().unwrap().push(pkt.time);
        });

        let fragment = MediaFragment {
            id: 10,
            time: 1000,
            audio: false,
            payload: vec![1, 2, 3],
            lost_rate: 0.0,
        };
        media.on_fragment.raise(&fragment);
        media.on_fragment.raise(&fragment); // duplicate
        assert_eq!(packets.lock().unwrap().as_slice(), &[1000]);
        assert!(group.has_fragments());
    }

    #[test]
    fn test_window_pruning() {
        let key = StreamKey::generate();
        let config = GroupConfig {
            window_duration_ms: 1000,
            ..GroupConfig::default()
        };
        let group = GroupMedia::new(1, "live", key, config);
        group.handle_fragment(
            PeerId::new([5u8; 32]),
            &MediaFragment {
                id: 1,
                time: 0,
                audio: false,
                payload: vec![0],
                lost_rate: 0.0,
            },
        );
        assert!(group.has_fragments());
        group.manage(Instant::now() + Duration::from_secs(5));
        assert!(!group.has_fragments());
    }

    #[test]
    fn test_remove_peer_stops_fanout() {
        let key = StreamKey::generate();
        let group = GroupMedia::new(1, "live", key.clone(), GroupConfig::default());
        let (media, _rx, _conn) = peer_media(&key);
        group.add_peer(media.peer_id, &media);
        group.remove_peer(&media.peer_id);
        assert_eq!(group.subscriber_count(), 0);

        media.on_fragment.raise(&MediaFragment {
            id: 1,
            time: 0,
            audio: true,
            payload: vec![],
            lost_rate: 0.0,
        });
        assert!(!group.has_fragments());
    }

    #[test]
    fn test_pull_answered_from_window() {
        let key = StreamKey::generate();
        let group = GroupMedia::new(1, "live", key.clone(), GroupConfig::default());
        let (media, rx, _conn) = peer_media(&key);
        group.add_peer(media.peer_id, &media);

        group.handle_fragment(
            PeerId::new([9u8; 32]),
            &MediaFragment {
                id: 5,
                time: 100,
                audio: false,
                payload: vec![7],
                lost_rate: 0.0,
            },
        );
        media.on_pull.raise(&5);
        let (_, frame) = rx.try_recv().unwrap();
        assert_eq!(frame[0], message_type::GROUP_FRAGMENT);

        // An unknown fragment id yields nothing.
        media.on_pull.raise(&99);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fetch_pulls_advertised_fragments() {
        let key = StreamKey::generate();
        let group = GroupMedia::new(1, "live", key.clone(), GroupConfig::default());
        let (media, rx, _conn) = peer_media(&key);
        group.add_peer(media.peer_id, &media);

        media.set_remote_latest(10);
        group.manage(Instant::now());
        let frames: Vec<Vec<u8>> = rx.try_iter().map(|(_, p)| p).collect();
        assert!(frames
            .iter()
            .any(|f| f[0] == message_type::GROUP_PLAY_PULL));
    }

    #[test]
    fn test_subscription_metadata_frame() {
        let key = StreamKey::generate();
        let (media, rx, _conn) = peer_media(&key);
        media
            .send_group_media("live", &GroupConfig::default())
            .unwrap();
        let (_, frame) = rx.try_recv().unwrap();
        assert_eq!(frame[0], message_type::GROUP_MEDIA_INFOS);
        assert_eq!(frame[1] as usize, 4);
        assert_eq!(&frame[2..6], b"live");
        assert_eq!(frame[6] as usize, 34);
        assert_eq!(&frame[7..41], key.as_bytes());
    }
}
