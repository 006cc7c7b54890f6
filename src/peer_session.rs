//! One logical peer identity over one connection.
//!
//! A `PeerSession` decodes NetGroup messages arriving on its connection
//! and re-emits them as typed events the NetGroup controller consumes. It
//! owns the report/netstream writers and the per-stream PeerMedia
//! attachments.

use crate::connection::{PacketSink, Role, RtmfpConnection, RtmfpWriter, WriterError};
use crate::consts::{message_type, DISCONNECT_RETRY_DELAY, RAW_ID_SIZE};
use crate::events::{Event, Request};
use crate::group::media::{MediaFragment, PeerMedia, StreamKey};
use crate::peer_id::PeerId;
use crate::wire::{Reader, WireError};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Flow signatures used when answering a remote NetGroup flow.
pub mod flow_signature {
    /// Group report / control flow.
    pub const GROUP: &[u8] = b"\x00GC";
    /// Group media flow.
    pub const MEDIA: &[u8] = b"\x00GM";
    /// Direct NetStream flow between two peers.
    pub const NETSTREAM: &[u8] = b"\x00GN";
}

/// Session lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    /// Introduction or handshake not started.
    Connecting = 0,
    /// Handshake in progress.
    Handshaking = 1,
    /// Session established.
    Connected = 2,
    /// Close requested, draining.
    NearClosed = 3,
    /// Fully closed.
    Closed = 4,
    /// Failed; reaped by the socket layer.
    Failed = 5,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Handshaking,
            2 => SessionStatus::Connected,
            3 => SessionStatus::NearClosed,
            4 => SessionStatus::Closed,
            _ => SessionStatus::Failed,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Handshaking => write!(f, "handshaking"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::NearClosed => write!(f, "near-closed"),
            SessionStatus::Closed => write!(f, "closed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Shareable monotone status slot; regressions are ignored.
#[derive(Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    /// Creates a cell in `Connecting` state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionStatus::Connecting as u8)))
    }

    /// Current status.
    pub fn get(&self) -> SessionStatus {
        SessionStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Advances the status. A value lower than the current one is a no-op.
    pub fn set(&self, status: SessionStatus) -> SessionStatus {
        self.0.fetch_max(status as u8, Ordering::SeqCst);
        self.get()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Main-stream command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Play,
    Publish,
    NetGroup,
}

/// A queued main-stream command.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub stream_name: String,
    pub audio_reliable: bool,
    pub video_reliable: bool,
}

/// Group report received from the peer.
pub struct GroupReportEvent {
    pub peer_id: PeerId,
    pub payload: Vec<u8>,
    /// True on the first report from this peer; the controller answers it
    /// with the group-media subscriptions.
    pub send_media_subscription: bool,
}

/// A new media stream advertised by the peer.
pub struct NewMediaEvent {
    pub peer_id: PeerId,
    pub peer_media: Arc<PeerMedia>,
    pub stream_name: String,
    pub stream_key: StreamKey,
    pub params: Vec<u8>,
}

/// NetGroup-level events re-emitted by a peer session.
pub struct PeerSessionEvents {
    pub on_peer_group_report: Event<GroupReportEvent>,
    /// Return false to reject the stream (unsubscribes the media).
    pub on_new_media: Request<NewMediaEvent>,
    pub on_peer_group_begin: Event<PeerId>,
    pub on_peer_close: Event<PeerId>,
    /// Return true to accept the close request.
    pub on_peer_group_ask_close: Request<PeerId>,
}

struct SessionInner {
    connection: Option<Arc<RtmfpConnection>>,
    commands: VecDeque<Command>,
    report_writer: Option<Arc<RtmfpWriter>>,
    netstream_writer: Option<Arc<RtmfpWriter>>,
    last_writer: Option<Arc<RtmfpWriter>>,
    medias_by_stream_key: HashMap<StreamKey, Arc<PeerMedia>>,
    medias_by_writer_id: HashMap<u64, Arc<PeerMedia>>,
    medias_by_flow_id: HashMap<u64, Arc<PeerMedia>>,
    last_try_disconnect: Option<Instant>,
}

/// A direct P2P session with another peer.
pub struct PeerSession {
    pub peer_id: PeerId,
    raw_id: [u8; RAW_ID_SIZE],
    pub host_address: SocketAddr,
    role: Role,
    status: StatusCell,
    latency_ms: AtomicU64,
    inner: RwLock<SessionInner>,
    media_subscription_sent: AtomicBool,
    group_first_report_sent: AtomicBool,
    group_report_initiator: AtomicBool,
    group_begin_sent: AtomicBool,
    group_connect_sent: AtomicBool,
    writer_exceptions: AtomicU32,
    pub events: PeerSessionEvents,
}

/// Writer exceptions tolerated before the whole session is failed.
const MAX_WRITER_EXCEPTIONS: u32 = 3;

impl PeerSession {
    /// Creates a session for `peer_id` introduced through `host_address`.
    pub fn new(peer_id: PeerId, host_address: SocketAddr, role: Role) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            raw_id: peer_id.raw(),
            host_address,
            role,
            status: StatusCell::new(),
            latency_ms: AtomicU64::new(0),
            inner: RwLock::new(SessionInner {
                connection: None,
                commands: VecDeque::new(),
                report_writer: None,
                netstream_writer: None,
                last_writer: None,
                medias_by_stream_key: HashMap::new(),
                medias_by_writer_id: HashMap::new(),
                medias_by_flow_id: HashMap::new(),
                last_try_disconnect: None,
            }),
            media_subscription_sent: AtomicBool::new(false),
            group_first_report_sent: AtomicBool::new(false),
            group_report_initiator: AtomicBool::new(false),
            group_begin_sent: AtomicBool::new(false),
            group_connect_sent: AtomicBool::new(false),
            writer_exceptions: AtomicU32::new(0),
            events: PeerSessionEvents {
                on_peer_group_report: Event::new(),
                on_new_media: Request::new(),
                on_peer_group_begin: Event::new(),
                on_peer_close: Event::new(),
                on_peer_group_ask_close: Request::new(),
            },
        })
    }

    /// Raw 34-byte wire id.
    pub fn raw_id(&self) -> &[u8; RAW_ID_SIZE] {
        &self.raw_id
    }

    /// Our role on the session.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Shared status cell (given to the socket dispatch gate).
    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    /// Advances the status, logging the transition.
    pub fn set_status(&self, status: SessionStatus) {
        let before = self.status.get();
        let after = self.status.set(status);
        if after != before {
            debug!(peer = %self.peer_id.short_hex(), from = %before, to = %after, "session status");
        }
    }

    /// Measured round-trip latency in milliseconds.
    pub fn latency(&self) -> u64 {
        self.latency_ms.load(Ordering::SeqCst)
    }

    /// Updates the measured latency.
    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// True if we initiated the last group report exchange.
    pub fn group_report_initiator(&self) -> bool {
        self.group_report_initiator.load(Ordering::SeqCst)
    }

    /// Flags who initiated the last group report exchange.
    pub fn set_group_report_initiator(&self, initiator: bool) {
        self.group_report_initiator.store(initiator, Ordering::SeqCst);
    }

    /// True once the first group report towards this peer went out.
    pub fn group_first_report_sent(&self) -> bool {
        self.group_first_report_sent.load(Ordering::SeqCst)
    }

    /// Attaches the transport connection once the handshake completed.
    pub fn on_connection(self: &Arc<Self>, connection: Arc<RtmfpConnection>) {
        let sink: Arc<dyn PacketSink> = self.clone();
        let sink: Weak<dyn PacketSink> = Arc::downgrade(&sink);
        connection.set_sink(sink);
        self.inner.write().unwrap().connection = Some(connection);
        self.set_status(SessionStatus::Connected);
    }

    /// The attached connection, if any.
    pub fn connection(&self) -> Option<Arc<RtmfpConnection>> {
        self.inner.read().unwrap().connection.clone()
    }

    /// Remote address of the attached connection.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.connection().map(|c| c.address())
    }

    /// Queues a main-stream command.
    pub fn add_command(
        &self,
        kind: CommandKind,
        stream_name: &str,
        audio_reliable: bool,
        video_reliable: bool,
    ) {
        self.inner.write().unwrap().commands.push_back(Command {
            kind,
            stream_name: stream_name.to_string(),
            audio_reliable,
            video_reliable,
        });
    }

    /// Drains the queued commands.
    pub fn take_commands(&self) -> Vec<Command> {
        self.inner.write().unwrap().commands.drain(..).collect()
    }

    /// Broadcasts an AMF call to every attached media.
    /// Returns 0 on failure, 1 otherwise.
    pub fn call_function(&self, name: &str, args: &[&str]) -> u32 {
        let medias: Vec<Arc<PeerMedia>> = self
            .inner
            .read()
            .unwrap()
            .medias_by_stream_key
            .values()
            .cloned()
            .collect();
        if medias.is_empty() {
            return 0;
        }
        for media in medias {
            if let Err(e) = media.send_invoke(name, args) {
                debug!(peer = %self.peer_id.short_hex(), error = %e, "invoke dropped");
            }
        }
        1
    }

    /// Answers a remote flow carrying a NetGroup signature with the
    /// matching dedicated writer.
    pub fn create_special_flow(
        &self,
        flow_id: u64,
        signature: &[u8],
        writer_ref_id: u64,
    ) -> Option<Arc<RtmfpWriter>> {
        let conn = self.connection()?;
        let writer = conn.new_writer(signature, flow_id);
        let mut inner = self.inner.write().unwrap();
        match signature {
            flow_signature::GROUP => inner.report_writer = Some(writer.clone()),
            flow_signature::NETSTREAM => inner.netstream_writer = Some(writer.clone()),
            flow_signature::MEDIA => {
                // The media writer is bound to its PeerMedia on first use.
                if let Some(media) = inner.medias_by_writer_id.get(&writer_ref_id).cloned() {
                    inner.medias_by_flow_id.insert(flow_id, media);
                }
            }
            other => {
                warn!(peer = %self.peer_id.short_hex(), signature = ?other, "unknown special flow signature");
                return None;
            }
        }
        inner.last_writer = Some(writer.clone());
        Some(writer)
    }

    fn report_writer(&self) -> Option<Arc<RtmfpWriter>> {
        let mut inner = self.inner.write().unwrap();
        if inner.report_writer.is_none() {
            let conn = inner.connection.clone()?;
            let writer = conn.new_writer(flow_signature::GROUP, 0);
            inner.report_writer = Some(writer.clone());
            inner.last_writer = Some(writer);
        }
        inner.report_writer.clone()
    }

    /// Returns the media attachment for `stream_key`, creating it (and the
    /// report writer) on first call.
    pub fn get_peer_media(&self, stream_key: &StreamKey) -> Option<Arc<PeerMedia>> {
        if let Some(existing) = self
            .inner
            .read()
            .unwrap()
            .medias_by_stream_key
            .get(stream_key)
        {
            return Some(existing.clone());
        }
        self.report_writer()?;
        let conn = self.connection()?;
        let writer = conn.new_writer(flow_signature::MEDIA, 0);
        // Both sides derive the media-flow id from the stream key, so
        // inbound fragments route without flow negotiation.
        let flow_id = stream_key.flow_id();
        let media = PeerMedia::new(self.peer_id, stream_key.clone(), writer.clone(), flow_id);

        let mut inner = self.inner.write().unwrap();
        inner
            .medias_by_stream_key
            .insert(stream_key.clone(), media.clone());
        inner.medias_by_writer_id.insert(writer.id(), media.clone());
        inner.medias_by_flow_id.insert(flow_id, media.clone());
        inner.last_writer = Some(writer);
        Some(media)
    }

    /// Sends a prebuilt group report (message 0A).
    pub fn send_group_report(&self, data: &[u8]) {
        let writer = match self.report_writer() {
            Some(w) => w,
            None => {
                warn!(peer = %self.peer_id.short_hex(), "no connection to send group report");
                return;
            }
        };
        if let Err(e) = writer.send(data) {
            self.handle_writer_exception(writer.id(), e);
            return;
        }
        self.group_first_report_sent.store(true, Ordering::SeqCst);
    }

    /// Sends the group begin pair (02 + 0E). Returns false when already
    /// sent.
    pub fn send_group_begin(&self) -> bool {
        if self.group_begin_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(writer) = self.report_writer() {
            let _ = writer.send(&[message_type::GROUP_INIT]);
            let _ = writer.send(&[message_type::GROUP_BEGIN]);
        }
        true
    }

    /// Sends the group peer-connect request once.
    pub fn send_group_peer_connect(&self, group_id: &[u8]) {
        if self.group_connect_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(writer) = self.report_writer() {
            let mut buf = Vec::with_capacity(1 + group_id.len());
            buf.push(message_type::GROUP_INIT);
            buf.extend_from_slice(group_id);
            let _ = writer.send(&buf);
        }
    }

    /// Asks the peer to drop us from its mesh, at most once per
    /// [`DISCONNECT_RETRY_DELAY`].
    pub fn ask_peer_to_disconnect(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            let now = Instant::now();
            if let Some(last) = inner.last_try_disconnect {
                if now.duration_since(last) < DISCONNECT_RETRY_DELAY {
                    return;
                }
            }
            inner.last_try_disconnect = Some(now);
        }
        debug!(peer = %self.peer_id.short_hex(), "asking peer to disconnect");
        if let Some(writer) = self.report_writer() {
            let _ = writer.send(&[message_type::GROUP_ASK_CLOSE]);
        }
    }

    /// Closes one media flow by stream key.
    pub fn close_peer_media(&self, stream_key: &StreamKey) {
        let media = self
            .inner
            .write()
            .unwrap()
            .medias_by_stream_key
            .remove(stream_key);
        if let Some(media) = media {
            let mut inner = self.inner.write().unwrap();
            inner.medias_by_writer_id.retain(|_, m| !Arc::ptr_eq(m, &media));
            inner.medias_by_flow_id.retain(|_, m| !Arc::ptr_eq(m, &media));
            drop(inner);
            media.close();
        }
    }

    /// Closes the group writers; keeps the transport unless `abrupt`.
    pub fn close_group(&self, abrupt: bool) {
        let mut inner = self.inner.write().unwrap();
        for media in inner.medias_by_stream_key.values() {
            media.close();
        }
        inner.medias_by_stream_key.clear();
        inner.medias_by_writer_id.clear();
        inner.medias_by_flow_id.clear();
        let conn = inner.connection.clone();
        if let (Some(conn), Some(writer)) = (&conn, inner.report_writer.take()) {
            conn.close_writer(writer.id());
        }
        if let (Some(conn), Some(writer)) = (&conn, inner.netstream_writer.take()) {
            conn.close_writer(writer.id());
        }
        inner.last_writer = None;
        drop(inner);

        if abrupt {
            if let Some(conn) = conn {
                conn.close();
            }
        }
    }

    /// Closes the session and notifies the controller.
    pub fn close(&self, abrupt: bool) {
        if self.status() >= SessionStatus::NearClosed {
            return;
        }
        self.set_status(SessionStatus::NearClosed);
        self.close_group(abrupt);
        self.events.on_peer_close.raise(&self.peer_id);
        if let Some(conn) = self.connection() {
            conn.clear_sink();
        }
        self.set_status(SessionStatus::Closed);
    }

    /// Routes a writer failure; repeated failures fail the session.
    pub fn handle_writer_exception(&self, writer_id: u64, error: WriterError) {
        debug!(peer = %self.peer_id.short_hex(), writer_id, %error, "writer exception");
        if let Some(conn) = self.connection() {
            conn.close_writer(writer_id);
        }
        let media = self
            .inner
            .write()
            .unwrap()
            .medias_by_writer_id
            .remove(&writer_id);
        if let Some(media) = media {
            let mut inner = self.inner.write().unwrap();
            inner
                .medias_by_stream_key
                .retain(|_, m| !Arc::ptr_eq(m, &media));
            inner.medias_by_flow_id.retain(|_, m| !Arc::ptr_eq(m, &media));
            drop(inner);
            media.close();
        }
        let count = self.writer_exceptions.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= MAX_WRITER_EXCEPTIONS {
            error!(peer = %self.peer_id.short_hex(), "too many writer exceptions, failing session");
            // The controller notices the status on its next manage pass.
            self.set_status(SessionStatus::Failed);
            if let Some(conn) = self.connection() {
                conn.set_failed();
            }
        }
    }

    fn media_by_flow(&self, flow_id: u64) -> Option<Arc<PeerMedia>> {
        self.inner
            .read()
            .unwrap()
            .medias_by_flow_id
            .get(&flow_id)
            .cloned()
    }

    fn handle_group_message(&self, msg_type: u8, r: &mut Reader<'_>) -> Result<(), WireError> {
        match msg_type {
            message_type::GROUP_REPORT => {
                let payload = r.read_bytes(r.available())?.to_vec();
                let first = !self.media_subscription_sent.swap(true, Ordering::SeqCst);
                self.events.on_peer_group_report.raise(&GroupReportEvent {
                    peer_id: self.peer_id,
                    payload,
                    send_media_subscription: first,
                });
            }
            message_type::GROUP_BEGIN => {
                self.events.on_peer_group_begin.raise(&self.peer_id);
            }
            message_type::GROUP_MEDIA_INFOS => {
                let name_len = r.read_u8()? as usize;
                let name = String::from_utf8_lossy(r.read_bytes(name_len)?).into_owned();
                let key_len = r.read_u8()? as usize;
                let stream_key = StreamKey::new(r.read_bytes(key_len)?.to_vec());
                let params = r.read_bytes(r.available())?.to_vec();

                let media = match self.get_peer_media(&stream_key) {
                    Some(m) => m,
                    None => return Ok(()),
                };
                let accepted = self.events.on_new_media.raise(
                    &NewMediaEvent {
                        peer_id: self.peer_id,
                        peer_media: media,
                        stream_name: name,
                        stream_key: stream_key.clone(),
                        params,
                    },
                    false,
                );
                if !accepted {
                    self.close_peer_media(&stream_key);
                }
            }
            message_type::GROUP_FRAGMENT => {
                let flow_id = r.read_varint()?;
                let fragment_id = r.read_varint()?;
                let audio = r.read_u8()? != 0;
                let time = u32::from_be_bytes(r.read_bytes(4)?.try_into().unwrap());
                let payload = r.read_bytes(r.available())?.to_vec();

                match self.media_by_flow(flow_id) {
                    Some(media) => media.on_fragment.raise(&MediaFragment {
                        id: fragment_id,
                        time,
                        audio,
                        payload,
                        lost_rate: 0.0,
                    }),
                    None => trace!(peer = %self.peer_id.short_hex(), flow_id, "fragment for unknown flow"),
                }
            }
            message_type::GROUP_FRAGMENTS_MAP => {
                let flow_id = r.read_varint()?;
                let latest = r.read_varint()?;
                if let Some(media) = self.media_by_flow(flow_id) {
                    media.set_remote_latest(latest);
                }
            }
            message_type::GROUP_PLAY_PUSH => {
                let flow_id = r.read_varint()?;
                let mask = r.read_varint()?;
                if let Some(media) = self.media_by_flow(flow_id) {
                    media.set_push_mode(mask);
                }
            }
            message_type::GROUP_PLAY_PULL => {
                let flow_id = r.read_varint()?;
                let fragment_id = r.read_varint()?;
                if let Some(media) = self.media_by_flow(flow_id) {
                    media.on_pull.raise(&fragment_id);
                }
            }
            message_type::GROUP_ASK_CLOSE => {
                let accept = self
                    .events
                    .on_peer_group_ask_close
                    .raise(&self.peer_id, true);
                if accept {
                    debug!(peer = %self.peer_id.short_hex(), "accepting peer close request");
                    self.close(false);
                }
            }
            message_type::WRITER_EXCEPTION => {
                let writer_id = r.read_varint()?;
                self.handle_writer_exception(writer_id, WriterError::Closed);
            }
            other => {
                trace!(peer = %self.peer_id.short_hex(), msg_type = other, "ignoring group message");
            }
        }
        Ok(())
    }
}

impl PacketSink for PeerSession {
    fn on_packet(&self, _conn: &Arc<RtmfpConnection>, payload: &[u8]) {
        if self.status() >= SessionStatus::NearClosed {
            return;
        }
        let mut r = Reader::new(payload);
        let msg_type = match r.read_u8() {
            Ok(t) => t,
            Err(_) => return,
        };
        if let Err(e) = self.handle_group_message(msg_type, &mut r) {
            debug!(peer = %self.peer_id.short_hex(), error = %e, "malformed group message, dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn session() -> Arc<PeerSession> {
        PeerSession::new(
            PeerId::new([3u8; 32]),
            "198.51.100.1:1935".parse().unwrap(),
            Role::Initiator,
        )
    }

    fn connect(session: &Arc<PeerSession>) -> crossbeam_channel::Receiver<(SocketAddr, Vec<u8>)> {
        let (tx, rx) = unbounded();
        let conn = RtmfpConnection::new("203.0.113.4:1935".parse().unwrap(), Role::Initiator, true, tx);
        session.on_connection(conn);
        rx
    }

    #[test]
    fn test_status_is_monotone() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), SessionStatus::Connecting);
        cell.set(SessionStatus::Connected);
        assert_eq!(cell.get(), SessionStatus::Connected);
        cell.set(SessionStatus::Handshaking);
        assert_eq!(cell.get(), SessionStatus::Connected);
        cell.set(SessionStatus::Closed);
        assert_eq!(cell.get(), SessionStatus::Closed);
    }

    #[test]
    fn test_send_group_begin_is_idempotent() {
        let s = session();
        let rx = connect(&s);
        assert!(s.send_group_begin());
        assert!(!s.send_group_begin());

        let frames: Vec<Vec<u8>> = rx.try_iter().map(|(_, p)| p).collect();
        assert_eq!(
            frames,
            vec![
                vec![message_type::GROUP_INIT],
                vec![message_type::GROUP_BEGIN]
            ]
        );
    }

    #[test]
    fn test_group_peer_connect_sent_once() {
        let s = session();
        let rx = connect(&s);
        s.send_group_peer_connect(b"gid");
        s.send_group_peer_connect(b"gid");
        let frames: Vec<Vec<u8>> = rx.try_iter().map(|(_, p)| p).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], message_type::GROUP_INIT);
        assert_eq!(&frames[0][1..], b"gid");
    }

    #[test]
    fn test_ask_disconnect_rate_limited() {
        let s = session();
        let rx = connect(&s);
        s.ask_peer_to_disconnect();
        s.ask_peer_to_disconnect();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_get_peer_media_reuses_instance() {
        let s = session();
        let _rx = connect(&s);
        let key = StreamKey::new(vec![0x21, 0x01, 7]);
        let m1 = s.get_peer_media(&key).unwrap();
        let m2 = s.get_peer_media(&key).unwrap();
        assert!(Arc::ptr_eq(&m1, &m2));
    }

    #[test]
    fn test_close_raises_on_peer_close_once() {
        let s = session();
        let _rx = connect(&s);
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        s.events.on_peer_close.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        s.close(false);
        s.close(false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(s.status(), SessionStatus::Closed);
    }
}
