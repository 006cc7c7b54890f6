//! Shared UDP socket handler.
//!
//! Owns the IPv4 and IPv6 endpoints, demultiplexes inbound datagrams to
//! per-address connections, and drives a default connection for datagrams
//! from unknown sources (bootstrap handshake frames 30/70/71). A tag-keyed
//! table tracks peer introductions awaiting the rendezvous server.

use crate::address::{read_address_list, AddressType};
use crate::connection::{PacketSink, Role, RtmfpConnection};
use crate::consts::{message_type, P2P_MAX_ATTEMPTS, P2P_RETRY_SPACING, RAW_ID_SIZE};
use crate::events::Request;
use crate::peer_id::PeerId;
use crate::peer_session::{SessionStatus, StatusCell};
use crate::wire::Reader;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Introduction tag, chosen by the initiator and echoed by the server.
pub type Tag = Vec<u8>;

/// A peer introduction awaiting the server's handshake 70/71 answer.
pub struct WaitingPeer {
    pub raw_id: [u8; RAW_ID_SIZE],
    pub peer_id: PeerId,
    pub host_address: SocketAddr,
    attempt: u32,
    last_attempt: Option<Instant>,
}

/// Inbound p2p handshake 30 addressed to us.
pub struct Handshake30 {
    pub tag: Tag,
    pub address: SocketAddr,
}

/// Server answer to an introduction (or a direct responder answer).
pub struct Handshake70 {
    /// Introduced peer; `None` for a non-p2p (server) handshake.
    pub peer_id: Option<PeerId>,
    pub address: SocketAddr,
    pub far_key: Vec<u8>,
    pub cookie: Vec<u8>,
    /// True when no connection exists yet for `address`.
    pub create_connection: bool,
}

/// Address list for a pending introduction (handshake 71).
pub struct P2pAddresses {
    pub peer_id: PeerId,
    pub addresses: Vec<(SocketAddr, AddressType)>,
}

/// Events raised by the socket layer towards the session layer.
///
/// Handlers run on the dispatch thread, sometimes under the connections
/// mutex; they must not block or call back into the mux.
pub struct SocketEvents {
    /// A peer wants to connect to us; decide whether to accept.
    pub on_peer_handshake_30: Request<Handshake30>,
    /// Handshake 70 answer; decide whether to proceed with the connection.
    pub on_peer_handshake_70: Request<Handshake70>,
    /// Addresses received for a pending introduction; return false to stop
    /// retargeting the introduction at a far server.
    pub on_p2p_addresses: Request<P2pAddresses>,
}

impl SocketEvents {
    fn new() -> Self {
        Self {
            on_peer_handshake_30: Request::new(),
            on_peer_handshake_70: Request::new(),
            on_p2p_addresses: Request::new(),
        }
    }
}

struct MuxInner {
    connections: HashMap<SocketAddr, Arc<RtmfpConnection>>,
    waiting: HashMap<Tag, WaitingPeer>,
}

/// The default connection handles datagrams from unknown addresses.
struct DefaultConnection {
    address: Mutex<SocketAddr>,
    out: Sender<(SocketAddr, Vec<u8>)>,
}

impl DefaultConnection {
    fn set_address(&self, address: SocketAddr) {
        *self.address.lock().unwrap() = address;
    }

    /// Sends `30 <len> <raw id> <tag>` to the current target.
    fn send_handshake_30(&self, raw_id: &[u8; RAW_ID_SIZE], tag: &[u8]) {
        let mut buf = Vec::with_capacity(2 + RAW_ID_SIZE + tag.len());
        buf.push(message_type::HANDSHAKE_30);
        buf.push(RAW_ID_SIZE as u8);
        buf.extend_from_slice(raw_id);
        buf.extend_from_slice(tag);
        let address = *self.address.lock().unwrap();
        let _ = self.out.send((address, buf));
    }
}

/// Owns the UDP endpoints and the address-to-connection map.
pub struct SocketMux {
    socket_v4: UdpSocket,
    socket_v6: Option<UdpSocket>,
    our_peer_id: PeerId,
    main_status: StatusCell,
    inner: Mutex<MuxInner>,
    default_conn: DefaultConnection,
    out_tx: Sender<(SocketAddr, Vec<u8>)>,
    out_rx: Receiver<(SocketAddr, Vec<u8>)>,
    dropped_sends: AtomicU64,
    closed: AtomicBool,
    /// Socket-layer events, consumed by the session layer.
    pub events: SocketEvents,
}

impl SocketMux {
    /// Binds the IPv4 wildcard endpoint (required) and the IPv6 wildcard
    /// endpoint (best-effort), and shares `main_status` for the dispatch
    /// gate.
    pub fn bind(our_peer_id: PeerId, main_status: StatusCell) -> io::Result<Arc<Self>> {
        let socket_v4 = UdpSocket::bind(("0.0.0.0", 0))?;
        let socket_v6 = match UdpSocket::bind(("::", 0)) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "unable to bind [::], ipv6 will not work");
                None
            }
        };
        let (out_tx, out_rx) = unbounded();
        Ok(Arc::new(Self {
            socket_v4,
            socket_v6,
            our_peer_id,
            main_status,
            inner: Mutex::new(MuxInner {
                connections: HashMap::new(),
                waiting: HashMap::new(),
            }),
            default_conn: DefaultConnection {
                address: Mutex::new("0.0.0.0:0".parse().unwrap()),
                out: out_tx.clone(),
            },
            out_tx,
            out_rx,
            dropped_sends: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events: SocketEvents::new(),
        }))
    }

    /// Local IPv4 address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket_v4.local_addr()
    }

    /// Sender used by connections to queue outbound datagrams.
    pub fn outbound_sender(&self) -> Sender<(SocketAddr, Vec<u8>)> {
        self.out_tx.clone()
    }

    /// Receiver side of the outbound queue; the writer thread drains it.
    pub fn outbound_receiver(&self) -> Receiver<(SocketAddr, Vec<u8>)> {
        self.out_rx.clone()
    }

    /// Datagrams dropped because a socket send would have blocked.
    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::SeqCst)
    }

    /// Starts the reader threads and the outbound writer thread.
    pub fn run(self: &Arc<Self>) -> io::Result<()> {
        self.socket_v4.set_nonblocking(false)?;
        for socket in std::iter::once(&self.socket_v4).chain(self.socket_v6.as_ref()) {
            let socket = socket.try_clone()?;
            let mux = Arc::downgrade(self);
            thread::spawn(move || reader_loop(socket, mux));
        }

        let v4 = self.socket_v4.try_clone()?;
        v4.set_nonblocking(true)?;
        let v6 = match &self.socket_v6 {
            Some(s) => {
                let s = s.try_clone()?;
                s.set_nonblocking(true)?;
                Some(s)
            }
            None => None,
        };
        let rx = self.out_rx.clone();
        let mux = Arc::downgrade(self);
        thread::spawn(move || writer_loop(v4, v6, rx, mux));
        Ok(())
    }

    /// Registers a pending introduction. Idempotent per tag.
    pub fn add_p2p_connection(
        &self,
        raw_id: [u8; RAW_ID_SIZE],
        peer_id: PeerId,
        tag: Tag,
        host_address: SocketAddr,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting.entry(tag).or_insert(WaitingPeer {
            raw_id,
            peer_id,
            host_address,
            attempt: 0,
            last_attempt: None,
        });
    }

    /// Number of pending introductions.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    /// Returns the connection for `address`, creating it if needed.
    /// The second value is false when the address already had one.
    pub fn add_connection(
        &self,
        address: SocketAddr,
        sink: Option<Weak<dyn PacketSink>>,
        role: Role,
        is_p2p: bool,
    ) -> (Arc<RtmfpConnection>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.connections.get(&address) {
            debug!(%address, "connection already exists, nothing done");
            return (existing.clone(), false);
        }
        let conn = RtmfpConnection::new(address, role, is_p2p, self.out_tx.clone());
        if let Some(sink) = sink {
            conn.set_sink(sink);
        }
        inner.connections.insert(address, conn.clone());
        (conn, true)
    }

    /// Looks up the connection for an address.
    pub fn connection(&self, address: &SocketAddr) -> Option<Arc<RtmfpConnection>> {
        self.inner.lock().unwrap().connections.get(address).cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Periodic pass: introduction retries, connection keepalives, reaping.
    pub fn manage(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();

        // Ask the server again for each introduction still unanswered.
        let mut expired: Vec<Tag> = Vec::new();
        for (tag, peer) in inner.waiting.iter_mut() {
            let due = match peer.last_attempt {
                None => true,
                Some(at) => now.duration_since(at) >= P2P_RETRY_SPACING * peer.attempt,
            };
            if !due {
                continue;
            }
            if peer.attempt == P2P_MAX_ATTEMPTS {
                debug!(peer = %peer.peer_id.short_hex(), "introduction reached {} attempts without answer, removing", P2P_MAX_ATTEMPTS);
                expired.push(tag.clone());
                continue;
            }
            peer.attempt += 1;
            debug!(peer = %peer.peer_id.short_hex(), attempt = peer.attempt, "sending p2p handshake 30 to server");
            self.default_conn.set_address(peer.host_address);
            self.default_conn.send_handshake_30(&peer.raw_id, tag);
            peer.last_attempt = Some(now);
        }
        for tag in expired {
            inner.waiting.remove(&tag);
        }

        // Tick every connection, then drop the failed ones.
        for conn in inner.connections.values() {
            conn.manage(now);
        }
        inner.connections.retain(|address, conn| {
            if conn.failed() {
                trace!(%address, "closing failed connection");
                conn.close();
                false
            } else {
                true
            }
        });
    }

    /// Dispatches one inbound datagram.
    pub fn dispatch(self: &Arc<Self>, source: SocketAddr, payload: &[u8]) {
        if self.main_status.get() >= SessionStatus::NearClosed {
            return;
        }
        let conn = {
            let inner = self.inner.lock().unwrap();
            inner.connections.get(&source).cloned()
        };
        match conn {
            Some(conn) => conn.process(payload),
            None => {
                debug!(%source, "input packet from a new address");
                self.default_conn.set_address(source);
                self.process_default(source, payload);
            }
        }
    }

    /// Handles a bootstrap frame from an unknown source.
    fn process_default(self: &Arc<Self>, source: SocketAddr, payload: &[u8]) {
        let mut r = Reader::new(payload);
        let msg_type = match r.read_u8() {
            Ok(t) => t,
            Err(_) => return,
        };
        let result = match msg_type {
            message_type::HANDSHAKE_30 => self.read_handshake_30(source, &mut r),
            message_type::HANDSHAKE_70 => self.read_handshake_70(source, &mut r),
            message_type::HANDSHAKE_71 => self.read_handshake_71(&mut r),
            other => {
                trace!(%source, msg_type = other, "ignoring unexpected bootstrap frame");
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(%source, error = %e, "malformed bootstrap frame");
        }
    }

    fn read_handshake_30(
        self: &Arc<Self>,
        source: SocketAddr,
        r: &mut Reader<'_>,
    ) -> Result<(), crate::wire::WireError> {
        let len = r.read_u8()? as usize;
        let raw = r.read_bytes(len)?;
        let tag = r.read_bytes(r.available())?.to_vec();
        let id = match PeerId::from_raw(raw) {
            Some(id) => id,
            None => {
                error!(%source, "handshake 30 with malformed peer id, connection rejected");
                return Ok(());
            }
        };
        self.on_peer_handshake_30(&id, tag, source);
        Ok(())
    }

    fn read_handshake_70(
        self: &Arc<Self>,
        source: SocketAddr,
        r: &mut Reader<'_>,
    ) -> Result<(), crate::wire::WireError> {
        let tag_len = r.read_u8()? as usize;
        let tag = r.read_bytes(tag_len)?.to_vec();
        let cookie_len = r.read_u8()? as usize;
        let cookie = r.read_bytes(cookie_len)?.to_vec();
        let far_key = r.read_bytes(r.available())?.to_vec();
        let create_connection = self.connection(&source).is_none();
        self.on_peer_handshake_70(tag, far_key, cookie, source, create_connection, true);
        Ok(())
    }

    fn read_handshake_71(
        self: &Arc<Self>,
        r: &mut Reader<'_>,
    ) -> Result<(), crate::wire::WireError> {
        let tag_len = r.read_u8()? as usize;
        let tag = r.read_bytes(tag_len)?.to_vec();
        let addresses = r.read_bytes(r.available())?.to_vec();
        self.on_p2p_addresses(&tag, &addresses);
        Ok(())
    }

    /// Handles an inbound p2p request: rejects identity mismatches, raises
    /// the rest to the session layer unless the tag is already pending.
    pub fn on_peer_handshake_30(&self, id: &PeerId, tag: Tag, source: SocketAddr) {
        if *id != self.our_peer_id {
            error!(peer = %id.short_hex(), "unexpected peer id in handshake 30, connection rejected");
            return;
        }
        let known = self.inner.lock().unwrap().waiting.contains_key(&tag);
        if known {
            debug!("handshake 30 received but the connection exists");
            return;
        }
        self.events
            .on_peer_handshake_30
            .raise(&Handshake30 { tag, address: source }, false);
    }

    /// Handles a handshake 70 answer. Returns the session layer's decision.
    pub fn on_peer_handshake_70(
        &self,
        tag: Tag,
        far_key: Vec<u8>,
        cookie: Vec<u8>,
        source: SocketAddr,
        create_connection: bool,
        is_p2p: bool,
    ) -> bool {
        if !is_p2p {
            return self.events.on_peer_handshake_70.raise(
                &Handshake70 {
                    peer_id: None,
                    address: source,
                    far_key,
                    cookie,
                    create_connection,
                },
                false,
            );
        }
        let peer = self.inner.lock().unwrap().waiting.remove(&tag);
        match peer {
            Some(peer) => self.events.on_peer_handshake_70.raise(
                &Handshake70 {
                    peer_id: Some(peer.peer_id),
                    address: source,
                    far_key,
                    cookie,
                    create_connection,
                },
                false,
            ),
            None => {
                trace!(%source, "unknown tag in handshake 70 (possible old connection)");
                false
            }
        }
    }

    /// Handles a handshake 71 address list for a pending introduction.
    pub fn on_p2p_addresses(&self, tag: &[u8], payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let peer = match inner.waiting.get_mut(tag) {
            Some(p) => p,
            None => {
                debug!("handshake 71 received but no introduction found with tag (possible old request)");
                return;
            }
        };

        let mut addresses = Vec::new();
        let mut host_address = peer.host_address;
        let mut r = Reader::new(payload);
        if !read_address_list(&mut r, &mut addresses, &mut host_address) {
            debug!(peer = %peer.peer_id.short_hex(), "handshake 71 carried no address");
            return;
        }

        let proceed = self.events.on_p2p_addresses.raise(
            &P2pAddresses {
                peer_id: peer.peer_id,
                addresses,
            },
            true,
        );

        // Introduction moved to another rendezvous server: retarget.
        if proceed && host_address != peer.host_address {
            debug!(peer = %peer.peer_id.short_hex(), host = %host_address, "sending p2p handshake 30 to far server");
            peer.host_address = host_address;
            self.default_conn.set_address(host_address);
            self.default_conn.send_handshake_30(&peer.raw_id, tag);
            peer.attempt += 1;
            peer.last_attempt = Some(Instant::now());
        }
    }

    /// Closes every connection and stops accepting datagrams.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        for conn in inner.connections.values() {
            conn.close();
        }
        inner.connections.clear();
        inner.waiting.clear();
    }
}

fn reader_loop(socket: UdpSocket, mux: Weak<SocketMux>) {
    let mut buf = [0u8; 2048];
    loop {
        let (n, source) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(_) => return,
        };
        let mux = match mux.upgrade() {
            Some(m) => m,
            None => return,
        };
        if mux.closed.load(Ordering::SeqCst) {
            return;
        }
        mux.dispatch(source, &buf[..n]);
    }
}

fn writer_loop(
    v4: UdpSocket,
    v6: Option<UdpSocket>,
    rx: Receiver<(SocketAddr, Vec<u8>)>,
    mux: Weak<SocketMux>,
) {
    for (address, payload) in rx.iter() {
        let mux = match mux.upgrade() {
            Some(m) => m,
            None => return,
        };
        if mux.closed.load(Ordering::SeqCst) {
            return;
        }
        let socket = if address.is_ipv6() {
            match &v6 {
                Some(s) => s,
                None => continue,
            }
        } else {
            &v4
        };
        match socket.send_to(&payload, address) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Non-blocking contract: drop and count, never stall.
                mux.dropped_sends.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => debug!(%address, error = %e, "socket send error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::RAW_ID_PREFIX;
    use std::time::Duration;

    fn mux() -> Arc<SocketMux> {
        SocketMux::bind(PeerId::new([1u8; 32]), StatusCell::new()).unwrap()
    }

    fn host() -> SocketAddr {
        "198.51.100.1:1935".parse().unwrap()
    }

    fn raw(id: PeerId) -> [u8; RAW_ID_SIZE] {
        id.raw()
    }

    #[test]
    fn test_add_connection_is_idempotent_per_address() {
        let mux = mux();
        let addr: SocketAddr = "203.0.113.7:1935".parse().unwrap();
        let (c1, created1) = mux.add_connection(addr, None, Role::Initiator, true);
        let (c2, created2) = mux.add_connection(addr, None, Role::Responder, true);
        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(mux.connection_count(), 1);
    }

    #[test]
    fn test_waiting_peer_retry_schedule() {
        let mux = mux();
        let peer = PeerId::new([9u8; 32]);
        mux.add_p2p_connection(raw(peer), peer, b"tag-1".to_vec(), host());

        let rx = mux.outbound_receiver();
        let t0 = Instant::now();

        // First send is immediate.
        mux.manage(t0);
        assert_eq!(rx.len(), 1);

        // Nothing until 1.5s elapsed, then sends spaced by attempt * 1.5s.
        mux.manage(t0 + Duration::from_millis(1400));
        assert_eq!(rx.len(), 1);
        let mut t = t0;
        for attempt in 1..P2P_MAX_ATTEMPTS {
            t += P2P_RETRY_SPACING * attempt;
            mux.manage(t);
            assert_eq!(rx.len() as u32, attempt + 1);
        }
        assert_eq!(rx.len() as u32, P2P_MAX_ATTEMPTS);
        assert_eq!(mux.waiting_count(), 1);

        // The 12th due tick removes the entry without sending.
        t += P2P_RETRY_SPACING * P2P_MAX_ATTEMPTS;
        mux.manage(t);
        assert_eq!(rx.len() as u32, P2P_MAX_ATTEMPTS);
        assert_eq!(mux.waiting_count(), 0);

        // And no send ever happens afterwards.
        mux.manage(t + Duration::from_secs(60));
        assert_eq!(rx.len() as u32, P2P_MAX_ATTEMPTS);
    }

    #[test]
    fn test_handshake_30_sent_to_host() {
        let mux = mux();
        let peer = PeerId::new([9u8; 32]);
        mux.add_p2p_connection(raw(peer), peer, b"tag-9".to_vec(), host());
        mux.manage(Instant::now());

        let (to, payload) = mux.outbound_receiver().try_recv().unwrap();
        assert_eq!(to, host());
        assert_eq!(payload[0], message_type::HANDSHAKE_30);
        assert_eq!(payload[1] as usize, RAW_ID_SIZE);
        assert_eq!(&payload[2..4], &RAW_ID_PREFIX);
        assert_eq!(&payload[2 + RAW_ID_SIZE..], b"tag-9");
    }

    #[test]
    fn test_handshake_30_identity_mismatch_rejected() {
        let mux = mux();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        mux.events.on_peer_handshake_30.set(move |_| {
            f.store(true, Ordering::SeqCst);
            true
        });

        let other = PeerId::new([2u8; 32]);
        mux.on_peer_handshake_30(&other, b"t".to_vec(), host());
        assert!(!fired.load(Ordering::SeqCst));

        mux.on_peer_handshake_30(&PeerId::new([1u8; 32]), b"t".to_vec(), host());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_handshake_70_consumes_waiting_peer() {
        let mux = mux();
        let peer = PeerId::new([9u8; 32]);
        mux.add_p2p_connection(raw(peer), peer, b"tag-x".to_vec(), host());

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        mux.events.on_peer_handshake_70.set(move |h: &Handshake70| {
            *s.lock().unwrap() = h.peer_id;
            true
        });

        let accepted =
            mux.on_peer_handshake_70(b"tag-x".to_vec(), vec![1], vec![2], host(), true, true);
        assert!(accepted);
        assert_eq!(*seen.lock().unwrap(), Some(peer));
        assert_eq!(mux.waiting_count(), 0);

        // Unknown tag now: ignored.
        let again =
            mux.on_peer_handshake_70(b"tag-x".to_vec(), vec![], vec![], host(), true, true);
        assert!(!again);
    }

    #[test]
    fn test_p2p_addresses_retargets_far_server() {
        let mux = mux();
        let peer = PeerId::new([9u8; 32]);
        mux.add_p2p_connection(raw(peer), peer, b"tag-r".to_vec(), host());
        // Drain the initial handshake 30.
        mux.manage(Instant::now());
        let rx = mux.outbound_receiver();
        while rx.try_recv().is_ok() {}

        let far: SocketAddr = "192.0.2.200:1935".parse().unwrap();
        let mut payload = Vec::new();
        crate::address::write_address(&mut payload, far, AddressType::Redirection);
        crate::address::write_address(
            &mut payload,
            "203.0.113.50:1935".parse().unwrap(),
            AddressType::Public,
        );
        mux.on_p2p_addresses(b"tag-r", &payload);

        let (to, frame) = rx.try_recv().unwrap();
        assert_eq!(to, far);
        assert_eq!(frame[0], message_type::HANDSHAKE_30);
    }

    #[test]
    fn test_dispatch_gated_on_near_closed() {
        let status = StatusCell::new();
        let mux = SocketMux::bind(PeerId::new([1u8; 32]), status.clone()).unwrap();
        let addr: SocketAddr = "203.0.113.7:1935".parse().unwrap();
        let (conn, _) = mux.add_connection(addr, None, Role::Initiator, true);

        status.set(SessionStatus::NearClosed);
        mux.dispatch(addr, &[0x0A, 0, 0]);
        assert_eq!(conn.rx_bytes(), 0);
    }
}
