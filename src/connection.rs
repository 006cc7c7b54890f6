//! Per-remote-address connection: flow writers, keepalive, failure flag.
//!
//! A connection carries already-decrypted group payloads between one local
//! session and one remote address. The socket layer owns the map of
//! connections; the session owns the flows opened on top of one.

use crate::consts::{message_type, CONNECTION_TIMEOUT, KEEPALIVE_INTERVAL};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;
use tracing::debug;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the opening handshake.
    Initiator,
    /// The remote reached out to us.
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Writer errors, routed through the owning session's exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriterError {
    #[error("writer is closed")]
    Closed,
    #[error("connection is gone")]
    ConnectionGone,
}

/// Receives decrypted payloads delivered to a connection.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, conn: &Arc<RtmfpConnection>, payload: &[u8]);
}

/// A flow writer opened on a connection.
pub struct RtmfpWriter {
    id: u64,
    flow_id: u64,
    signature: Vec<u8>,
    closed: AtomicBool,
    conn: Weak<RtmfpConnection>,
}

impl RtmfpWriter {
    /// Writer id, unique per connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flow id this writer answers to.
    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    /// Flow signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// True once the writer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the writer; later sends fail with [`WriterError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Queues a framed payload on the owning connection.
    pub fn send(&self, payload: &[u8]) -> Result<(), WriterError> {
        if self.is_closed() {
            return Err(WriterError::Closed);
        }
        let conn = self.conn.upgrade().ok_or(WriterError::ConnectionGone)?;
        if conn.failed() {
            return Err(WriterError::ConnectionGone);
        }
        conn.send(payload);
        Ok(())
    }
}

/// A session carrier bound to one remote address.
pub struct RtmfpConnection {
    address: RwLock<SocketAddr>,
    role: Role,
    is_p2p: bool,
    out: Sender<(SocketAddr, Vec<u8>)>,
    failed: AtomicBool,
    last_recv: RwLock<Instant>,
    last_send: RwLock<Instant>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    writers: Mutex<HashMap<u64, Arc<RtmfpWriter>>>,
    next_writer_id: AtomicU64,
    sink: RwLock<Option<Weak<dyn PacketSink>>>,
}

impl RtmfpConnection {
    /// Creates a connection towards `address`, sending through `out`.
    pub fn new(
        address: SocketAddr,
        role: Role,
        is_p2p: bool,
        out: Sender<(SocketAddr, Vec<u8>)>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            address: RwLock::new(address),
            role,
            is_p2p,
            out,
            failed: AtomicBool::new(false),
            last_recv: RwLock::new(now),
            last_send: RwLock::new(now),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            writers: Mutex::new(HashMap::new()),
            next_writer_id: AtomicU64::new(1),
            sink: RwLock::new(None),
        })
    }

    /// Remote address.
    pub fn address(&self) -> SocketAddr {
        *self.address.read().unwrap()
    }

    /// Updates the remote address (roaming peer).
    pub fn set_address(&self, address: SocketAddr) {
        *self.address.write().unwrap() = address;
    }

    /// Our role on this connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True for direct peer-to-peer connections.
    pub fn is_p2p(&self) -> bool {
        self.is_p2p
    }

    /// True once the connection is marked failed.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Marks the connection failed; the socket layer reaps it.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Bytes received.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::SeqCst)
    }

    /// Bytes sent.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::SeqCst)
    }

    /// Installs the session receiving this connection's payloads.
    pub fn set_sink(&self, sink: Weak<dyn PacketSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    /// Detaches the session.
    pub fn clear_sink(&self) {
        *self.sink.write().unwrap() = None;
    }

    /// Opens a new writer. `flow_id` references the remote flow when we
    /// answer one, 0 when we open the flow ourselves.
    pub fn new_writer(self: &Arc<Self>, signature: &[u8], flow_id: u64) -> Arc<RtmfpWriter> {
        let id = self.next_writer_id.fetch_add(1, Ordering::SeqCst);
        let writer = Arc::new(RtmfpWriter {
            id,
            flow_id,
            signature: signature.to_vec(),
            closed: AtomicBool::new(false),
            conn: Arc::downgrade(self),
        });
        self.writers.lock().unwrap().insert(id, writer.clone());
        writer
    }

    /// Closes and forgets one writer.
    pub fn close_writer(&self, id: u64) {
        if let Some(writer) = self.writers.lock().unwrap().remove(&id) {
            writer.close();
        }
    }

    /// Number of open writers.
    pub fn writer_count(&self) -> usize {
        self.writers.lock().unwrap().len()
    }

    /// Queues a payload towards the remote address.
    pub fn send(&self, payload: &[u8]) {
        let address = self.address();
        if self.out.send((address, payload.to_vec())).is_ok() {
            *self.last_send.write().unwrap() = Instant::now();
            self.tx_bytes.fetch_add(payload.len() as u64, Ordering::SeqCst);
        }
    }

    /// Delivers an inbound payload to the attached session.
    pub fn process(self: &Arc<Self>, payload: &[u8]) {
        *self.last_recv.write().unwrap() = Instant::now();
        self.rx_bytes.fetch_add(payload.len() as u64, Ordering::SeqCst);

        if payload.first() == Some(&message_type::KEEPALIVE) {
            return;
        }
        let sink = self.sink.read().unwrap().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.on_packet(self, payload);
        }
    }

    /// Keepalive and timeout pass, driven by the socket layer.
    pub fn manage(&self, now: Instant) {
        if self.failed() {
            return;
        }
        let last_recv = *self.last_recv.read().unwrap();
        if now.duration_since(last_recv) > CONNECTION_TIMEOUT {
            debug!(address = %self.address(), "connection timed out");
            self.set_failed();
            return;
        }
        let last_send = *self.last_send.read().unwrap();
        if now.duration_since(last_send) > KEEPALIVE_INTERVAL {
            self.send(&[message_type::KEEPALIVE]);
        }
    }

    /// Closes every writer and detaches the session.
    pub fn close(&self) {
        let mut writers = self.writers.lock().unwrap();
        for writer in writers.values() {
            writer.close();
        }
        writers.clear();
        drop(writers);
        self.clear_sink();
        self.set_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn addr() -> SocketAddr {
        "203.0.113.4:1935".parse().unwrap()
    }

    #[test]
    fn test_writer_send_frames_to_address() {
        let (tx, rx) = unbounded();
        let conn = RtmfpConnection::new(addr(), Role::Initiator, true, tx);
        let writer = conn.new_writer(b"sig", 0);

        writer.send(&[0x0A, 1, 2]).unwrap();
        let (to, payload) = rx.try_recv().unwrap();
        assert_eq!(to, addr());
        assert_eq!(payload, vec![0x0A, 1, 2]);
        assert_eq!(conn.tx_bytes(), 3);
    }

    #[test]
    fn test_closed_writer_rejects() {
        let (tx, _rx) = unbounded();
        let conn = RtmfpConnection::new(addr(), Role::Responder, true, tx);
        let writer = conn.new_writer(b"sig", 7);
        assert_eq!(writer.flow_id(), 7);

        conn.close_writer(writer.id());
        assert_eq!(writer.send(b"x").unwrap_err(), WriterError::Closed);
        assert_eq!(conn.writer_count(), 0);
    }

    #[test]
    fn test_failed_connection_rejects_writer() {
        let (tx, _rx) = unbounded();
        let conn = RtmfpConnection::new(addr(), Role::Initiator, false, tx);
        let writer = conn.new_writer(b"sig", 0);
        conn.set_failed();
        assert_eq!(writer.send(b"x").unwrap_err(), WriterError::ConnectionGone);
    }

    #[test]
    fn test_manage_emits_keepalive_and_times_out() {
        let (tx, rx) = unbounded();
        let conn = RtmfpConnection::new(addr(), Role::Initiator, true, tx);

        let later = Instant::now() + KEEPALIVE_INTERVAL + KEEPALIVE_INTERVAL;
        conn.manage(later);
        let (_, payload) = rx.try_recv().unwrap();
        assert_eq!(payload, vec![message_type::KEEPALIVE]);
        assert!(!conn.failed());

        let much_later = Instant::now() + CONNECTION_TIMEOUT + KEEPALIVE_INTERVAL;
        conn.manage(much_later);
        assert!(conn.failed());
    }

    #[test]
    fn test_close_clears_writers() {
        let (tx, _rx) = unbounded();
        let conn = RtmfpConnection::new(addr(), Role::Initiator, true, tx);
        let w1 = conn.new_writer(b"a", 0);
        let _w2 = conn.new_writer(b"b", 0);
        assert_eq!(conn.writer_count(), 2);

        conn.close();
        assert_eq!(conn.writer_count(), 0);
        assert!(w1.is_closed());
        assert!(conn.failed());
    }
}
