//! NetGroup controller: wires peers, heard list, best list and group
//! medias together, and exposes publish/subscribe to the outer session.

pub mod best;
pub mod heard;
pub mod media;
pub mod report;

use crate::address::AddressType;
use crate::consts::{BEST_LIST_DELAY, PEER_TIMEOUT, RAW_ID_SIZE, REPORT_DELAY};
use crate::events::SubscriptionId;
use crate::peer_id::{GroupAddress, PeerId};
use crate::peer_session::{GroupReportEvent, NewMediaEvent, PeerSession, SessionStatus};
use crate::wire::Reader;
use heard::HeardList;
use media::{GroupConfig, GroupListener, GroupMedia, StreamKey};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// NetGroup tuning knobs.
#[derive(Clone)]
pub struct NetGroupConfig {
    /// True when this node publishes the stream.
    pub is_publisher: bool,
    /// Delay between best-list recomputations.
    pub best_list_delay: Duration,
    /// Delay between spontaneous gossip reports.
    pub report_delay: Duration,
    /// Heard-list eviction timeout.
    pub peer_timeout: Duration,
    /// Default media subscription parameters.
    pub media: GroupConfig,
}

impl Default for NetGroupConfig {
    fn default() -> Self {
        Self {
            is_publisher: false,
            best_list_delay: BEST_LIST_DELAY,
            report_delay: REPORT_DELAY,
            peer_timeout: PEER_TIMEOUT,
            media: GroupConfig::default(),
        }
    }
}

/// Surface the controller consumes from the outer RTMFP session.
///
/// Implementations must not call back into the controller synchronously.
pub trait SessionApi: Send + Sync {
    /// Delivers a reassembled media packet to the application.
    fn push_media(&self, stream: &str, time: u32, data: &[u8], lost_rate: f64, audio: bool);
    /// Opens a P2P connection towards a best-list member.
    fn connect_to_peer(
        &self,
        peer_id: &PeerId,
        stream: &str,
        addresses: &[(SocketAddr, AddressType)],
        host_address: SocketAddr,
    );
    /// Attaches a listener to the local publishing source.
    fn start_listening(&self, stream: &str, id_txt: &str) -> Option<Arc<GroupListener>>;
    /// Detaches the listener.
    fn stop_listening(&self, id_txt: &str);
    /// Our rendezvous server.
    fn server_address(&self) -> SocketAddr;
    /// Our peer id.
    fn peer_id(&self) -> PeerId;
    /// Unblocks a caller waiting on publish.
    fn set_publish_ready(&self);
}

struct PeerSubscriptions {
    report: SubscriptionId,
    begin: SubscriptionId,
    close: SubscriptionId,
}

struct PeerEntry {
    session: Arc<PeerSession>,
    subs: PeerSubscriptions,
}

struct NetGroupState {
    heard: HeardList,
    peers: HashMap<PeerId, PeerEntry>,
    best_list: BTreeSet<PeerId>,
    group_medias: BTreeMap<StreamKey, Arc<GroupMedia>>,
    media_subs: HashMap<StreamKey, SubscriptionId>,
    publisher_key: Option<StreamKey>,
    listener: Option<(Arc<GroupListener>, SubscriptionId)>,
    last_report: Option<Instant>,
    last_best_calc: Option<Instant>,
    next_media_id: u64,
}

/// One NetGroup membership.
pub struct NetGroup {
    pub id_hex: String,
    pub id_txt: String,
    pub stream_name: String,
    my_group_address: GroupAddress,
    config: NetGroupConfig,
    api: Arc<dyn SessionApi>,
    state: Mutex<NetGroupState>,
}

impl NetGroup {
    /// Joins a group. A publisher configuration synthesizes the stream key
    /// and its group media immediately.
    pub fn new(
        id_hex: &str,
        id_txt: &str,
        stream_name: &str,
        config: NetGroupConfig,
        api: Arc<dyn SessionApi>,
    ) -> Arc<Self> {
        let my_group_address = api.peer_id().group_address();
        let this = Arc::new(Self {
            id_hex: id_hex.to_string(),
            id_txt: id_txt.to_string(),
            stream_name: stream_name.to_string(),
            my_group_address,
            config: config.clone(),
            api,
            state: Mutex::new(NetGroupState {
                heard: HeardList::new(),
                peers: HashMap::new(),
                best_list: BTreeSet::new(),
                group_medias: BTreeMap::new(),
                media_subs: HashMap::new(),
                publisher_key: None,
                listener: None,
                last_report: None,
                last_best_calc: None,
                next_media_id: 1,
            }),
        });

        if config.is_publisher {
            let mut state = this.state.lock().unwrap();
            let key = StreamKey::generate();
            let mut media_config = config.media.clone();
            media_config.is_publisher = true;
            this.create_group_media_locked(&mut state, key.clone(), media_config);
            state.publisher_key = Some(key);
        }
        this
    }

    /// Our position on the distance ring.
    pub fn my_group_address(&self) -> GroupAddress {
        self.my_group_address
    }

    /// Records a peer made known by gossip or a direct connect.
    pub fn add_peer_to_heard_list(
        &self,
        peer_id: PeerId,
        raw_id: [u8; RAW_ID_SIZE],
        addresses: Vec<(SocketAddr, AddressType)>,
        host_address: SocketAddr,
        elapsed: Duration,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        state
            .heard
            .insert(peer_id, raw_id, addresses, host_address, elapsed, Instant::now())
    }

    /// Attaches a connected peer session. Rejects unknown and duplicate
    /// peers without mutating anything.
    pub fn add_peer(self: &Arc<Self>, session: &Arc<PeerSession>) -> bool {
        let mut state = self.state.lock().unwrap();
        let peer_id = session.peer_id;
        if !state.heard.contains(&peer_id) {
            error!(peer = %peer_id.short_hex(), "unknown peer to add");
            return false;
        }
        if state.peers.contains_key(&peer_id) {
            error!(peer = %peer_id.short_hex(), "unable to add the peer, it already exists");
            return false;
        }
        debug!(peer = %peer_id.short_hex(), "adding the peer to the group");

        let this = Arc::downgrade(self);
        let report = session.events.on_peer_group_report.subscribe({
            let this = this.clone();
            move |ev: &GroupReportEvent| {
                if let Some(group) = this.upgrade() {
                    group.handle_group_report(ev);
                }
            }
        });
        let begin = session.events.on_peer_group_begin.subscribe({
            let this = this.clone();
            move |peer_id: &PeerId| {
                if let Some(group) = this.upgrade() {
                    group.handle_group_begin(peer_id);
                }
            }
        });
        let close = session.events.on_peer_close.subscribe({
            let this = this.clone();
            move |peer_id: &PeerId| {
                if let Some(group) = this.upgrade() {
                    group.remove_peer(peer_id);
                }
            }
        });
        session.events.on_new_media.set({
            let this = this.clone();
            move |ev: &NewMediaEvent| match this.upgrade() {
                Some(group) => group.handle_new_media(ev),
                None => false,
            }
        });
        session.events.on_peer_group_ask_close.set({
            let this = this.clone();
            move |peer_id: &PeerId| match this.upgrade() {
                Some(group) => group.handle_ask_close(peer_id),
                None => true,
            }
        });

        state.peers.insert(
            peer_id,
            PeerEntry {
                session: session.clone(),
                subs: PeerSubscriptions { report, begin, close },
            },
        );
        // Rebuild so the new peer's best-list membership is known.
        state.best_list = best::build_best_list(
            &self.my_group_address,
            state.heard.ring(),
            &Self::connected_latencies(&state),
        );
        true
    }

    /// Detaches a peer session; no event reaches the controller afterwards.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let mut state = self.state.lock().unwrap();
        self.remove_peer_locked(&mut state, peer_id);
    }

    fn remove_peer_locked(&self, state: &mut NetGroupState, peer_id: &PeerId) {
        let entry = match state.peers.remove(peer_id) {
            Some(e) => e,
            None => {
                debug!(peer = %peer_id.short_hex(), "peer already removed from the group");
                return;
            }
        };
        debug!(peer = %peer_id.short_hex(), "deleting peer from the NetGroup");
        let session = &entry.session;
        session.events.on_peer_group_report.unsubscribe(entry.subs.report);
        session.events.on_peer_group_begin.unsubscribe(entry.subs.begin);
        session.events.on_peer_close.unsubscribe(entry.subs.close);
        session.events.on_new_media.clear();
        session.events.on_peer_group_ask_close.clear();
        for media in state.group_medias.values() {
            media.remove_peer(peer_id);
        }
        state.best_list = best::build_best_list(
            &self.my_group_address,
            state.heard.ring(),
            &Self::connected_latencies(state),
        );
    }

    /// True when `peer_id` has no attached session yet.
    pub fn check_peer(&self, peer_id: &PeerId) -> bool {
        !self.state.lock().unwrap().peers.contains_key(peer_id)
    }

    /// Number of known peers.
    pub fn heard_len(&self) -> usize {
        self.state.lock().unwrap().heard.len()
    }

    /// Number of attached peer sessions.
    pub fn connected_count(&self) -> usize {
        self.state.lock().unwrap().peers.len()
    }

    /// Current best list.
    pub fn best_list(&self) -> BTreeSet<PeerId> {
        self.state.lock().unwrap().best_list.clone()
    }

    /// Number of group medias.
    pub fn group_media_count(&self) -> usize {
        self.state.lock().unwrap().group_medias.len()
    }

    /// The synthesized publisher stream key, when publishing.
    pub fn publisher_stream_key(&self) -> Option<StreamKey> {
        self.state.lock().unwrap().publisher_key.clone()
    }

    /// Ring-density estimate of the total group size.
    pub fn estimated_peers_count(&self) -> f64 {
        let state = self.state.lock().unwrap();
        best::estimated_peers_count(state.heard.ring(), &self.my_group_address)
    }

    /// Target neighbor count for the current ring.
    pub fn target_neighbors_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        best::target_neighbors_count(state.heard.ring(), &self.my_group_address)
    }

    /// Periodic tick: best-list refresh, gossip, heard-list reaping, media
    /// upkeep.
    pub fn manage(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();

        // Sessions that failed or closed since the last tick.
        let dead: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, e)| e.session.status() >= SessionStatus::NearClosed)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in dead {
            self.remove_peer_locked(&mut state, &pid);
        }

        let best_due = state
            .last_best_calc
            .map_or(true, |at| now.duration_since(at) >= self.config.best_list_delay);
        if best_due {
            self.update_best_list_locked(&mut state, now);
        }

        let report_due = state
            .last_report
            .map_or(true, |at| now.duration_since(at) >= self.config.report_delay);
        if report_due {
            let connected: Vec<Arc<PeerSession>> = state
                .peers
                .values()
                .map(|e| e.session.clone())
                .filter(|s| s.status() == SessionStatus::Connected)
                .collect();
            if !connected.is_empty() {
                let pick = rand::thread_rng().gen_range(0..connected.len());
                let session = connected[pick].clone();
                self.send_group_report_locked(&mut state, &session, true, now);
            }

            let connected_ids: HashSet<PeerId> = state.peers.keys().copied().collect();
            state
                .heard
                .reap(now, self.config.peer_timeout, |pid| connected_ids.contains(pid));
            state.last_report = Some(now);
        }

        for media in state.group_medias.values() {
            media.manage(now);
        }
    }

    /// Rebuilds the best list and realizes it.
    pub fn update_best_list(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        self.update_best_list_locked(&mut state, now);
    }

    fn update_best_list_locked(&self, state: &mut NetGroupState, now: Instant) {
        let new_best = best::build_best_list(
            &self.my_group_address,
            state.heard.ring(),
            &Self::connected_latencies(state),
        );
        // Status line only; sizes may legitimately differ while
        // connections catch up with the target set.
        if new_best == state.best_list && state.peers.len() != state.best_list.len() {
            info!(
                connected = state.peers.len(),
                known = state.heard.len(),
                target = state.best_list.len(),
                medias = state.group_medias.len(),
                "best peers status"
            );
        }
        state.best_list = new_best;
        self.manage_best_connections_locked(state);
        state.last_best_calc = Some(now);
    }

    fn manage_best_connections_locked(&self, state: &mut NetGroupState) {
        // Ask peers that fell out of the target set to leave.
        for (peer_id, entry) in &state.peers {
            if !state.best_list.contains(peer_id) {
                entry.session.ask_peer_to_disconnect();
            }
        }
        // Reach out to target members not connected yet.
        for peer_id in &state.best_list {
            if state.peers.contains_key(peer_id) {
                continue;
            }
            match state.heard.get(peer_id) {
                None => warn!(peer = %peer_id.short_hex(), "unable to find the peer"),
                Some(node) => {
                    debug!(peer = %peer_id.short_hex(), "connecting to best-list peer");
                    self.api.connect_to_peer(
                        peer_id,
                        &self.stream_name,
                        &node.addresses,
                        node.host_address,
                    );
                }
            }
        }
    }

    fn connected_latencies(state: &NetGroupState) -> Vec<(PeerId, u64)> {
        state
            .peers
            .values()
            .map(|e| (e.session.peer_id, e.session.latency()))
            .collect()
    }

    /// Builds and sends a gossip report to `session`.
    fn send_group_report_locked(
        &self,
        state: &mut NetGroupState,
        session: &Arc<PeerSession>,
        initiator: bool,
        now: Instant,
    ) {
        let recipient_address = match state.heard.get(&session.peer_id) {
            Some(node) => node.group_address,
            None => {
                error!(peer = %session.peer_id.short_hex(), "unable to find the peer in the heard list");
                return;
            }
        };
        let best_for_recipient = best::build_best_list(
            &recipient_address,
            state.heard.ring(),
            &Self::connected_latencies(state),
        );

        let mut entries = Vec::new();
        for peer_id in &best_for_recipient {
            if let Some(node) = state.heard.get(peer_id) {
                entries.push(report::ReportEntry {
                    raw_id: node.raw_id,
                    elapsed_secs: now.duration_since(node.last_group_report).as_secs(),
                    host_address: node.host_address,
                    addresses: node.addresses.clone(),
                });
            }
        }

        let peer_address = session.peer_address().unwrap_or(session.host_address);
        let buf = report::write_group_report(peer_address, self.api.server_address(), &entries);
        session.set_group_report_initiator(initiator);
        session.send_group_report(&buf);
    }

    /// Handles a group report received from a peer.
    pub fn handle_group_report(&self, ev: &GroupReportEvent) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state.heard.touch(&ev.peer_id, now);

        let mut new_peers = false;
        match report::read_group_report(&ev.payload, self.api.server_address()) {
            Ok(parsed) => {
                let own = self.api.peer_id();
                for peer in parsed.peers {
                    if peer.peer_id == own || state.heard.contains(&peer.peer_id) {
                        continue;
                    }
                    if state.heard.insert(
                        peer.peer_id,
                        peer.raw_id,
                        peer.addresses,
                        peer.host_address,
                        Duration::from_secs(peer.elapsed_secs),
                        now,
                    ) {
                        new_peers = true;
                    }
                }
            }
            Err(e) => {
                error!(peer = %ev.peer_id.short_hex(), error = %e, "group report parse failed");
            }
        }
        if new_peers {
            self.update_best_list_locked(&mut state, now);
        }

        // First viewer unlocks the publisher pipeline.
        self.ensure_listener_locked(&mut state);

        let session = state.peers.get(&ev.peer_id).map(|e| e.session.clone());
        let session = match session {
            Some(s) => s,
            None => return,
        };

        if !session.group_report_initiator() {
            self.send_group_report_locked(&mut state, &session, false, now);
            state.last_report = Some(now);
        } else {
            session.set_group_report_initiator(false);
        }

        if ev.send_media_subscription
            && (state.best_list.is_empty() || state.best_list.contains(&ev.peer_id))
        {
            let medias: Vec<Arc<GroupMedia>> = state
                .group_medias
                .values()
                .filter(|m| m.is_publisher() || m.has_fragments())
                .cloned()
                .collect();
            for group_media in medias {
                if let Some(peer_media) = session.get_peer_media(&group_media.stream_key) {
                    group_media.add_peer(ev.peer_id, &peer_media);
                    group_media.send_group_media(&peer_media);
                }
            }
        }
    }

    /// Handles a group begin (0E): answer with our first report.
    pub fn handle_group_begin(&self, peer_id: &PeerId) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let session = match state.peers.get(peer_id) {
            Some(e) => e.session.clone(),
            None => return,
        };
        if !state.heard.contains(peer_id) || session.group_first_report_sent() {
            return;
        }
        self.send_group_report_locked(&mut state, &session, true, now);
        state.last_report = Some(now);
    }

    /// Handles a stream advertised by a peer. Returns false to reject.
    pub fn handle_new_media(&self, ev: &NewMediaEvent) -> bool {
        if ev.stream_name != self.stream_name {
            info!(stream = %ev.stream_name, "new stream available in the group but not registered");
            return false;
        }
        let mut state = self.state.lock().unwrap();
        let group_media = match state.group_medias.get(&ev.stream_key) {
            Some(m) => m.clone(),
            None => {
                let mut media_config = self.config.media.clone();
                media_config.is_publisher = false;
                media::read_group_config(&mut media_config, &mut Reader::new(&ev.params));
                self.create_group_media_locked(&mut state, ev.stream_key.clone(), media_config)
            }
        };
        group_media.add_peer(ev.peer_id, &ev.peer_media);
        true
    }

    /// Ask-close policy: accept unless the asker is one of our targets.
    pub fn handle_ask_close(&self, peer_id: &PeerId) -> bool {
        let state = self.state.lock().unwrap();
        if state.best_list.is_empty() {
            return true;
        }
        !state.best_list.contains(peer_id)
    }

    /// Broadcasts an AMF call through every group media.
    pub fn call_function(&self, name: &str, args: &[&str]) -> u32 {
        let medias: Vec<Arc<GroupMedia>> = self
            .state
            .lock()
            .unwrap()
            .group_medias
            .values()
            .cloned()
            .collect();
        for media in medias {
            media.call_function(name, args);
        }
        1
    }

    fn create_group_media_locked(
        &self,
        state: &mut NetGroupState,
        stream_key: StreamKey,
        media_config: GroupConfig,
    ) -> Arc<GroupMedia> {
        let id = state.next_media_id;
        state.next_media_id += 1;
        let group_media = GroupMedia::new(id, &self.stream_name, stream_key.clone(), media_config);

        let api = self.api.clone();
        let stream = self.stream_name.clone();
        let sub = group_media.on_packet.subscribe(move |pkt| {
            api.push_media(&stream, pkt.time, &pkt.payload, pkt.lost_rate, pkt.audio);
        });
        state.group_medias.insert(stream_key.clone(), group_media.clone());
        state.media_subs.insert(stream_key, sub);
        group_media
    }

    fn ensure_listener_locked(&self, state: &mut NetGroupState) {
        let key = match &state.publisher_key {
            Some(k) => k.clone(),
            None => return,
        };
        if state.listener.is_some() {
            return;
        }
        let group_media = match state.group_medias.get(&key) {
            Some(m) => m.clone(),
            None => return,
        };
        let listener = match self.api.start_listening(&self.stream_name, &self.id_txt) {
            Some(l) => l,
            None => {
                warn!(stream = %self.stream_name, "unable to start the group listener");
                return;
            }
        };
        info!(stream = %self.stream_name, "first viewer play request, starting to play stream");
        let weak = Arc::downgrade(&group_media);
        let sub = listener.on_media.subscribe(move |pkt| {
            if let Some(media) = weak.upgrade() {
                media.publish(pkt.time, &pkt.payload, pkt.audio);
            }
        });
        state.listener = Some((listener, sub));
        self.api.set_publish_ready();
    }

    /// Detaches the publisher listener, if running.
    pub fn stop_listener(&self) {
        let taken = {
            let mut state = self.state.lock().unwrap();
            let taken = state.listener.take();
            if taken.is_some() {
                state.publisher_key = None;
            }
            taken
        };
        if let Some((listener, sub)) = taken {
            listener.on_media.unsubscribe(sub);
            self.api.stop_listening(&self.id_txt);
        }
    }

    /// Leaves the group: stops publishing and detaches every peer.
    pub fn close(&self) {
        self.stop_listener();
        let mut state = self.state.lock().unwrap();
        let subs: Vec<(StreamKey, SubscriptionId)> = state.media_subs.drain().collect();
        for (key, sub) in subs {
            if let Some(media) = state.group_medias.get(&key) {
                media.on_packet.unsubscribe(sub);
            }
        }
        state.group_medias.clear();
        let peer_ids: Vec<PeerId> = state.peers.keys().copied().collect();
        for peer_id in peer_ids {
            self.remove_peer_locked(&mut state, &peer_id);
        }
    }
}
