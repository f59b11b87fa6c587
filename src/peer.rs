//! Overlay peer state machine.
//!
//! A [`Peer`] owns everything one overlay process knows: its role, its parent
//! and children, the reunion bookkeeping and, on the root, the
//! [`NetworkGraph`] and the registration allow-list. Three tasks share it:
//!
//! - the transport accept loop pushes raw frames into the inbox,
//! - [`Peer::run_ticks`] drains the inbox, dispatches and flushes outboxes,
//! - the reunion scheduler calls [`Peer::reunion_round`].
//!
//! Each piece of state sits behind its own lock and no lock is held across
//! an `.await`; all network I/O happens in [`Peer::tick`].

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::constants::protocol::{HEADER_LEN, MAX_FRAME_SIZE};
use crate::constants::timing::{PEER_PENDING_TIMEOUT_SECS, ROOT_HEARTBEAT_TIMEOUT_SECS};
use crate::constants::topology::MAX_CHILDREN;
use crate::network::client::Transport;
use crate::network::message::{Packet, PacketBody, PacketType, ReunionKind};
use crate::network::peer_connection_registry::{FlushReport, PeerConnectionRegistry};
use crate::network::server::InboxSender;
use crate::network::wire;
use crate::network_graph::{NetworkGraph, NodeSummary};

const MESSAGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Root,
    Leaf,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Root => write!(f, "root"),
            Role::Leaf => write!(f, "peer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReunionMode {
    Acceptance,
    /// Lost contact with the root; only Advertise traffic is processed
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Root,
    Unregistered,
    Registered,
    Attached,
    Failed,
}

/// What the dispatcher did with one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// Valid, but not meant for this role or mode
    Ignored,
    /// Malformed, unauthorised or misrouted
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReunionOutcome {
    RootSweep { expired: Vec<Address> },
    HelloSent { parent: Address },
    /// Heartbeat timed out; an Advertise request was queued for the root
    Failed,
    /// Not attached yet
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Neighbor the message arrived from
    pub from: Address,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub frames: usize,
    pub handled: usize,
    pub flush: FlushReport,
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Advertise as soon as the root acknowledges registration
    pub auto_join: bool,
    pub root_heartbeat_timeout: Duration,
    pub peer_pending_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            auto_join: true,
            root_heartbeat_timeout: Duration::from_secs(ROOT_HEARTBEAT_TIMEOUT_SECS),
            peer_pending_timeout: Duration::from_secs(PEER_PENDING_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("{0} is not available on the root")]
    NotOnRoot(&'static str),

    #[error("message of {size} bytes does not fit in a frame (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

struct PeerState {
    parent: Option<Address>,
    children: Vec<Address>,
    /// Last Join or Hello heard from each child
    child_seen: HashMap<Address, Instant>,
    reunion_mode: ReunionMode,
    registered_with_root: bool,
    last_hello_sent_at: Instant,
    last_hello_ack_at: Instant,
}

pub struct Peer {
    address: Address,
    role: Role,
    root_address: Address,
    options: PeerOptions,
    state: RwLock<PeerState>,
    /// Root only
    graph: Option<Mutex<NetworkGraph>>,
    /// Root only: addresses allowed to Advertise
    registered: Mutex<HashSet<Address>>,
    connections: PeerConnectionRegistry,
    transport: Arc<dyn Transport>,
    inbox_tx: InboxSender,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    reunion_active: watch::Sender<bool>,
    messages: broadcast::Sender<DeliveredMessage>,
}

impl Peer {
    pub fn root(address: Address, transport: Arc<dyn Transport>, options: PeerOptions) -> Self {
        Self::new(address, Role::Root, address, transport, options)
    }

    pub fn leaf(
        address: Address,
        root_address: Address,
        transport: Arc<dyn Transport>,
        options: PeerOptions,
    ) -> Self {
        Self::new(address, Role::Leaf, root_address, transport, options)
    }

    fn new(
        address: Address,
        role: Role,
        root_address: Address,
        transport: Arc<dyn Transport>,
        options: PeerOptions,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        // The root answers heartbeats from the start; a leaf waits for its first parent
        let (reunion_active, _) = watch::channel(role == Role::Root);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let graph = match role {
            Role::Root => Some(Mutex::new(NetworkGraph::new(address))),
            Role::Leaf => None,
        };
        let now = Instant::now();

        Self {
            address,
            role,
            root_address,
            options,
            state: RwLock::new(PeerState {
                parent: None,
                children: Vec::new(),
                child_seen: HashMap::new(),
                reunion_mode: ReunionMode::Acceptance,
                registered_with_root: false,
                last_hello_sent_at: now,
                last_hello_ack_at: now,
            }),
            graph,
            registered: Mutex::new(HashSet::new()),
            connections: PeerConnectionRegistry::new(),
            transport,
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            reunion_active,
            messages,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_root(&self) -> bool {
        self.role == Role::Root
    }

    pub fn root_address(&self) -> Address {
        self.root_address
    }

    pub fn parent(&self) -> Option<Address> {
        self.state.read().parent
    }

    pub fn children(&self) -> Vec<Address> {
        self.state.read().children.clone()
    }

    /// Parent first, then children in join order.
    pub fn neighbors(&self) -> Vec<Address> {
        let state = self.state.read();
        let mut neighbors: Vec<Address> = state.parent.into_iter().collect();
        for child in &state.children {
            if !neighbors.contains(child) {
                neighbors.push(*child);
            }
        }
        neighbors
    }

    pub fn reunion_mode(&self) -> ReunionMode {
        self.state.read().reunion_mode
    }

    pub fn status(&self) -> PeerStatus {
        if self.is_root() {
            return PeerStatus::Root;
        }
        let state = self.state.read();
        match (state.reunion_mode, state.parent, state.registered_with_root) {
            (ReunionMode::Failed, _, _) => PeerStatus::Failed,
            (ReunionMode::Acceptance, Some(_), _) => PeerStatus::Attached,
            (ReunionMode::Acceptance, None, true) => PeerStatus::Registered,
            (ReunionMode::Acceptance, None, false) => PeerStatus::Unregistered,
        }
    }

    pub fn is_registered(&self, address: Address) -> bool {
        self.registered.lock().contains(&address)
    }

    /// Handle for the transport server to deliver raw frames.
    pub fn inbox(&self) -> InboxSender {
        self.inbox_tx.clone()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<DeliveredMessage> {
        self.messages.subscribe()
    }

    /// Flips to `true` once reunion rounds should run.
    pub fn reunion_watch(&self) -> watch::Receiver<bool> {
        self.reunion_active.subscribe()
    }

    pub fn connections(&self) -> &PeerConnectionRegistry {
        &self.connections
    }

    pub fn graph_snapshot(&self) -> Option<Vec<NodeSummary>> {
        self.graph.as_ref().map(|g| g.lock().snapshot())
    }

    /// Ask the root to put this peer on its allow-list.
    pub fn register(&self) -> Result<(), PeerError> {
        if self.is_root() {
            return Err(PeerError::NotOnRoot("register"));
        }
        self.connections.add(self.root_address, true);
        self.connections.enqueue(
            self.root_address,
            Packet::register_request(self.address, self.address),
            true,
        );
        info!("📝 Registering with root {}", self.root_address);
        Ok(())
    }

    /// Ask the root for a place in the tree.
    pub fn advertise(&self) -> Result<(), PeerError> {
        if self.is_root() {
            return Err(PeerError::NotOnRoot("advertise"));
        }
        self.queue_advertise();
        info!("📣 Asking root {} for a neighbor", self.root_address);
        Ok(())
    }

    /// Send `text` to every neighbor. Returns how many neighbors it was queued for.
    pub fn broadcast_message(&self, text: &str) -> Result<usize, PeerError> {
        let size = HEADER_LEN + text.len();
        if size > MAX_FRAME_SIZE {
            return Err(PeerError::MessageTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let packet = Packet::message(self.address, text);
        let neighbors = self.neighbors();
        for neighbor in &neighbors {
            self.connections.enqueue(*neighbor, packet.clone(), false);
        }
        debug!("📤 Broadcast queued for {} neighbor(s)", neighbors.len());
        Ok(neighbors.len())
    }

    /// Decode one raw frame and dispatch it.
    pub fn handle_frame(&self, frame: &[u8]) -> Dispatch {
        match wire::decode(frame) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => {
                debug!("🚫 Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                Dispatch::Rejected
            }
        }
    }

    pub fn handle_packet(&self, packet: Packet) -> Dispatch {
        if !packet.is_well_formed() {
            debug!(
                "🚫 Dropping {:?} from {}: version {} length {} body {}",
                packet.packet_type(),
                packet.source(),
                packet.version(),
                packet.length(),
                packet.raw_body().len()
            );
            return Dispatch::Rejected;
        }

        if self.reunion_mode() == ReunionMode::Failed
            && packet.packet_type() != PacketType::Advertise
        {
            debug!(
                "Reunion failed, ignoring {:?} from {}",
                packet.packet_type(),
                packet.source()
            );
            return Dispatch::Ignored;
        }

        let body = match packet.body() {
            Ok(body) => body,
            Err(e) => {
                debug!("🚫 Dropping packet from {}: {}", packet.source(), e);
                return Dispatch::Rejected;
            }
        };

        let source = packet.source();
        match body {
            PacketBody::RegisterRequest { requester } => self.on_register_request(source, requester),
            PacketBody::RegisterResponse => self.on_register_response(source),
            PacketBody::AdvertiseRequest => self.on_advertise_request(source),
            PacketBody::AdvertiseResponse { neighbor } => self.on_advertise_response(source, neighbor),
            PacketBody::Join => self.on_join(source),
            PacketBody::Message(text) => self.on_message(source, text),
            PacketBody::Reunion {
                kind: ReunionKind::Hello,
                path,
            } => self.on_reunion_hello(path),
            PacketBody::Reunion {
                kind: ReunionKind::HelloBack,
                path,
            } => self.on_reunion_hello_back(path),
        }
    }

    fn on_register_request(&self, source: Address, requester: Address) -> Dispatch {
        if !self.is_root() {
            return Dispatch::Ignored;
        }
        if requester != source {
            warn!(
                "⚠️ Register request from {} names {}, registering the sender",
                source, requester
            );
        }
        if !self.registered.lock().insert(source) {
            debug!("{} is already registered", source);
            return Dispatch::Handled;
        }

        self.connections.add(source, true);
        self.connections
            .enqueue(source, Packet::register_response(self.address), true);
        info!("📝 Registered {}", source);
        Dispatch::Handled
    }

    fn on_register_response(&self, source: Address) -> Dispatch {
        if self.is_root() {
            info!("Register acknowledgment from {}", source);
            return Dispatch::Handled;
        }
        if source != self.root_address {
            warn!("⚠️ Register response from non-root {}", source);
            return Dispatch::Rejected;
        }

        let needs_parent = {
            let mut state = self.state.write();
            state.registered_with_root = true;
            state.parent.is_none()
        };
        info!("✅ Registered with root {}", source);

        if self.options.auto_join && needs_parent {
            self.queue_advertise();
        }
        Dispatch::Handled
    }

    fn on_advertise_request(&self, source: Address) -> Dispatch {
        let Some(graph) = &self.graph else {
            return Dispatch::Ignored;
        };
        if !self.is_registered(source) {
            warn!("🚫 Advertise request from unregistered {}", source);
            return Dispatch::Rejected;
        }

        let placement = {
            let mut graph = graph.lock();
            let previous_parent = graph.node(source).and_then(|n| n.parent);
            match graph.place(source) {
                None => None,
                Some(neighbor) => match graph.attach(source, neighbor) {
                    Ok(level) => Some((neighbor, level, previous_parent)),
                    Err(e) => {
                        warn!("❌ Could not attach {} under {}: {}", source, neighbor, e);
                        return Dispatch::Rejected;
                    }
                },
            }
        };

        let Some((neighbor, level, previous_parent)) = placement else {
            warn!("🚧 Network full, no neighbor available for {}", source);
            return Dispatch::Handled;
        };

        // Moved away from the root: it is no longer one of our children
        if previous_parent == Some(self.address) && neighbor != self.address {
            self.drop_child(source);
        }

        self.connections.add(source, true);
        self.connections.enqueue(
            source,
            Packet::advertise_response(self.address, neighbor),
            true,
        );
        info!("🧭 Placed {} under {} at level {}", source, neighbor, level);
        Dispatch::Handled
    }

    fn on_advertise_response(&self, source: Address, neighbor: Address) -> Dispatch {
        if self.is_root() {
            return Dispatch::Ignored;
        }
        if source != self.root_address {
            warn!("⚠️ Advertise response from non-root {}", source);
            return Dispatch::Rejected;
        }

        let now = Instant::now();
        let stale_parent = {
            let mut state = self.state.write();
            let previous = state.parent.replace(neighbor);
            state.reunion_mode = ReunionMode::Acceptance;
            state.registered_with_root = true;
            state.last_hello_sent_at = now;
            state.last_hello_ack_at = now;
            previous.filter(|p| *p != neighbor && !state.children.contains(p))
        };

        if let Some(old) = stale_parent {
            self.connections.remove(old, false);
            info!("🔀 Leaving previous parent {}", old);
        }
        self.connections.add(neighbor, false);
        self.connections
            .enqueue(neighbor, Packet::join(self.address), false);
        self.reunion_active.send_replace(true);

        info!("🔗 Joining parent {}", neighbor);
        Dispatch::Handled
    }

    /// A full child list means one entry has moved on: the child heard from
    /// least recently makes room for the newcomer.
    fn on_join(&self, source: Address) -> Dispatch {
        let now = Instant::now();
        let (evicted, parent) = {
            let mut state = self.state.write();
            let mut evicted = None;
            if !state.children.contains(&source) {
                if state.children.len() >= MAX_CHILDREN {
                    evicted = state
                        .children
                        .iter()
                        .copied()
                        .min_by_key(|c| state.child_seen.get(c).copied().unwrap_or(now));
                    if let Some(old) = evicted {
                        state.children.retain(|c| *c != old);
                        state.child_seen.remove(&old);
                    }
                }
                state.children.push(source);
            }
            state.child_seen.insert(source, now);
            (evicted, state.parent)
        };

        if let Some(old) = evicted {
            if parent != Some(old) {
                self.connections.remove(old, false);
            }
            warn!("🔀 Child {} replaced by {}", old, source);
        }
        self.connections.add(source, false);
        info!("🤝 {} joined as a child", source);
        Dispatch::Handled
    }

    fn on_message(&self, source: Address, text: String) -> Dispatch {
        let neighbors = self.neighbors();
        if !neighbors.contains(&source) {
            debug!("🚫 Message from non-neighbor {} dropped", source);
            return Dispatch::Rejected;
        }

        info!("💬 {}: {}", source, text);
        let packet = Packet::message(self.address, &text);
        for neighbor in neighbors.into_iter().filter(|n| *n != source) {
            self.connections.enqueue(neighbor, packet.clone(), false);
        }

        // Nobody listening is fine
        let _ = self.messages.send(DeliveredMessage { from: source, text });
        Dispatch::Handled
    }

    fn on_reunion_hello(&self, mut path: Vec<Address>) -> Dispatch {
        if let Some(&from) = path.last() {
            let mut state = self.state.write();
            if state.children.contains(&from) {
                state.child_seen.insert(from, Instant::now());
            }
        }

        if let Some(graph) = &self.graph {
            let Some(&origin) = path.first() else {
                return Dispatch::Rejected;
            };
            if !graph.lock().keep_alive(origin) {
                debug!("Hello from {} not answered: not reachable in the tree", origin);
                return Dispatch::Ignored;
            }

            path.reverse();
            let next = path[0];
            return match Packet::reunion_hello_back(self.address, &path) {
                Ok(packet) => {
                    self.connections.enqueue(next, packet, false);
                    debug!("💓 Hello from {} answered via {}", origin, next);
                    Dispatch::Handled
                }
                Err(e) => {
                    warn!("❌ Cannot build hello-back for {}: {}", origin, e);
                    Dispatch::Rejected
                }
            };
        }

        let Some(parent) = self.parent() else {
            debug!("Hello with no parent to forward to");
            return Dispatch::Ignored;
        };
        path.push(self.address);
        match Packet::reunion_hello(self.address, &path) {
            Ok(packet) => {
                self.connections.enqueue(parent, packet, false);
                Dispatch::Handled
            }
            Err(e) => {
                warn!("❌ Cannot forward hello: {}", e);
                Dispatch::Rejected
            }
        }
    }

    fn on_reunion_hello_back(&self, mut path: Vec<Address>) -> Dispatch {
        if self.is_root() {
            return Dispatch::Ignored;
        }

        if path.last() == Some(&self.address) {
            let mut state = self.state.write();
            // Never earlier than the hello it answers
            state.last_hello_ack_at = Instant::now().max(state.last_hello_sent_at);
            drop(state);
            debug!("💓 Reunion round-trip complete");
            return Dispatch::Handled;
        }

        if path.first() != Some(&self.address) {
            debug!("🚫 Hello-back not routed through us: {:?}", path);
            return Dispatch::Rejected;
        }
        path.remove(0);
        let Some(&next) = path.first() else {
            return Dispatch::Rejected;
        };

        match Packet::reunion_hello_back(self.address, &path) {
            Ok(packet) => {
                self.connections.enqueue(next, packet, false);
                Dispatch::Handled
            }
            Err(e) => {
                warn!("❌ Cannot forward hello-back: {}", e);
                Dispatch::Rejected
            }
        }
    }

    /// One reunion step: the root expires silent nodes, a leaf either sends a
    /// fresh hello or declares failure and re-advertises.
    pub fn reunion_round(&self, now: Instant) -> ReunionOutcome {
        match &self.graph {
            Some(graph) => self.root_sweep(graph, now),
            None => self.leaf_round(now),
        }
    }

    fn root_sweep(&self, graph: &Mutex<NetworkGraph>, now: Instant) -> ReunionOutcome {
        let (expired, remaining) = {
            let mut graph = graph.lock();
            let stale = graph.stale_nodes(now, self.options.root_heartbeat_timeout);
            let expired: Vec<Address> = stale
                .into_iter()
                .filter(|address| match graph.expire(*address) {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("Skipping expiry of {}: {}", address, e);
                        false
                    }
                })
                .collect();
            (expired, graph.node_count())
        };

        for address in &expired {
            self.connections.remove(*address, false);
            self.drop_child(*address);
            warn!("⏱️ Expired {} after missed heartbeats", address);
        }
        if !expired.is_empty() {
            info!("🌳 Tree table now holds {} node(s)", remaining);
        }
        ReunionOutcome::RootSweep { expired }
    }

    fn leaf_round(&self, now: Instant) -> ReunionOutcome {
        let mut state = self.state.write();
        let Some(parent) = state.parent else {
            return ReunionOutcome::Idle;
        };

        let pending = state
            .last_hello_sent_at
            .saturating_duration_since(state.last_hello_ack_at);
        if pending > self.options.peer_pending_timeout {
            let newly_failed = state.reunion_mode != ReunionMode::Failed;
            state.reunion_mode = ReunionMode::Failed;
            drop(state);

            if newly_failed {
                warn!(
                    "💔 No hello-back for {}s, disconnected from root; re-advertising",
                    pending.as_secs()
                );
            }
            self.queue_advertise();
            return ReunionOutcome::Failed;
        }

        state.last_hello_sent_at = now;
        drop(state);

        match Packet::reunion_hello(self.address, &[self.address]) {
            Ok(packet) => {
                self.connections.enqueue(parent, packet, false);
                debug!("💓 Hello sent to {}", parent);
            }
            Err(e) => warn!("❌ Cannot build hello: {}", e),
        }
        ReunionOutcome::HelloSent { parent }
    }

    /// Drain the inbox, dispatch every frame, then flush. While reunion has
    /// failed only registration connections are flushed.
    pub async fn tick(&self) -> TickReport {
        let frames: Vec<Bytes> = {
            let mut inbox = self.inbox_rx.lock();
            std::iter::from_fn(|| inbox.try_recv().ok()).collect()
        };

        let handled = frames
            .iter()
            .filter(|frame| self.handle_frame(frame) == Dispatch::Handled)
            .count();

        let only_register = self.reunion_mode() == ReunionMode::Failed;
        let flush = self
            .connections
            .flush(self.transport.as_ref(), only_register)
            .await;

        if !flush.failed.is_empty() {
            let neighbors = self.neighbors();
            for key in flush.failed.iter().filter(|k| neighbors.contains(&k.address)) {
                warn!(
                    "🔌 Lost connection to tree neighbor {}; repair is left to reunion",
                    key.address
                );
            }
        }

        TickReport {
            frames: frames.len(),
            handled,
            flush,
        }
    }

    pub async fn run_ticks(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tick loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.frames > 0 || report.flush.sent > 0 {
                        debug!(
                            "🔄 Tick: {} frame(s), {} handled, {} sent, {} dropped, {} connection(s)",
                            report.frames,
                            report.handled,
                            report.flush.sent,
                            report.flush.dropped,
                            self.connections.connection_count()
                        );
                    }
                }
            }
        }
    }

    fn queue_advertise(&self) {
        self.connections.add(self.root_address, true);
        self.connections
            .enqueue(self.root_address, Packet::advertise_request(self.address), true);
    }

    fn drop_child(&self, address: Address) {
        let mut state = self.state.write();
        state.children.retain(|c| *c != address);
        state.child_seen.remove(&address);
    }
}
