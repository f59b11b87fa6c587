//! Whole-overlay scenarios driven through an in-memory transport.
//!
//! Every peer's inbox is registered with a shared `MemoryTransport`; a send
//! pushes the encoded frame straight into the target inbox. Tests advance
//! the overlay by ticking every peer a few rounds.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use overlayd::address::Address;
use overlayd::error::TransportError;
use overlayd::network::client::Transport;
use overlayd::network::message::{Packet, PacketBody, ReunionKind};
use overlayd::network::server::InboxSender;
use overlayd::network::wire;
use overlayd::peer::{Peer, PeerOptions, PeerStatus, ReunionMode, ReunionOutcome};

const SETTLE_ROUNDS: usize = 8;

#[derive(Default)]
struct MemoryTransport {
    inboxes: Mutex<HashMap<Address, InboxSender>>,
    down: Mutex<HashSet<Address>>,
    log: Mutex<Vec<(Address, Packet)>>,
}

impl MemoryTransport {
    fn connect(&self, peer: &Peer) {
        self.inboxes.lock().insert(peer.address(), peer.inbox());
    }

    fn take_down(&self, address: Address) {
        self.down.lock().insert(address);
    }

    fn take_log(&self) -> Vec<(Address, Packet)> {
        std::mem::take(&mut *self.log.lock())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: Address, frame: Bytes) -> Result<(), TransportError> {
        if self.down.lock().contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        let inbox = self
            .inboxes
            .lock()
            .get(&to)
            .cloned()
            .ok_or(TransportError::Unreachable(to))?;
        if let Ok(packet) = wire::decode(&frame) {
            self.log.lock().push((to, packet));
        }
        inbox.send(frame).map_err(|_| TransportError::InboxClosed)
    }
}

fn root_addr() -> Address {
    Address::new([10, 0, 0, 1], 5050)
}

fn peer_addr(n: u8) -> Address {
    Address::new([10, 0, 0, 1 + n], 6000 + n as u16)
}

struct Overlay {
    transport: Arc<MemoryTransport>,
    root: Peer,
    leaves: Vec<Peer>,
}

impl Overlay {
    fn new(leaf_count: u8) -> Self {
        let transport = Arc::new(MemoryTransport::default());
        let root = Peer::root(root_addr(), transport.clone(), PeerOptions::default());
        transport.connect(&root);

        let leaves: Vec<Peer> = (1..=leaf_count)
            .map(|n| {
                let leaf = Peer::leaf(
                    peer_addr(n),
                    root_addr(),
                    transport.clone(),
                    PeerOptions::default(),
                );
                transport.connect(&leaf);
                leaf
            })
            .collect();

        Self {
            transport,
            root,
            leaves,
        }
    }

    fn leaf(&self, n: usize) -> &Peer {
        &self.leaves[n - 1]
    }

    async fn settle(&self) {
        for _ in 0..SETTLE_ROUNDS {
            self.root.tick().await;
            for leaf in &self.leaves {
                leaf.tick().await;
            }
        }
    }

    /// Register and place the leaves one at a time, in order.
    async fn join_all(&self) {
        for leaf in &self.leaves {
            leaf.register().unwrap();
            self.settle().await;
        }
    }
}

#[tokio::test]
async fn test_end_to_end_join_sequence() {
    let overlay = Overlay::new(2);
    let (root, first, second) = (&overlay.root, overlay.leaf(1), overlay.leaf(2));

    first.register().unwrap();
    overlay.settle().await;

    assert!(root.is_registered(first.address()));
    assert_eq!(first.status(), PeerStatus::Attached);
    assert_eq!(first.parent(), Some(root_addr()));
    assert_eq!(root.children(), vec![first.address()]);

    second.register().unwrap();
    overlay.settle().await;

    // Deepest-first placement: under the first peer, not beside it
    assert_eq!(second.parent(), Some(first.address()));
    assert_eq!(first.children(), vec![second.address()]);
    assert_eq!(root.children(), vec![first.address()]);

    let graph = root.graph_snapshot().unwrap();
    let levels: HashMap<Address, u8> = graph.iter().map(|n| (n.address, n.level)).collect();
    assert_eq!(levels[&root_addr()], 0);
    assert_eq!(levels[&first.address()], 1);
    assert_eq!(levels[&second.address()], 2);
}

#[tokio::test]
async fn test_advertise_without_registration_gets_no_reply() {
    let overlay = Overlay::new(1);
    let leaf = overlay.leaf(1);

    leaf.advertise().unwrap();
    overlay.settle().await;

    assert_eq!(leaf.parent(), None);
    assert_eq!(leaf.status(), PeerStatus::Unregistered);
    let replies: Vec<_> = overlay
        .transport
        .take_log()
        .into_iter()
        .filter(|(to, _)| *to == leaf.address())
        .collect();
    assert!(replies.is_empty());
}

#[tokio::test]
async fn test_broadcast_does_not_echo() {
    let overlay = Overlay::new(3);
    overlay.join_all().await;

    // Tree: root - 1 - 2 - 3
    let (root, first, second, third) = (
        &overlay.root,
        overlay.leaf(1),
        overlay.leaf(2),
        overlay.leaf(3),
    );
    assert_eq!(third.parent(), Some(second.address()));

    let mut at_root = root.subscribe_messages();
    let mut at_first = first.subscribe_messages();
    let mut at_second = second.subscribe_messages();
    let mut at_third = third.subscribe_messages();
    overlay.transport.take_log();

    assert_eq!(second.broadcast_message("hello tree").unwrap(), 2);
    overlay.settle().await;

    assert_eq!(at_first.try_recv().unwrap().from, second.address());
    assert_eq!(at_third.try_recv().unwrap().from, second.address());
    let relayed = at_root.try_recv().unwrap();
    assert_eq!(relayed.from, first.address());
    assert_eq!(relayed.text, "hello tree");

    // Nobody sends it back the way it came
    assert!(at_second.try_recv().is_err());
    assert!(at_root.try_recv().is_err());
    let messages: Vec<_> = overlay
        .transport
        .take_log()
        .into_iter()
        .filter(|(_, p)| matches!(p.body(), Ok(PacketBody::Message(_))))
        .collect();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|(to, _)| *to != second.address()));
}

#[tokio::test]
async fn test_reunion_path_symmetry() {
    let overlay = Overlay::new(3);
    overlay.join_all().await;
    let third = overlay.leaf(3);
    let chain = [
        third.address(),
        overlay.leaf(2).address(),
        overlay.leaf(1).address(),
    ];
    overlay.transport.take_log();

    let start = Instant::now();
    assert!(matches!(
        third.reunion_round(start),
        ReunionOutcome::HelloSent { .. }
    ));
    overlay.settle().await;

    let log = overlay.transport.take_log();
    let hello_at_root = log
        .iter()
        .find_map(|(to, p)| match p.body() {
            Ok(PacketBody::Reunion {
                kind: ReunionKind::Hello,
                path,
            }) if *to == root_addr() => Some(path),
            _ => None,
        })
        .unwrap();
    assert_eq!(hello_at_root, chain.to_vec());

    let backs: Vec<(Address, Vec<Address>)> = log
        .iter()
        .filter_map(|(to, p)| match p.body() {
            Ok(PacketBody::Reunion {
                kind: ReunionKind::HelloBack,
                path,
            }) => Some((*to, path)),
            _ => None,
        })
        .collect();
    let mut reversed = chain.to_vec();
    reversed.reverse();
    assert_eq!(backs[0], (chain[2], reversed.clone()));
    assert_eq!(backs.last().unwrap(), &(chain[0], vec![chain[0]]));
    assert_eq!(backs.len(), chain.len());

    // The round trip was acknowledged, so a much later round still says hello
    assert!(matches!(
        third.reunion_round(start + Duration::from_secs(100)),
        ReunionOutcome::HelloSent { .. }
    ));
    // Without an answer to that one, the next round fails
    assert_eq!(
        third.reunion_round(start + Duration::from_secs(200)),
        ReunionOutcome::Failed
    );
}

#[tokio::test]
async fn test_failed_peer_reattaches_after_parent_dies() {
    let overlay = Overlay::new(2);
    overlay.join_all().await;
    let (root, first, second) = (&overlay.root, overlay.leaf(1), overlay.leaf(2));
    assert_eq!(second.parent(), Some(first.address()));

    overlay.transport.take_down(first.address());

    // Root hears nothing from either and expires the subtree
    let sweep = root.reunion_round(Instant::now() + Duration::from_secs(30));
    match sweep {
        ReunionOutcome::RootSweep { expired } => assert!(expired.contains(&first.address())),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(root.children().is_empty());

    // Hellos towards the dead parent never come back
    let start = Instant::now();
    second.reunion_round(start + Duration::from_secs(40));
    second.tick().await;
    assert_eq!(
        second.reunion_round(start + Duration::from_secs(41)),
        ReunionOutcome::Failed
    );
    assert_eq!(second.reunion_mode(), ReunionMode::Failed);

    // Re-advertise over the registration connection, then rejoin under the root
    for _ in 0..SETTLE_ROUNDS {
        second.tick().await;
        root.tick().await;
    }
    assert_eq!(second.status(), PeerStatus::Attached);
    assert_eq!(second.parent(), Some(root_addr()));
    assert_eq!(root.children(), vec![second.address()]);
    let level = root
        .graph_snapshot()
        .unwrap()
        .into_iter()
        .find(|n| n.address == second.address())
        .map(|n| n.level);
    assert_eq!(level, Some(1));
}

#[tokio::test]
async fn test_root_ignores_hello_from_orphan() {
    let overlay = Overlay::new(2);
    overlay.join_all().await;
    let (root, second) = (&overlay.root, overlay.leaf(2));

    // The whole silent branch expires; a late hello from it is not answered
    let later = Instant::now() + Duration::from_secs(30);
    root.reunion_round(later);
    overlay.transport.take_log();

    let hello = Packet::reunion_hello(second.address(), &[second.address()]).unwrap();
    root.inbox().send(wire::encode(&hello)).unwrap();
    root.tick().await;
    assert!(overlay.transport.take_log().is_empty());
}
