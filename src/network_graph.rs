//! Root-side view of the overlay tree.
//!
//! Nodes are kept in a table keyed by address; parent and children links are
//! addresses resolved through that table. The tree is rooted at the owning
//! peer, every node has at most `MAX_CHILDREN` children and no node sits
//! deeper than `MAX_DEPTH`.
//!
//! Expiring a node removes only that node from the table. Its descendants stay
//! behind marked not-alive, with a parent link that may point at an address no
//! longer present, until their own heartbeats go stale or they re-attach.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::address::Address;
use crate::constants::topology::{MAX_CHILDREN, MAX_DEPTH};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("the root node cannot be re-attached or expired")]
    RootImmutable,
    #[error("node {0} is not in the graph")]
    UnknownNode(Address),
    #[error("parent {0} is not in the graph")]
    UnknownParent(Address),
    #[error("parent {0} already has {max} children", max = MAX_CHILDREN)]
    ParentFull(Address),
    #[error("attaching {address} would reach depth {depth}, limit is {max}", max = MAX_DEPTH)]
    DepthExceeded { address: Address, depth: u8 },
    #[error("attaching {address} under {parent} would create a cycle")]
    Cycle { address: Address, parent: Address },
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub address: Address,
    pub parent: Option<Address>,
    pub children: Vec<Address>,
    pub level: u8,
    pub is_alive: bool,
    pub last_heartbeat: Instant,
}

impl GraphNode {
    fn new(address: Address, parent: Option<Address>, level: u8) -> Self {
        Self {
            address,
            parent,
            children: Vec::with_capacity(MAX_CHILDREN),
            level,
            is_alive: true,
            last_heartbeat: Instant::now(),
        }
    }

    fn has_room(&self) -> bool {
        self.children.len() < MAX_CHILDREN
    }
}

/// Point-in-time description of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub address: Address,
    pub parent: Option<Address>,
    pub level: u8,
    pub children: Vec<Address>,
    pub alive: bool,
}

pub struct NetworkGraph {
    root: Address,
    nodes: HashMap<Address, GraphNode>,
}

impl NetworkGraph {
    pub fn new(root: Address) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(root, GraphNode::new(root, None, 0));
        Self { root, nodes }
    }

    /// Nodes in the table, root and not-alive entries included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.nodes.contains_key(&address)
    }

    pub fn node(&self, address: Address) -> Option<&GraphNode> {
        self.nodes.get(&address)
    }

    /// Addresses reachable from the root, breadth-first.
    pub fn level_order(&self) -> Vec<Address> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.root]);
        let mut seen = HashSet::new();

        while let Some(address) = queue.pop_front() {
            if !seen.insert(address) {
                continue;
            }
            if let Some(node) = self.nodes.get(&address) {
                order.push(address);
                queue.extend(node.children.iter().copied());
            }
        }
        order
    }

    /// Choose the neighbor a requester should join.
    ///
    /// Scans the tree deepest level first and returns the first alive node
    /// with a free child slot that is neither the sender nor related to it by
    /// ancestry. A not-alive sender is cut off from the tree, so its stale
    /// parent chain is not excluded. `None` means the network is full.
    pub fn place(&self, sender: Address) -> Option<Address> {
        let subtree_height = self.subtree_height(sender);
        let sender_attached = self.nodes.get(&sender).is_some_and(|n| n.is_alive);

        self.level_order().into_iter().rev().find(|&candidate| {
            let Some(node) = self.nodes.get(&candidate) else {
                return false;
            };
            candidate != sender
                && node.is_alive
                && node.level < MAX_DEPTH
                && node.level as usize + 1 + subtree_height <= MAX_DEPTH as usize
                && node.has_room()
                && !(sender_attached && self.is_ancestor(candidate, sender))
                && !self.is_ancestor(sender, candidate)
        })
    }

    /// Put `address` under `parent`, creating the node or re-parenting an
    /// existing one. Returns the node's new level.
    pub fn attach(&mut self, address: Address, parent: Address) -> Result<u8, GraphError> {
        if address == self.root {
            return Err(GraphError::RootImmutable);
        }
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(GraphError::UnknownParent(parent))?;

        if parent == address || self.is_ancestor(address, parent) {
            return Err(GraphError::Cycle { address, parent });
        }
        let already_child = parent_node.children.contains(&address);
        if !already_child && !parent_node.has_room() {
            return Err(GraphError::ParentFull(parent));
        }

        let level = parent_node.level + 1;
        let deepest = level as usize + self.subtree_height(address);
        if deepest > MAX_DEPTH as usize {
            return Err(GraphError::DepthExceeded {
                address,
                depth: deepest.min(u8::MAX as usize) as u8,
            });
        }

        let old_parent = match self.nodes.get_mut(&address) {
            Some(node) => {
                let old = node.parent.replace(parent);
                node.is_alive = true;
                node.last_heartbeat = Instant::now();
                old
            }
            None => {
                self.nodes
                    .insert(address, GraphNode::new(address, Some(parent), level));
                None
            }
        };

        if let Some(old) = old_parent.filter(|old| *old != parent) {
            if let Some(old_node) = self.nodes.get_mut(&old) {
                old_node.children.retain(|c| *c != address);
            }
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if !parent_node.children.contains(&address) {
                parent_node.children.push(address);
            }
        }
        self.relevel(address, level);

        debug!("🌳 Attached {} under {} at level {}", address, parent, level);
        Ok(level)
    }

    /// Remove a node, marking its whole subtree not-alive. Returns the
    /// subtree in breadth-first order, starting with the node itself.
    pub fn expire(&mut self, address: Address) -> Result<Vec<Address>, GraphError> {
        if address == self.root {
            return Err(GraphError::RootImmutable);
        }
        if !self.nodes.contains_key(&address) {
            return Err(GraphError::UnknownNode(address));
        }

        let subtree = self.subtree(address);
        for member in &subtree {
            if let Some(node) = self.nodes.get_mut(member) {
                node.is_alive = false;
            }
        }

        if let Some(parent) = self.nodes.get(&address).and_then(|n| n.parent) {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != address);
            }
        }
        self.nodes.remove(&address);

        debug!(
            "🪦 Expired {} ({} node(s) in subtree)",
            address,
            subtree.len()
        );
        Ok(subtree)
    }

    /// Record a heartbeat. A not-alive node is only revived while its parent
    /// is present, alive and still lists it as a child; returns whether the
    /// node counts as alive now.
    pub fn keep_alive(&mut self, address: Address) -> bool {
        let reachable = match self.nodes.get(&address) {
            None => return false,
            Some(node) if node.is_alive => true,
            Some(node) => node
                .parent
                .and_then(|p| self.nodes.get(&p))
                .map(|p| p.is_alive && p.children.contains(&address))
                .unwrap_or(false),
        };
        if !reachable {
            return false;
        }

        match self.nodes.get_mut(&address) {
            Some(node) => {
                node.is_alive = true;
                node.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Non-root nodes whose last heartbeat is older than `timeout` at `now`.
    pub fn stale_nodes(&self, now: Instant, timeout: Duration) -> Vec<Address> {
        let mut stale: Vec<Address> = self
            .nodes
            .values()
            .filter(|n| n.address != self.root)
            .filter(|n| now.saturating_duration_since(n.last_heartbeat) > timeout)
            .map(|n| n.address)
            .collect();
        stale.sort();
        stale
    }

    pub fn snapshot(&self) -> Vec<NodeSummary> {
        let mut nodes: Vec<NodeSummary> = self
            .nodes
            .values()
            .map(|n| NodeSummary {
                address: n.address,
                parent: n.parent,
                level: n.level,
                children: n.children.clone(),
                alive: n.is_alive,
            })
            .collect();
        nodes.sort_by_key(|n| (n.level, n.address));
        nodes
    }

    /// True if `ancestor` appears on the parent chain of `node`. Links to
    /// addresses that left the table still count.
    fn is_ancestor(&self, ancestor: Address, node: Address) -> bool {
        let mut current = self.nodes.get(&node).and_then(|n| n.parent);
        let mut steps = 0;
        while let Some(address) = current {
            if address == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                return false;
            }
            current = self.nodes.get(&address).and_then(|n| n.parent);
        }
        false
    }

    fn subtree(&self, address: Address) -> Vec<Address> {
        let mut members = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([address]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                members.push(current);
                queue.extend(node.children.iter().copied());
            }
        }
        members
    }

    /// Levels below `address`; 0 for a leaf or an unknown address.
    fn subtree_height(&self, address: Address) -> usize {
        let Some(base) = self.nodes.get(&address).map(|n| n.level as usize) else {
            return 0;
        };
        self.subtree(address)
            .iter()
            .filter_map(|a| self.nodes.get(a))
            .map(|n| (n.level as usize).saturating_sub(base))
            .max()
            .unwrap_or(0)
    }

    fn relevel(&mut self, address: Address, level: u8) {
        let mut queue = VecDeque::from([(address, level)]);
        let mut seen = HashSet::new();
        while let Some((current, level)) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&current) {
                node.level = level;
                queue.extend(node.children.iter().map(|c| (*c, level + 1)));
            }
        }
    }
}
