//! Node and link registries owned by the topology.
//!
//! Nodes iterate in insertion order. Links are kept in ordered sets so every
//! traversal (and therefore every notification batch) is deterministic.

use std::collections::{BTreeSet, HashMap};

use super::error::TopologyError;
use super::node::Node;
use super::types::{Link, NodeId};

/// Nodes in insertion order with an id index into the vector.
#[derive(Default)]
pub(crate) struct NodeRegistry {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> Result<(), TopologyError> {
        if self.index.contains_key(&node.id) {
            return Err(TopologyError::InvalidConfiguration(format!("node {} already exists", node.id)));
        }
        self.index.insert(node.id, self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let position = self.index.remove(&id)?;
        let node = self.nodes.remove(position);
        for later in &self.nodes[position..] {
            if let Some(slot) = self.index.get_mut(&later.id) {
                *slot -= 1;
            }
        }
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.index.get(&id).and_then(|&position| self.nodes.get(position))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let position = *self.index.get(&id)?;
        self.nodes.get_mut(position)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Node ids in insertion order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Links added and removed by one wireless recomputation.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct LinkDiff {
    pub added: Vec<Link>,
    pub removed: Vec<Link>,
}

impl LinkDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct LinkRegistry {
    wireless: BTreeSet<Link>,
    wired: BTreeSet<Link>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps in a freshly derived wireless link set in one step.
    pub fn replace_wireless(&mut self, next: BTreeSet<Link>) -> LinkDiff {
        let previous = std::mem::replace(&mut self.wireless, next);
        LinkDiff {
            added: self.wireless.difference(&previous).copied().collect(),
            removed: previous.difference(&self.wireless).copied().collect(),
        }
    }

    /// Returns false if the link was already present.
    pub fn add_wired(&mut self, link: Link) -> bool {
        self.wired.insert(link)
    }

    pub fn remove_wired(&mut self, link: &Link) -> bool {
        self.wired.remove(link)
    }

    pub fn contains(&self, link: &Link) -> bool {
        self.wired.contains(link) || self.wireless.contains(link)
    }

    /// Removes every link touching `id` and returns them.
    pub fn detach(&mut self, id: NodeId) -> Vec<Link> {
        let mut removed = self.detach_wireless(id);
        removed.extend(self.wired.iter().filter(|link| link.touches(id)).copied().collect::<Vec<_>>());
        self.wired.retain(|link| !link.touches(id));
        removed
    }

    pub fn detach_wireless(&mut self, id: NodeId) -> Vec<Link> {
        let removed: Vec<Link> = self.wireless.iter().filter(|link| link.touches(id)).copied().collect();
        self.wireless.retain(|link| !link.touches(id));
        removed
    }

    pub fn wireless(&self) -> impl Iterator<Item = &Link> {
        self.wireless.iter()
    }

    pub fn wired(&self) -> impl Iterator<Item = &Link> {
        self.wired.iter()
    }

    /// Wired links first, then wireless, each in canonical order.
    pub fn all(&self) -> Vec<Link> {
        self.wired.iter().chain(self.wireless.iter()).copied().collect()
    }

    /// Whether any link lets a message travel `from` → `to`.
    pub fn carries(&self, from: NodeId, to: NodeId) -> bool {
        self.wired.iter().chain(self.wireless.iter()).any(|link| link.carries(from, to))
    }

    /// Nodes `id` can send to.
    pub fn out_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.collect_ends(id, |link, other| link.carries(id, other))
    }

    /// Nodes that can send to `id`.
    pub fn in_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.collect_ends(id, |link, other| link.carries(other, id))
    }

    /// Nodes sharing any link with `id`, regardless of direction.
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.collect_ends(id, |_, _| true)
    }

    fn collect_ends(&self, id: NodeId, keep: impl Fn(&Link, NodeId) -> bool) -> Vec<NodeId> {
        let ends: BTreeSet<NodeId> = self
            .wired
            .iter()
            .chain(self.wireless.iter())
            .filter_map(|link| link.other_end(id).filter(|other| keep(link, *other)))
            .collect();
        ends.into_iter().collect()
    }
}
