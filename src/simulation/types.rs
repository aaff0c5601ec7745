//! Type definitions shared across the simulation.
//!
//! Contains identifiers, link descriptors and the property map carried by
//! every node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed node attributes (color, icon, size, user state).
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Stable node identity, unique and immutable for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObstacleId(pub u32);

impl fmt::Display for ObstacleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obstacle-{}", self.0)
    }
}

/// Wireless links are derived each tick; wired links are explicit and persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Wireless,
    Wired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOrientation {
    Undirected,
    Directed,
}

/// A connection between two nodes.
///
/// Undirected links are stored with `source < destination` so the same pair
/// always compares equal regardless of the order it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub source: NodeId,
    pub destination: NodeId,
    pub kind: LinkKind,
    pub orientation: LinkOrientation,
}

impl Link {
    pub fn undirected(a: NodeId, b: NodeId, kind: LinkKind) -> Self {
        let (source, destination) = if a <= b { (a, b) } else { (b, a) };
        Self {
            source,
            destination,
            kind,
            orientation: LinkOrientation::Undirected,
        }
    }

    pub fn directed(from: NodeId, to: NodeId, kind: LinkKind) -> Self {
        Self {
            source: from,
            destination: to,
            kind,
            orientation: LinkOrientation::Directed,
        }
    }

    pub fn is_directed(&self) -> bool {
        self.orientation == LinkOrientation::Directed
    }

    pub fn touches(&self, id: NodeId) -> bool {
        self.source == id || self.destination == id
    }

    /// The endpoint opposite to `id`, if `id` is an endpoint at all.
    pub fn other_end(&self, id: NodeId) -> Option<NodeId> {
        if self.source == id {
            Some(self.destination)
        } else if self.destination == id {
            Some(self.source)
        } else {
            None
        }
    }

    /// Whether a message can travel `from` → `to` over this link.
    pub fn carries(&self, from: NodeId, to: NodeId) -> bool {
        match self.orientation {
            LinkOrientation::Undirected => (self.source == from && self.destination == to) || (self.source == to && self.destination == from),
            LinkOrientation::Directed => self.source == from && self.destination == to,
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.orientation {
            LinkOrientation::Undirected => "--",
            LinkOrientation::Directed => "->",
        };
        let kind = match self.kind {
            LinkKind::Wireless => "wireless",
            LinkKind::Wired => "wired",
        };
        write!(f, "{} {} {} ({})", self.source, arrow, self.destination, kind)
    }
}
