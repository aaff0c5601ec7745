//! Serializable bulk import/export form of a topology.
//!
//! Wireless links are derived state: they are written on export for
//! collaborators that render them, and ignored on import.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use super::error::TopologyError;
use super::geometry::Point;
use super::obstacle::Obstacle;
use super::types::{Link, NodeId, Properties};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Tick at export time. Informational only.
    #[serde(default)]
    pub tick: u64,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub wired_links: Vec<LinkRecord>,
    #[serde(default)]
    pub wireless_links: Vec<LinkRecord>,
    #[serde(default)]
    pub obstacles: Vec<Obstacle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub position: Point,
    #[serde(default)]
    pub direction: f64,
    /// Falls back to the topology default when absent.
    #[serde(default)]
    pub communication_range: Option<f64>,
    #[serde(default = "enabled")]
    pub wireless_enabled: bool,
    #[serde(default)]
    pub sensing_range: Option<f64>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn enabled() -> bool {
    true
}

impl NodeRecord {
    pub fn at(id: NodeId, position: Point) -> Self {
        Self {
            id,
            position,
            direction: 0.0,
            communication_range: None,
            wireless_enabled: true,
            sensing_range: None,
            properties: Properties::new(),
            tags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub source: NodeId,
    pub destination: NodeId,
    #[serde(default)]
    pub directed: bool,
}

impl From<&Link> for LinkRecord {
    fn from(link: &Link) -> Self {
        Self {
            source: link.source,
            destination: link.destination,
            directed: link.is_directed(),
        }
    }
}

impl TopologySnapshot {
    /// Checks the snapshot on its own: unique ids, finite geometry, wired
    /// links between listed nodes. Collisions with an existing topology are
    /// checked on import.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut ids = HashSet::new();
        for record in &self.nodes {
            if !ids.insert(record.id) {
                return Err(invalid(format!("duplicate node id {}", record.id)));
            }
            if !record.position.is_finite() || !record.direction.is_finite() {
                return Err(invalid(format!("node {} has a non-finite position or direction", record.id)));
            }
            let ranges = [("communication", record.communication_range), ("sensing", record.sensing_range)];
            for (name, range) in ranges.into_iter().filter_map(|(name, range)| range.map(|r| (name, r))) {
                if !range.is_finite() || range < 0.0 {
                    return Err(invalid(format!("node {} has invalid {} range {}", record.id, name, range)));
                }
            }
        }
        for link in &self.wired_links {
            if link.source == link.destination {
                return Err(invalid(format!("wired link {} -> {} is a self-link", link.source, link.destination)));
            }
            for end in [link.source, link.destination] {
                if !ids.contains(&end) {
                    return Err(TopologyError::UnknownEntity(format!("wired link references missing node {}", end)));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> TopologyError {
    TopologyError::InvalidConfiguration(message)
}
