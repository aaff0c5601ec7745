//! Node state and the read-only snapshots handed to observers.

use serde_json::Value;
use std::collections::BTreeSet;

use super::behavior::Behavior;
use super::geometry::Point;
use super::message::Message;
use super::notification::Change;
use super::resolver::LinkEndpoint;
use super::types::{NodeId, Properties};

/// Everything about a node that its behavior may change.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub position: Point,
    /// Heading in radians, used by `move_forward`.
    pub direction: f64,
    pub communication_range: f64,
    pub wireless_enabled: bool,
    /// Zero disables sensing.
    pub sensing_range: f64,
    pub properties: Properties,
    /// Role labels used for topology-scoped lookups.
    pub tags: BTreeSet<String>,
}

impl NodeState {
    pub fn new(position: Point, communication_range: f64, sensing_range: f64) -> Self {
        Self {
            position,
            direction: 0.0,
            communication_range,
            wireless_enabled: true,
            sensing_range,
            properties: Properties::new(),
            tags: BTreeSet::new(),
        }
    }

    /// Range handed to the link resolver, `None` while wireless is disabled.
    pub fn effective_range(&self) -> Option<f64> {
        self.wireless_enabled.then_some(self.communication_range)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.position.is_finite() {
            return Err(format!("position ({}, {}, {}) is not finite", self.position.x, self.position.y, self.position.z));
        }
        if !self.direction.is_finite() {
            return Err("direction is not finite".to_string());
        }
        if !self.communication_range.is_finite() || self.communication_range < 0.0 {
            return Err(format!("communication range {} must be finite and non-negative", self.communication_range));
        }
        if !self.sensing_range.is_finite() || self.sensing_range < 0.0 {
            return Err(format!("sensing range {} must be finite and non-negative", self.sensing_range));
        }
        Ok(())
    }

    /// Attribute changes between `self` and `next`, built-ins first.
    pub(crate) fn changes(&self, next: &NodeState) -> Vec<Change> {
        let mut changes = Vec::new();
        if self.position != next.position {
            changes.push(Change::property("position"));
        }
        if self.direction != next.direction {
            changes.push(Change::property("direction"));
        }
        if self.communication_range != next.communication_range {
            changes.push(Change::property("communication_range"));
        }
        if self.wireless_enabled != next.wireless_enabled {
            changes.push(Change::property("wireless_enabled"));
        }
        if self.sensing_range != next.sensing_range {
            changes.push(Change::property("sensing_range"));
        }
        if self.tags != next.tags {
            changes.push(Change::property("tags"));
        }
        let property_keys: BTreeSet<&String> = self.properties.keys().chain(next.properties.keys()).collect();
        for key in property_keys {
            if self.properties.get(key) != next.properties.get(key) {
                changes.push(Change::user_property(key.as_str()));
            }
        }
        changes
    }
}

pub(crate) struct Node {
    pub id: NodeId,
    pub state: NodeState,
    /// Messages delivered at the start of the current tick.
    pub inbox: Vec<Message>,
    /// Taken out while one of its callbacks runs.
    pub behavior: Option<Box<dyn Behavior>>,
    pub started: bool,
}

impl Node {
    pub fn new(id: NodeId, state: NodeState, behavior: Box<dyn Behavior>) -> Self {
        Self {
            id,
            state,
            inbox: Vec::new(),
            behavior: Some(behavior),
            started: false,
        }
    }

    pub fn endpoint(&self) -> LinkEndpoint {
        LinkEndpoint {
            id: self.id,
            position: self.state.position,
            communication_range: self.state.effective_range(),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id,
            state: self.state.clone(),
            started: self.started,
            inbox: self.inbox.clone(),
        }
    }
}

/// Read-only copy of a node, valid independently of later mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub state: NodeState,
    /// Whether `on_start` has already run.
    pub started: bool,
    pub inbox: Vec<Message>,
}
