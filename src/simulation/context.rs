//! The view a behavior gets of its own node and its surroundings.
//!
//! Reads of other nodes and of the link set see the state committed at the
//! start of the current callback. Writes go to a staged copy of the node's own
//! state and to an outbox; both are committed together when every callback of
//! the turn succeeds, and dropped otherwise.

use log::debug;
use rand::rngs::StdRng;
use serde_json::Value;
use std::collections::BTreeSet;

use super::error::Callback;
use super::geometry::Point;
use super::message::{Message, OutgoingMessage};
use super::node::NodeState;
use super::registry::{LinkRegistry, NodeRegistry};
use super::resolver::LinkResolver;
use super::types::NodeId;

/// Committed topology state shared by every callback in a tick.
pub(crate) struct World<'a> {
    pub nodes: &'a NodeRegistry,
    pub links: &'a LinkRegistry,
    pub resolver: &'a dyn LinkResolver,
    pub width: f64,
    pub height: f64,
}

/// What a successful turn hands back to the topology.
pub(crate) struct Effects {
    pub state: NodeState,
    pub outbox: Vec<OutgoingMessage>,
    pub remove_requested: bool,
}

pub struct NodeContext<'a> {
    id: NodeId,
    tick: u64,
    callback: Callback,
    state: NodeState,
    inbox: &'a [Message],
    world: World<'a>,
    rng: &'a mut StdRng,
    outbox: Vec<OutgoingMessage>,
    remove_requested: bool,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        id: NodeId,
        tick: u64,
        state: NodeState,
        inbox: &'a [Message],
        world: World<'a>,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            id,
            tick,
            callback: Callback::Clock,
            state,
            inbox,
            world,
            rng,
            outbox: Vec::new(),
            remove_requested: false,
        }
    }

    /// Marks which hook runs next, for error attribution.
    pub(crate) fn enter(&mut self, callback: Callback) {
        self.callback = callback;
    }

    pub(crate) fn callback(&self) -> Callback {
        self.callback
    }

    /// The inbox with the context's own lifetime, so the caller can iterate it
    /// while handing `self` to `on_message`.
    pub(crate) fn delivered(&self) -> &'a [Message] {
        self.inbox
    }

    pub(crate) fn into_effects(self) -> Effects {
        Effects {
            state: self.state,
            outbox: self.outbox,
            remove_requested: self.remove_requested,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Tick being processed.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Messages delivered to this node at the start of the tick.
    pub fn inbox(&self) -> &[Message] {
        self.inbox
    }

    /// Staged copy of this node's state.
    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn world_size(&self) -> (f64, f64) {
        (self.world.width, self.world.height)
    }

    // Movement

    pub fn position(&self) -> Point {
        self.state.position
    }

    /// Non-finite coordinates fail the turn when it commits.
    pub fn set_position(&mut self, position: Point) {
        self.state.position = position;
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.state.position = self.state.position.translate(dx, dy);
    }

    pub fn direction(&self) -> f64 {
        self.state.direction
    }

    pub fn set_direction(&mut self, radians: f64) {
        self.state.direction = radians;
    }

    /// Points the node at `target`. No-op when already there.
    pub fn set_direction_towards(&mut self, target: Point) {
        if target != self.state.position {
            self.state.direction = self.state.position.angle_to(&target);
        }
    }

    /// Moves `distance` along the current direction.
    pub fn move_forward(&mut self, distance: f64) {
        let (sin, cos) = self.state.direction.sin_cos();
        self.translate(distance * cos, distance * sin);
    }

    /// Folds the staged position back into the world. Positions are also
    /// wrapped on commit; this lets a behavior read the wrapped value early.
    pub fn wrap_location(&mut self) {
        self.state.position = self.world.resolver.wrap(&self.state.position);
    }

    // Other nodes

    /// Position of another node, or the staged position for this node.
    pub fn position_of(&self, id: NodeId) -> Option<Point> {
        if id == self.id {
            return Some(self.state.position);
        }
        self.world.nodes.get(id).map(|node| node.state.position)
    }

    /// Distance to another node using the active resolver's metric.
    pub fn distance(&self, other: NodeId) -> Option<f64> {
        let target = self.position_of(other)?;
        Some(self.world.resolver.distance(&self.state.position, &target))
    }

    /// Nodes this node can send to.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.world.links.out_neighbors(self.id)
    }

    /// Nodes that can send to this node.
    pub fn in_neighbors(&self) -> Vec<NodeId> {
        self.world.links.in_neighbors(self.id)
    }

    pub fn node_count(&self) -> usize {
        self.world.nodes.len()
    }

    /// Nodes carrying `tag`, in insertion order. Uses this node's staged tags.
    pub fn nodes_with_tag(&self, tag: &str) -> Vec<NodeId> {
        self.world
            .nodes
            .iter()
            .filter(|node| {
                if node.id == self.id {
                    self.state.tags.contains(tag)
                } else {
                    node.state.tags.contains(tag)
                }
            })
            .map(|node| node.id)
            .collect()
    }

    // Messaging

    /// Sends to one neighbor. Dropped if `to` is not a neighbor right now.
    pub fn send(&mut self, to: NodeId, payload: impl Into<Value>) {
        self.push_unicast(to, payload.into(), None);
    }

    pub fn send_flagged(&mut self, to: NodeId, payload: impl Into<Value>, flag: impl Into<String>) {
        self.push_unicast(to, payload.into(), Some(flag.into()));
    }

    /// Sends one copy to every current out-neighbor. With no neighbors this is a no-op.
    pub fn send_all(&mut self, payload: impl Into<Value>) {
        self.push_broadcast(payload.into(), None);
    }

    pub fn send_all_flagged(&mut self, payload: impl Into<Value>, flag: impl Into<String>) {
        self.push_broadcast(payload.into(), Some(flag.into()));
    }

    fn push_unicast(&mut self, to: NodeId, payload: Value, flag: Option<String>) {
        if !self.world.nodes.contains(to) {
            debug!("Node {} sent to unknown node {}, dropping", self.id, to);
            return;
        }
        if !self.world.links.carries(self.id, to) {
            debug!("Node {} sent to {} without a link, dropping", self.id, to);
            return;
        }
        self.outbox.push(OutgoingMessage {
            recipient: Some(to),
            destinations: vec![to],
            payload,
            flag,
        });
    }

    fn push_broadcast(&mut self, payload: Value, flag: Option<String>) {
        let destinations = self.neighbors();
        if destinations.is_empty() {
            return;
        }
        self.outbox.push(OutgoingMessage {
            recipient: None,
            destinations,
            payload,
            flag,
        });
    }

    // Radio and sensing

    pub fn communication_range(&self) -> f64 {
        self.state.communication_range
    }

    /// Negative or non-finite ranges fail the turn when it commits.
    pub fn set_communication_range(&mut self, range: f64) {
        self.state.communication_range = range;
    }

    pub fn is_wireless_enabled(&self) -> bool {
        self.state.wireless_enabled
    }

    pub fn enable_wireless(&mut self) {
        self.state.wireless_enabled = true;
    }

    pub fn disable_wireless(&mut self) {
        self.state.wireless_enabled = false;
    }

    pub fn sensing_range(&self) -> f64 {
        self.state.sensing_range
    }

    pub fn set_sensing_range(&mut self, range: f64) {
        self.state.sensing_range = range;
    }

    /// Other nodes within sensing range, independent of links.
    pub fn sensed_nodes(&self) -> Vec<NodeId> {
        if self.state.sensing_range <= 0.0 {
            return Vec::new();
        }
        self.world
            .nodes
            .iter()
            .filter(|node| node.id != self.id)
            .filter(|node| {
                self.world.resolver.distance(&self.state.position, &node.state.position) <= self.state.sensing_range
            })
            .map(|node| node.id)
            .collect()
    }

    // Properties and tags

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.state.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.state.properties.remove(key)
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.state.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.state.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.state.tags.insert(tag.into());
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.state.tags.remove(tag)
    }

    // Misc

    /// The topology's seeded generator. Runs with the same seed draw the same values.
    pub fn rng(&mut self) -> &mut StdRng {
        self.rng
    }

    /// Removes this node once the current turn completes successfully.
    pub fn remove_self(&mut self) {
        self.remove_requested = true;
    }
}
