//! The topology aggregate: nodes, links, obstacles, the message channel and
//! the tick algorithm that advances them together.
//!
//! A tick runs four phases against one exclusive borrow:
//!
//! 1. messages whose visible tick has arrived are moved into fresh inboxes,
//! 2. every node takes its turn in insertion order (`on_start` on its first
//!    tick, otherwise `on_message` per delivered message then `on_clock`),
//! 3. wireless links are recomputed from the committed positions,
//! 4. the tick counter advances and the accumulated notifications are handed
//!    back in a [`TickReport`].
//!
//! A node's turn stages its edits in a [`NodeContext`]; they commit only if
//! every callback in the turn returns `Ok`. A failing or panicking turn is
//! turned into a [`BehaviorError`] and the tick carries on.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::behavior::{Behavior, BehaviorFactory, idle_factory};
use super::context::{Effects, NodeContext, World};
use super::error::{BehaviorError, Callback, TopologyError};
use super::geometry::Point;
use super::message::{MessageEngine, MessageStats};
use super::node::{Node, NodeSnapshot, NodeState};
use super::notification::{Change, Notification, NotificationBatch, Subject};
use super::obstacle::{Obstacle, ObstacleSet, ObstacleShape};
use super::registry::{LinkRegistry, NodeRegistry};
use super::resolver::{LinkResolver, RangeResolver};
use super::snapshot::{LinkRecord, NodeRecord, TopologySnapshot};
use super::types::{Link, LinkKind, LinkOrientation, NodeId, ObstacleId};
use crate::config::SimulationConfig;

/// Everything observers need to know about one completed tick (or one batch
/// of external mutations).
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Tick counter after the batch was produced.
    pub tick: u64,
    pub notifications: Vec<Notification>,
    pub errors: Vec<BehaviorError>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct WorldSettings {
    width: f64,
    height: f64,
    communication_range: f64,
    sensing_range: f64,
}

impl From<&SimulationConfig> for WorldSettings {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            width: config.world_width,
            height: config.world_height,
            communication_range: config.communication_range,
            sensing_range: config.sensing_range,
        }
    }
}

pub struct Topology {
    settings: WorldSettings,
    nodes: NodeRegistry,
    links: LinkRegistry,
    obstacles: Arc<ObstacleSet>,
    resolver: Arc<dyn LinkResolver>,
    /// Installed at the start of the next link recomputation.
    pending_resolver: Option<Arc<dyn LinkResolver>>,
    messages: MessageEngine,
    tick: u64,
    next_node_id: u32,
    next_obstacle_id: u32,
    default_behavior: BehaviorFactory,
    rng: StdRng,
    pending: NotificationBatch,
    errors: Vec<BehaviorError>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// An empty 800x600 world with the symmetric range resolver.
    pub fn new() -> Self {
        let config = SimulationConfig::default();
        Self::from_parts(
            WorldSettings::from(&config),
            Arc::new(RangeResolver::new(config.range_rule)),
            MessageEngine::default(),
            StdRng::from_entropy(),
        )
    }

    pub fn with_config(config: &SimulationConfig) -> Result<Self, TopologyError> {
        config.validate()?;
        let resolver = config.build_resolver()?;
        let messages = MessageEngine::new(config.message_delay)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self::from_parts(WorldSettings::from(config), resolver, messages, rng))
    }

    fn from_parts(settings: WorldSettings, resolver: Arc<dyn LinkResolver>, messages: MessageEngine, rng: StdRng) -> Self {
        Self {
            settings,
            nodes: NodeRegistry::new(),
            links: LinkRegistry::new(),
            obstacles: Arc::new(ObstacleSet::new()),
            resolver,
            pending_resolver: None,
            messages,
            tick: 0,
            next_node_id: 0,
            next_obstacle_id: 0,
            default_behavior: idle_factory(),
            rng,
            pending: NotificationBatch::new(),
            errors: Vec::new(),
        }
    }

    // ---- global parameters ----

    /// Number of the next tick to be processed.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn world_size(&self) -> (f64, f64) {
        (self.settings.width, self.settings.height)
    }

    pub fn default_communication_range(&self) -> f64 {
        self.settings.communication_range
    }

    /// Range given to nodes added from now on.
    pub fn set_default_communication_range(&mut self, range: f64) -> Result<(), TopologyError> {
        check_range("communication", range)?;
        self.settings.communication_range = range;
        Ok(())
    }

    pub fn set_default_sensing_range(&mut self, range: f64) -> Result<(), TopologyError> {
        check_range("sensing", range)?;
        self.settings.sensing_range = range;
        Ok(())
    }

    /// Behavior used by `add_node` and by imports.
    pub fn set_default_behavior(&mut self, factory: BehaviorFactory) {
        self.default_behavior = factory;
    }

    pub fn message_delay(&self) -> u64 {
        self.messages.delay()
    }

    pub fn set_message_delay(&mut self, delay: u64) -> Result<(), TopologyError> {
        self.messages.set_delay(delay)
    }

    pub fn message_stats(&self) -> MessageStats {
        self.messages.stats()
    }

    pub fn pending_message_count(&self) -> usize {
        self.messages.pending_count()
    }

    /// The resolver that will drive the next link recomputation.
    pub fn link_resolver(&self) -> Arc<dyn LinkResolver> {
        Arc::clone(self.pending_resolver.as_ref().unwrap_or(&self.resolver))
    }

    /// Takes effect at the start of the next tick's link recomputation.
    pub fn set_link_resolver(&mut self, resolver: Arc<dyn LinkResolver>) {
        info!("Link resolver change staged: {:?}", resolver);
        self.pending_resolver = Some(resolver);
    }

    // ---- nodes ----

    /// Adds a node running the default behavior. Without a position it is
    /// placed uniformly at random inside the world.
    pub fn add_node(&mut self, position: Option<Point>) -> Result<NodeId, TopologyError> {
        let behavior = (self.default_behavior)();
        self.add_node_with(position, behavior)
    }

    pub fn add_node_with(&mut self, position: Option<Point>, behavior: Box<dyn Behavior>) -> Result<NodeId, TopologyError> {
        let position = match position {
            Some(position) if !position.is_finite() => {
                return Err(TopologyError::InvalidConfiguration(format!(
                    "node position ({}, {}) is not finite",
                    position.x, position.y
                )));
            }
            Some(position) => position,
            None => self.random_position(),
        };
        let id = self.allocate_node_id();
        let state = NodeState::new(self.resolver.wrap(&position), self.settings.communication_range, self.settings.sensing_range);
        self.insert_node(id, state, behavior)?;
        Ok(id)
    }

    /// Removes a node and every link touching it. Unknown ids are ignored.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        self.detach_and_remove(id)
    }

    /// Removes every node. Obstacles and global parameters stay.
    pub fn clear(&mut self) {
        for id in self.nodes.ids() {
            self.detach_and_remove(id);
        }
        self.messages.clear();
        info!("Topology cleared");
    }

    /// Rewinds the clock: tick 0, no messages in flight, every node runs
    /// `on_start` again on its next tick. Positions and links are kept.
    pub fn restart(&mut self) {
        self.tick = 0;
        self.messages.clear();
        for node in self.nodes.iter_mut() {
            node.inbox.clear();
            node.started = false;
        }
        self.pending.notify(Subject::Topology, Change::property("tick"));
        info!("Topology restarted with {} nodes", self.nodes.len());
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.ids()
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains(id)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeSnapshot> {
        self.nodes.get(id).map(Node::snapshot)
    }

    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(Node::snapshot).collect()
    }

    pub fn nodes_with_tag(&self, tag: &str) -> Vec<NodeId> {
        self.nodes.iter().filter(|node| node.state.tags.contains(tag)).map(|node| node.id).collect()
    }

    pub fn set_position(&mut self, id: NodeId, position: Point) -> Result<(), TopologyError> {
        self.update_state(id, |state| state.position = position)
    }

    pub fn set_direction(&mut self, id: NodeId, radians: f64) -> Result<(), TopologyError> {
        self.update_state(id, |state| state.direction = radians)
    }

    pub fn set_communication_range(&mut self, id: NodeId, range: f64) -> Result<(), TopologyError> {
        self.update_state(id, |state| state.communication_range = range)
    }

    pub fn set_sensing_range(&mut self, id: NodeId, range: f64) -> Result<(), TopologyError> {
        self.update_state(id, |state| state.sensing_range = range)
    }

    /// Disabling detaches the node's wireless links right away.
    pub fn set_wireless_enabled(&mut self, id: NodeId, enabled: bool) -> Result<(), TopologyError> {
        self.update_state(id, |state| state.wireless_enabled = enabled)?;
        if !enabled {
            for link in self.links.detach_wireless(id) {
                self.pending.notify(Subject::Link(link), Change::Removed);
            }
        }
        Ok(())
    }

    pub fn set_property(&mut self, id: NodeId, key: &str, value: serde_json::Value) -> Result<(), TopologyError> {
        self.update_state(id, |state| {
            state.properties.insert(key.to_string(), value);
        })
    }

    pub fn remove_property(&mut self, id: NodeId, key: &str) -> Result<(), TopologyError> {
        self.update_state(id, |state| {
            state.properties.remove(key);
        })
    }

    pub fn add_tag(&mut self, id: NodeId, tag: &str) -> Result<(), TopologyError> {
        self.update_state(id, |state| {
            state.tags.insert(tag.to_string());
        })
    }

    pub fn remove_tag(&mut self, id: NodeId, tag: &str) -> Result<(), TopologyError> {
        self.update_state(id, |state| {
            state.tags.remove(tag);
        })
    }

    /// Runs the node's `on_selection` right away, outside the tick cadence.
    pub fn select_node(&mut self, id: NodeId) -> Result<(), TopologyError> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown_node(id))?;
        let Some(mut behavior) = node.behavior.take() else {
            return Ok(());
        };
        let outcome = self.run_turn(id, &mut behavior, Callback::Selection, |behavior, ctx| behavior.on_selection(ctx));
        if let Some(node) = self.nodes.get_mut(id) {
            node.behavior = Some(behavior);
        }
        self.pending.notify(Subject::Node(id), Change::property("selected"));
        self.settle(id, outcome);
        Ok(())
    }

    // ---- links ----

    /// Wired links first, then wireless, each in canonical order.
    pub fn links(&self) -> Vec<Link> {
        self.links.all()
    }

    pub fn wireless_links(&self) -> Vec<Link> {
        self.links.wireless().copied().collect()
    }

    pub fn wired_links(&self) -> Vec<Link> {
        self.links.wired().copied().collect()
    }

    /// Nodes sharing any link with `id`.
    pub fn neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.links.neighbors(id)
    }

    pub fn out_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.links.out_neighbors(id)
    }

    pub fn in_neighbors(&self, id: NodeId) -> Vec<NodeId> {
        self.links.in_neighbors(id)
    }

    /// Adds an explicit link that persists until removed. Adding an existing
    /// link is a no-op that returns the same link.
    pub fn add_wired_link(&mut self, from: NodeId, to: NodeId, orientation: LinkOrientation) -> Result<Link, TopologyError> {
        for id in [from, to] {
            if !self.nodes.contains(id) {
                return Err(unknown_node(id));
            }
        }
        if from == to {
            return Err(TopologyError::InvalidConfiguration(format!("node {} cannot link to itself", from)));
        }
        let link = match orientation {
            LinkOrientation::Undirected => Link::undirected(from, to, LinkKind::Wired),
            LinkOrientation::Directed => Link::directed(from, to, LinkKind::Wired),
        };
        if self.links.add_wired(link) {
            debug!("Link {} added", link);
            self.pending.notify(Subject::Link(link), Change::Added);
        }
        Ok(link)
    }

    /// Removes a wired link. Wireless links belong to the resolver and are
    /// changed by moving nodes or toggling their radio instead.
    pub fn remove_link(&mut self, link: &Link) -> Result<(), TopologyError> {
        match link.kind {
            LinkKind::Wired if self.links.remove_wired(link) => {
                debug!("Link {} removed", link);
                self.pending.notify(Subject::Link(*link), Change::Removed);
                Ok(())
            }
            LinkKind::Wireless if self.links.contains(link) => Err(TopologyError::InvalidState(format!(
                "link {} is derived by the link resolver and cannot be removed directly",
                link
            ))),
            _ => Err(TopologyError::UnknownEntity(format!("link {}", link))),
        }
    }

    // ---- obstacles ----

    /// Current obstacle set. The returned snapshot never changes.
    pub fn obstacles(&self) -> Arc<ObstacleSet> {
        Arc::clone(&self.obstacles)
    }

    pub fn add_obstacle(&mut self, obstacle: Obstacle) -> ObstacleId {
        let id = ObstacleId(self.next_obstacle_id);
        self.next_obstacle_id += 1;
        Arc::make_mut(&mut self.obstacles).insert(id, obstacle);
        self.pending.notify(Subject::Obstacle(id), Change::Added);
        debug!("Obstacle {} added", id);
        id
    }

    /// Validates raw geometry and adds it. Rejected shapes leave the set unchanged.
    pub fn add_obstacle_shape(&mut self, shape: ObstacleShape) -> Result<ObstacleId, TopologyError> {
        let obstacle = Obstacle::try_from(shape)?;
        Ok(self.add_obstacle(obstacle))
    }

    pub fn remove_obstacle(&mut self, id: ObstacleId) -> Result<Obstacle, TopologyError> {
        if self.obstacles.get(id).is_none() {
            return Err(TopologyError::UnknownEntity(id.to_string()));
        }
        let removed = Arc::make_mut(&mut self.obstacles)
            .remove(id)
            .ok_or_else(|| TopologyError::UnknownEntity(id.to_string()))?;
        self.pending.notify(Subject::Obstacle(id), Change::Removed);
        debug!("Obstacle {} removed", id);
        Ok(removed)
    }

    // ---- import / export ----

    /// Bulk-loads nodes, wired links and obstacles. The snapshot is checked
    /// in full first; on error nothing is changed.
    pub fn import(&mut self, snapshot: &TopologySnapshot) -> Result<Vec<NodeId>, TopologyError> {
        snapshot.validate()?;
        if let Some(clash) = snapshot.nodes.iter().find(|record| self.nodes.contains(record.id)) {
            return Err(TopologyError::InvalidConfiguration(format!("node {} already exists", clash.id)));
        }

        let mut ids = Vec::with_capacity(snapshot.nodes.len());
        for record in &snapshot.nodes {
            let mut state = NodeState::new(
                self.resolver.wrap(&record.position),
                record.communication_range.unwrap_or(self.settings.communication_range),
                record.sensing_range.unwrap_or(self.settings.sensing_range),
            );
            state.direction = record.direction;
            state.wireless_enabled = record.wireless_enabled;
            state.properties = record.properties.clone();
            state.tags = record.tags.clone();

            let behavior = (self.default_behavior)();
            self.insert_node(record.id, state, behavior)?;
            self.next_node_id = self.next_node_id.max(record.id.0.saturating_add(1));
            ids.push(record.id);
        }
        for link in &snapshot.wired_links {
            let orientation = if link.directed { LinkOrientation::Directed } else { LinkOrientation::Undirected };
            self.add_wired_link(link.source, link.destination, orientation)?;
        }
        for obstacle in &snapshot.obstacles {
            self.add_obstacle(obstacle.clone());
        }
        info!(
            "Imported {} nodes, {} wired links and {} obstacles",
            ids.len(),
            snapshot.wired_links.len(),
            snapshot.obstacles.len()
        );
        Ok(ids)
    }

    pub fn export(&self) -> TopologySnapshot {
        TopologySnapshot {
            tick: self.tick,
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeRecord {
                    id: node.id,
                    position: node.state.position,
                    direction: node.state.direction,
                    communication_range: Some(node.state.communication_range),
                    wireless_enabled: node.state.wireless_enabled,
                    sensing_range: Some(node.state.sensing_range),
                    properties: node.state.properties.clone(),
                    tags: node.state.tags.clone(),
                })
                .collect(),
            wired_links: self.links.wired().map(LinkRecord::from).collect(),
            wireless_links: self.links.wireless().map(LinkRecord::from).collect(),
            obstacles: self.obstacles.iter().map(|(_, obstacle)| obstacle.clone()).collect(),
        }
    }

    // ---- ticking ----

    /// Processes one tick and returns what changed.
    pub fn tick(&mut self) -> TickReport {
        let tick = self.tick;
        self.deliver_messages(tick);

        let mut removals = Vec::new();
        for id in self.nodes.ids() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let Some(mut behavior) = node.behavior.take() else {
                continue;
            };
            let started = std::mem::replace(&mut node.started, true);

            let outcome = if started {
                self.run_turn(id, &mut behavior, Callback::Message, |behavior, ctx| {
                    for message in ctx.delivered() {
                        ctx.enter(Callback::Message);
                        behavior.on_message(ctx, message)?;
                    }
                    ctx.enter(Callback::Clock);
                    behavior.on_clock(ctx)
                })
            } else {
                self.run_turn(id, &mut behavior, Callback::Start, |behavior, ctx| behavior.on_start(ctx))
            };

            if let Some(node) = self.nodes.get_mut(id) {
                node.behavior = Some(behavior);
            }
            match outcome {
                Ok(effects) => {
                    if self.commit(id, effects) {
                        removals.push(id);
                    }
                }
                Err(error) => self.record_error(error),
            }
        }
        for id in removals {
            self.detach_and_remove(id);
        }

        self.recompute_links();

        self.tick += 1;
        self.pending.notify(Subject::Topology, Change::property("tick"));
        self.drain_report()
    }

    /// Hands out everything accumulated since the last report.
    pub fn drain_report(&mut self) -> TickReport {
        TickReport {
            tick: self.tick,
            notifications: self.pending.take(),
            errors: std::mem::take(&mut self.errors),
        }
    }

    fn deliver_messages(&mut self, tick: u64) {
        for node in self.nodes.iter_mut() {
            node.inbox.clear();
        }
        for envelope in self.messages.take_due(tick) {
            match self.nodes.get_mut(envelope.destination) {
                Some(node) => {
                    node.inbox.push(envelope.message);
                    self.messages.record_delivered();
                }
                None => self.messages.record_dropped(&envelope),
            }
        }
    }

    fn recompute_links(&mut self) {
        if let Some(resolver) = self.pending_resolver.take() {
            self.resolver = resolver;
            self.pending.notify(Subject::Topology, Change::property("link_resolver"));
            for node in self.nodes.iter_mut() {
                let wrapped = self.resolver.wrap(&node.state.position);
                if wrapped != node.state.position {
                    node.state.position = wrapped;
                    self.pending.notify(Subject::Node(node.id), Change::property("position"));
                }
            }
        }

        let endpoints: Vec<_> = self.nodes.iter().filter(|node| node.state.wireless_enabled).map(Node::endpoint).collect();
        let resolver = &*self.resolver;
        let obstacles = &*self.obstacles;
        let symmetric = resolver.is_symmetric();

        let mut next = BTreeSet::new();
        for (index, a) in endpoints.iter().enumerate() {
            for b in &endpoints[index + 1..] {
                if symmetric {
                    if resolver.is_connected(a, b, obstacles) {
                        next.insert(Link::undirected(a.id, b.id, LinkKind::Wireless));
                    }
                    continue;
                }
                match (resolver.is_connected(a, b, obstacles), resolver.is_connected(b, a, obstacles)) {
                    (true, true) => next.insert(Link::undirected(a.id, b.id, LinkKind::Wireless)),
                    (true, false) => next.insert(Link::directed(a.id, b.id, LinkKind::Wireless)),
                    (false, true) => next.insert(Link::directed(b.id, a.id, LinkKind::Wireless)),
                    (false, false) => false,
                };
            }
        }

        let diff = self.links.replace_wireless(next);
        if !diff.is_empty() {
            debug!("Tick {}: {} wireless links added, {} removed", self.tick, diff.added.len(), diff.removed.len());
        }
        for link in diff.removed {
            self.pending.notify(Subject::Link(link), Change::Removed);
        }
        for link in diff.added {
            self.pending.notify(Subject::Link(link), Change::Added);
        }
    }

    /// Runs one turn of a node's behavior against a staged context. Panics
    /// are caught here so one faulty node cannot take the tick down.
    fn run_turn<F>(&mut self, id: NodeId, behavior: &mut Box<dyn Behavior>, entry: Callback, invoke: F) -> Result<Effects, BehaviorError>
    where
        F: FnOnce(&mut Box<dyn Behavior>, &mut NodeContext<'_>) -> anyhow::Result<()>,
    {
        let tick = self.tick;
        let Some(node) = self.nodes.get(id) else {
            return Err(BehaviorError {
                node_id: id,
                tick,
                callback: entry,
                reason: "node is no longer registered".to_string(),
            });
        };
        let world = World {
            nodes: &self.nodes,
            links: &self.links,
            resolver: &*self.resolver,
            width: self.settings.width,
            height: self.settings.height,
        };
        let mut ctx = NodeContext::new(id, tick, node.state.clone(), &node.inbox, world, &mut self.rng);
        ctx.enter(entry);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| invoke(behavior, &mut ctx)));
        let callback = ctx.callback();
        let effects = ctx.into_effects();
        let reason = match outcome {
            Ok(Ok(())) => match effects.state.validate() {
                Ok(()) => return Ok(effects),
                Err(reason) => reason,
            },
            Ok(Err(err)) => format!("{:#}", err),
            Err(payload) => panic_reason(&*payload),
        };
        Err(BehaviorError {
            node_id: id,
            tick,
            callback,
            reason,
        })
    }

    /// Applies a successful turn. Returns whether the node asked to be removed.
    fn commit(&mut self, id: NodeId, effects: Effects) -> bool {
        let tick = self.tick;
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        let mut state = effects.state;
        state.position = self.resolver.wrap(&state.position);
        for change in node.state.changes(&state) {
            self.pending.notify(Subject::Node(id), change);
        }
        node.state = state;

        for outgoing in effects.outbox {
            self.messages.enqueue(id, outgoing, tick);
        }
        effects.remove_requested
    }

    fn settle(&mut self, id: NodeId, outcome: Result<Effects, BehaviorError>) {
        match outcome {
            Ok(effects) => {
                if self.commit(id, effects) {
                    self.detach_and_remove(id);
                }
            }
            Err(error) => self.record_error(error),
        }
    }

    fn record_error(&mut self, error: BehaviorError) {
        warn!("{}", error);
        self.errors.push(error);
    }

    fn update_state(&mut self, id: NodeId, update: impl FnOnce(&mut NodeState)) -> Result<(), TopologyError> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown_node(id))?;
        let mut next = node.state.clone();
        update(&mut next);
        next.validate().map_err(TopologyError::InvalidConfiguration)?;
        next.position = self.resolver.wrap(&next.position);
        let changes = node.state.changes(&next);
        node.state = next;
        for change in changes {
            self.pending.notify(Subject::Node(id), change);
        }
        Ok(())
    }

    fn insert_node(&mut self, id: NodeId, state: NodeState, behavior: Box<dyn Behavior>) -> Result<(), TopologyError> {
        self.nodes.insert(Node::new(id, state, behavior))?;
        self.pending.notify(Subject::Node(id), Change::Added);
        debug!("Node {} added", id);
        Ok(())
    }

    fn detach_and_remove(&mut self, id: NodeId) -> bool {
        if !self.nodes.contains(id) {
            return false;
        }
        for link in self.links.detach(id) {
            self.pending.notify(Subject::Link(link), Change::Removed);
        }
        let behavior = self.nodes.get_mut(id).and_then(|node| {
            node.inbox.clear();
            node.behavior.take()
        });
        if let Some(mut behavior) = behavior {
            // on_stop may look around but its edits are dropped with the node
            let outcome = self.run_turn(id, &mut behavior, Callback::Stop, |behavior, ctx| behavior.on_stop(ctx));
            if let Err(error) = outcome {
                self.record_error(error);
            }
        }
        self.nodes.remove(id);
        self.pending.notify(Subject::Node(id), Change::Removed);
        debug!("Node {} removed", id);
        true
    }

    fn allocate_node_id(&mut self) -> NodeId {
        while self.nodes.contains(NodeId(self.next_node_id)) {
            self.next_node_id += 1;
        }
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    fn random_position(&mut self) -> Point {
        Point::new(
            self.rng.gen_range(0.0..self.settings.width),
            self.rng.gen_range(0.0..self.settings.height),
        )
    }
}

fn unknown_node(id: NodeId) -> TopologyError {
    TopologyError::UnknownEntity(format!("node {}", id))
}

fn check_range(name: &str, range: f64) -> Result<(), TopologyError> {
    if !range.is_finite() || range < 0.0 {
        return Err(TopologyError::InvalidConfiguration(format!("{} range {} must be finite and non-negative", name, range)));
    }
    Ok(())
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::message::Message;
    use crate::simulation::resolver::ToroidalResolver;
    use serde_json::json;
    use std::sync::Mutex;

    fn topology() -> Topology {
        let config = SimulationConfig {
            communication_range: 10.0,
            seed: Some(7),
            ..Default::default()
        };
        Topology::with_config(&config).unwrap()
    }

    #[derive(Clone, Default)]
    struct Journal {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Behavior for Journal {
        fn on_start(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("start@{}", ctx.tick()));
            Ok(())
        }

        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("clock@{}", ctx.tick()));
            Ok(())
        }

        fn on_message(&mut self, ctx: &mut NodeContext<'_>, message: &Message) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("message@{} from {}", ctx.tick(), message.sender()));
            Ok(())
        }
    }

    struct Chatter;

    impl Behavior for Chatter {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            ctx.send_all(json!("ping"));
            Ok(())
        }
    }

    struct Faulty {
        panic: bool,
    }

    impl Behavior for Faulty {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            ctx.translate(3.0, 0.0);
            ctx.set_property("color", "red");
            ctx.send_all(json!("lost"));
            if self.panic {
                panic!("kaboom");
            }
            anyhow::bail!("boom")
        }
    }

    struct Walker;

    impl Behavior for Walker {
        fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
            ctx.move_forward(1.0);
            Ok(())
        }
    }

    #[test]
    fn first_tick_runs_only_on_start() {
        let mut topology = topology();
        let journal = Journal::default();
        let a = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(journal.clone())).unwrap();
        let b = topology.add_node_with(Some(Point::new(5.0, 0.0)), Box::new(Chatter)).unwrap();

        topology.tick();
        assert_eq!(topology.out_neighbors(a), vec![b]);
        topology.tick();
        topology.tick();

        assert_eq!(*journal.events.lock().unwrap(), vec!["start@0", "clock@1", "message@2 from #1", "clock@2"]);
    }

    #[test]
    fn failing_turn_is_isolated_and_discarded() {
        for panic in [false, true] {
            let mut topology = topology();
            let faulty = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(Faulty { panic })).unwrap();
            let walker = topology.add_node_with(Some(Point::new(5.0, 0.0)), Box::new(Walker)).unwrap();

            assert!(topology.tick().errors.is_empty());
            let report = topology.tick();

            assert_eq!(report.errors.len(), 1);
            let error = &report.errors[0];
            assert_eq!(error.node_id, faulty);
            assert_eq!(error.tick, 1);
            assert_eq!(error.callback, Callback::Clock);
            assert!(error.reason.contains(if panic { "kaboom" } else { "boom" }));

            let snapshot = topology.node(faulty).unwrap();
            assert_eq!(snapshot.state.position, Point::new(0.0, 0.0));
            assert!(snapshot.state.property("color").is_none());
            assert_eq!(topology.message_stats().sent, 0);

            // The other node still moved
            assert_eq!(topology.node(walker).unwrap().state.position, Point::new(6.0, 0.0));
            // And the faulty node keeps ticking
            assert_eq!(topology.tick().errors.len(), 1);
        }
    }

    #[test]
    fn property_changes_are_notified_once_per_tick() {
        let mut topology = topology();
        let walker = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(Walker)).unwrap();
        let added = topology.drain_report();
        assert!(added.notifications.contains(&Notification {
            subject: Subject::Node(walker),
            change: Change::Added,
        }));

        topology.tick();
        let report = topology.tick();
        let moves = report
            .notifications
            .iter()
            .filter(|n| n.subject == Subject::Node(walker) && n.change == Change::property("position"))
            .count();
        assert_eq!(moves, 1);
        assert_eq!(report.tick, 2);
    }

    #[test]
    fn remove_self_takes_effect_after_the_turn() {
        struct Quitter;
        impl Behavior for Quitter {
            fn on_clock(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
                ctx.remove_self();
                Ok(())
            }
        }

        let mut topology = topology();
        let quitter = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(Quitter)).unwrap();
        let other = topology.add_node(Some(Point::new(1.0, 0.0))).unwrap();
        topology.tick();
        assert_eq!(topology.links().len(), 1);

        let report = topology.tick();
        assert!(!topology.contains_node(quitter));
        assert!(topology.links().is_empty());
        assert!(report.notifications.contains(&Notification {
            subject: Subject::Node(quitter),
            change: Change::Removed,
        }));
        assert!(topology.contains_node(other));
    }

    #[test]
    fn remove_node_is_idempotent() {
        let mut topology = topology();
        let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        assert!(topology.remove_node(a));
        assert!(!topology.remove_node(a));
        assert!(!topology.remove_node(NodeId(99)));
        assert_eq!(topology.node_count(), 0);
    }

    #[test]
    fn wired_links_are_validated() {
        let mut topology = topology();
        let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        let b = topology.add_node(Some(Point::new(500.0, 0.0))).unwrap();

        assert!(matches!(
            topology.add_wired_link(a, NodeId(42), LinkOrientation::Undirected),
            Err(TopologyError::UnknownEntity(_))
        ));
        assert!(matches!(
            topology.add_wired_link(a, a, LinkOrientation::Undirected),
            Err(TopologyError::InvalidConfiguration(_))
        ));

        let link = topology.add_wired_link(b, a, LinkOrientation::Directed).unwrap();
        topology.tick();
        assert_eq!(topology.links(), vec![link]);
        assert_eq!(topology.out_neighbors(b), vec![a]);
        assert!(topology.out_neighbors(a).is_empty());

        topology.remove_link(&link).unwrap();
        assert!(matches!(topology.remove_link(&link), Err(TopologyError::UnknownEntity(_))));
    }

    #[test]
    fn disabling_wireless_detaches_immediately() {
        let mut topology = topology();
        let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        topology.add_node(Some(Point::new(4.0, 0.0))).unwrap();
        topology.tick();
        assert_eq!(topology.wireless_links().len(), 1);

        topology.set_wireless_enabled(a, false).unwrap();
        assert!(topology.wireless_links().is_empty());
        topology.tick();
        assert!(topology.wireless_links().is_empty());

        topology.set_wireless_enabled(a, true).unwrap();
        topology.tick();
        assert_eq!(topology.wireless_links().len(), 1);
    }

    #[test]
    fn asymmetric_ranges_produce_directed_links() {
        let config = SimulationConfig {
            communication_range: 10.0,
            range_rule: crate::simulation::resolver::RangeRule::Asymmetric,
            ..Default::default()
        };
        let mut topology = Topology::with_config(&config).unwrap();
        let long = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        let short = topology.add_node(Some(Point::new(8.0, 0.0))).unwrap();
        topology.set_communication_range(short, 5.0).unwrap();
        topology.tick();

        assert_eq!(topology.links(), vec![Link::directed(long, short, LinkKind::Wireless)]);

        topology.set_communication_range(short, 8.0).unwrap();
        topology.tick();
        assert_eq!(topology.links(), vec![Link::undirected(long, short, LinkKind::Wireless)]);
    }

    #[test]
    fn resolver_change_applies_on_next_tick() {
        let mut topology = topology();
        topology.add_node(Some(Point::new(1.0, 50.0))).unwrap();
        topology.add_node(Some(Point::new(99.0, 50.0))).unwrap();
        topology.tick();
        assert!(topology.links().is_empty());

        topology.set_link_resolver(Arc::new(ToroidalResolver::new(100.0, 100.0).unwrap()));
        assert!(topology.links().is_empty());

        let report = topology.tick();
        assert_eq!(topology.links().len(), 1);
        assert!(report.notifications.contains(&Notification {
            subject: Subject::Topology,
            change: Change::property("link_resolver"),
        }));
    }

    #[test]
    fn invalid_mutations_leave_state_unchanged() {
        let mut topology = topology();
        let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        assert!(topology.set_position(a, Point::new(f64::NAN, 0.0)).is_err());
        assert!(topology.set_communication_range(a, -1.0).is_err());
        assert!(topology.set_position(NodeId(9), Point::new(0.0, 0.0)).is_err());
        assert!(topology.set_message_delay(0).is_err());
        assert!(topology.set_message_delay(u64::MAX).is_err());
        assert!(topology.add_node(Some(Point::new(f64::INFINITY, 0.0))).is_err());

        let node = topology.node(a).unwrap();
        assert_eq!(node.state.position, Point::new(0.0, 0.0));
        assert_eq!(node.state.communication_range, 10.0);
        assert_eq!(topology.message_delay(), 1);
    }

    #[test]
    fn selection_runs_synchronously() {
        struct Toggle;
        impl Behavior for Toggle {
            fn on_selection(&mut self, ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
                if ctx.is_wireless_enabled() {
                    ctx.disable_wireless();
                } else {
                    ctx.enable_wireless();
                }
                Ok(())
            }
        }

        let mut topology = topology();
        let a = topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(Toggle)).unwrap();
        topology.select_node(a).unwrap();
        assert!(!topology.node(a).unwrap().state.wireless_enabled);
        assert!(matches!(topology.select_node(NodeId(5)), Err(TopologyError::UnknownEntity(_))));
    }

    #[test]
    fn restart_reruns_on_start() {
        let mut topology = topology();
        let journal = Journal::default();
        topology.add_node_with(Some(Point::new(0.0, 0.0)), Box::new(journal.clone())).unwrap();
        topology.tick();
        topology.tick();
        topology.restart();
        assert_eq!(topology.current_tick(), 0);
        topology.tick();

        assert_eq!(*journal.events.lock().unwrap(), vec!["start@0", "clock@1", "start@0"]);
    }

    #[test]
    fn import_is_all_or_nothing() {
        let mut topology = topology();
        let existing = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();

        let mut snapshot = TopologySnapshot {
            nodes: vec![
                NodeRecord::at(NodeId(10), Point::new(1.0, 0.0)),
                NodeRecord::at(existing, Point::new(2.0, 0.0)),
            ],
            ..Default::default()
        };
        assert!(topology.import(&snapshot).is_err());
        assert_eq!(topology.node_count(), 1);

        snapshot.nodes[1].id = NodeId(11);
        snapshot.nodes[1].tags.insert("sink".to_string());
        snapshot.wired_links.push(LinkRecord {
            source: NodeId(10),
            destination: NodeId(11),
            directed: false,
        });
        assert_eq!(topology.import(&snapshot).unwrap(), vec![NodeId(10), NodeId(11)]);
        assert_eq!(topology.nodes_with_tag("sink"), vec![NodeId(11)]);
        assert_eq!(topology.wired_links().len(), 1);

        // Fresh ids never collide with imported ones
        assert_eq!(topology.add_node(None).unwrap(), NodeId(12));

        topology.tick();
        let exported = topology.export();
        assert_eq!(exported.nodes.len(), 4);
        assert_eq!(exported.wired_links.len(), 1);
        assert!(!exported.wireless_links.is_empty());
    }

    #[test]
    fn seeded_placement_is_reproducible() {
        let mut first = topology();
        let mut second = topology();
        for _ in 0..5 {
            let a = first.add_node(None).unwrap();
            let b = second.add_node(None).unwrap();
            let position = first.node(a).unwrap().state.position;
            assert_eq!(position, second.node(b).unwrap().state.position);
            assert!((0.0..800.0).contains(&position.x) && (0.0..600.0).contains(&position.y));
        }
    }

    #[test]
    fn obstacle_shapes_are_validated_on_insert() {
        let mut topology = topology();
        let rejected = topology.add_obstacle_shape(ObstacleShape::Circle {
            center: Point::new(0.0, 0.0),
            radius: -1.0,
        });
        assert!(matches!(rejected, Err(TopologyError::InvalidObstacle(_))));
        assert!(topology.obstacles().is_empty());

        let id = topology
            .add_obstacle_shape(ObstacleShape::Rectangle {
                top_left: Point::new(0.0, 0.0),
                bottom_right: Point::new(4.0, 4.0),
            })
            .unwrap();
        assert_eq!(topology.obstacles().len(), 1);
        topology.remove_obstacle(id).unwrap();
        assert!(matches!(topology.remove_obstacle(id), Err(TopologyError::UnknownEntity(_))));
    }

    #[test]
    fn resolver_change_reports_wrapped_nodes_in_insertion_order() {
        let mut topology = topology();
        let mut ids = Vec::new();
        for x in [450.0, 150.0, 650.0, 250.0, 350.0] {
            ids.push(topology.add_node(Some(Point::new(x, 10.0))).unwrap());
        }
        topology.remove_node(ids.remove(1));
        topology.drain_report();

        topology.set_link_resolver(Arc::new(ToroidalResolver::new(100.0, 100.0).unwrap()));
        let report = topology.tick();
        let moved: Vec<NodeId> = report
            .notifications
            .iter()
            .filter(|n| n.change == Change::property("position"))
            .filter_map(|n| match n.subject {
                Subject::Node(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(moved, ids);
        assert_eq!(topology.node_ids(), ids);
    }

    #[test]
    fn user_properties_notify_separately_from_builtins() {
        let mut topology = topology();
        let a = topology.add_node(Some(Point::new(0.0, 0.0))).unwrap();
        topology.drain_report();

        topology.set_property(a, "position", json!("north field")).unwrap();
        let report = topology.drain_report();
        let changes: Vec<&Change> = report.notifications.iter().map(|n| &n.change).collect();
        assert_eq!(changes, vec![&Change::user_property("position")]);
        assert_eq!(topology.node(a).unwrap().state.position, Point::new(0.0, 0.0));
    }
}
