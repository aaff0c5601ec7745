//! Link resolution: the pluggable policy deciding wireless connectivity.
//!
//! The topology evaluates the active resolver over every pair of nodes with
//! wireless enabled once per tick. Symmetric resolvers are asked once per
//! unordered pair; asymmetric ones once per direction, and a pair that
//! connects both ways collapses into a single undirected link.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::error::TopologyError;
use super::geometry::{self, Point};
use super::obstacle::ObstacleSet;
use super::types::NodeId;

/// What a resolver gets to see about one side of a candidate link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkEndpoint {
    pub id: NodeId,
    pub position: Point,
    /// `None` when the node's wireless interface is disabled.
    pub communication_range: Option<f64>,
}

/// Decides whether a wireless link `from` → `to` should exist.
pub trait LinkResolver: Send + Sync + fmt::Debug {
    fn is_connected(&self, from: &LinkEndpoint, to: &LinkEndpoint, obstacles: &ObstacleSet) -> bool;

    /// When true, `is_connected(a, b)` equals `is_connected(b, a)` and the
    /// topology evaluates each unordered pair once.
    fn is_symmetric(&self) -> bool {
        true
    }

    /// Metric used for range checks and exposed to behaviors.
    fn distance(&self, a: &Point, b: &Point) -> f64 {
        a.distance(b)
    }

    /// Normalizes a position into the resolver's world (identity on the plane).
    fn wrap(&self, position: &Point) -> Point {
        *position
    }
}

/// How two communication ranges combine into a connection decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangeRule {
    /// Connected iff distance ≤ min(range_a, range_b); links are undirected.
    #[default]
    Symmetric,
    /// `a` reaches `b` iff distance ≤ range_a; may produce directed links.
    Asymmetric,
}

fn within_range(rule: RangeRule, from: &LinkEndpoint, to: &LinkEndpoint, distance: f64) -> bool {
    let (Some(from_range), Some(to_range)) = (from.communication_range, to.communication_range) else {
        return false;
    };
    match rule {
        RangeRule::Symmetric => distance <= from_range.min(to_range),
        RangeRule::Asymmetric => distance <= from_range,
    }
}

/// Default resolver: Euclidean distance against the nodes' ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeResolver {
    rule: RangeRule,
}

impl RangeResolver {
    pub fn new(rule: RangeRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> RangeRule {
        self.rule
    }
}

impl LinkResolver for RangeResolver {
    fn is_connected(&self, from: &LinkEndpoint, to: &LinkEndpoint, _obstacles: &ObstacleSet) -> bool {
        within_range(self.rule, from, to, from.position.distance(&to.position))
    }

    fn is_symmetric(&self) -> bool {
        self.rule == RangeRule::Symmetric
    }
}

/// Range resolver on a bounded `width x height` world whose edges wrap around.
#[derive(Debug, Clone, Copy)]
pub struct ToroidalResolver {
    width: f64,
    height: f64,
    rule: RangeRule,
}

impl ToroidalResolver {
    pub fn new(width: f64, height: f64) -> Result<Self, TopologyError> {
        Self::with_rule(width, height, RangeRule::Symmetric)
    }

    pub fn with_rule(width: f64, height: f64, rule: RangeRule) -> Result<Self, TopologyError> {
        if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
            return Err(TopologyError::InvalidConfiguration(format!(
                "toroidal world must have positive finite size, got {} x {}",
                width, height
            )));
        }
        Ok(Self { width, height, rule })
    }

    pub fn dimensions(&self) -> (f64, f64) {
        (self.width, self.height)
    }
}

impl LinkResolver for ToroidalResolver {
    fn is_connected(&self, from: &LinkEndpoint, to: &LinkEndpoint, _obstacles: &ObstacleSet) -> bool {
        within_range(self.rule, from, to, self.distance(&from.position, &to.position))
    }

    fn is_symmetric(&self) -> bool {
        self.rule == RangeRule::Symmetric
    }

    fn distance(&self, a: &Point, b: &Point) -> f64 {
        geometry::toroidal_distance(a, b, self.width, self.height)
    }

    fn wrap(&self, position: &Point) -> Point {
        geometry::wrap(position, self.width, self.height)
    }
}

/// Wraps another resolver and additionally requires clear line-of-sight.
#[derive(Debug, Clone)]
pub struct ObstacleAwareResolver {
    inner: Arc<dyn LinkResolver>,
}

impl ObstacleAwareResolver {
    pub fn new(inner: Arc<dyn LinkResolver>) -> Self {
        Self { inner }
    }

    /// Line-of-sight on top of the symmetric range rule.
    pub fn range() -> Self {
        Self::new(Arc::new(RangeResolver::default()))
    }
}

impl LinkResolver for ObstacleAwareResolver {
    fn is_connected(&self, from: &LinkEndpoint, to: &LinkEndpoint, obstacles: &ObstacleSet) -> bool {
        self.inner.is_connected(from, to, obstacles) && !obstacles.blocks(&from.position, &to.position)
    }

    fn is_symmetric(&self) -> bool {
        self.inner.is_symmetric()
    }

    fn distance(&self, a: &Point, b: &Point) -> f64 {
        self.inner.distance(a, b)
    }

    fn wrap(&self, position: &Point) -> Point {
        self.inner.wrap(position)
    }
}
