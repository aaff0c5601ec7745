//! Obstacles that block line-of-sight between two positions.
//!
//! Shapes are validated when they are built (or deserialized), so link
//! resolution never has to deal with degenerate geometry.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::geometry::{self, Point};
use super::types::ObstacleId;

/// Reasons an obstacle shape is rejected at construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum ObstacleError {
    NonFiniteCoordinate,
    NonPositiveRadius(f64),
    DegenerateRectangle,
    DegenerateFacet,
}

impl fmt::Display for ObstacleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObstacleError::NonFiniteCoordinate => write!(f, "coordinates must be finite"),
            ObstacleError::NonPositiveRadius(r) => write!(f, "circle radius {} must be positive", r),
            ObstacleError::DegenerateRectangle => write!(f, "rectangle corners must differ on both axes"),
            ObstacleError::DegenerateFacet => write!(f, "facet edges must span a non-zero area"),
        }
    }
}

impl std::error::Error for ObstacleError {}

/// Raw obstacle geometry as read from or written to a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObstacleShape {
    /// Disc on the plane.
    #[serde(rename = "circle")]
    Circle { center: Point, radius: f64 },
    /// Axis-aligned rectangle on the plane given by two opposite corners.
    #[serde(rename = "rectangle")]
    Rectangle {
        #[serde(rename = "top-left-position")]
        top_left: Point,
        #[serde(rename = "bottom-right-position")]
        bottom_right: Point,
    },
    /// Rectangular facet `origin + a*edge_u + b*edge_v`, `a, b` in `[0, 1]`.
    #[serde(rename = "facet")]
    Facet { origin: Point, edge_u: Point, edge_v: Point },
}

/// A validated obstacle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ObstacleShape", into = "ObstacleShape")]
pub struct Obstacle {
    shape: ObstacleShape,
}

impl Obstacle {
    pub fn circle(center: Point, radius: f64) -> Result<Self, ObstacleError> {
        Self::try_from(ObstacleShape::Circle { center, radius })
    }

    pub fn rectangle(top_left: Point, bottom_right: Point) -> Result<Self, ObstacleError> {
        Self::try_from(ObstacleShape::Rectangle { top_left, bottom_right })
    }

    pub fn facet(origin: Point, edge_u: Point, edge_v: Point) -> Result<Self, ObstacleError> {
        Self::try_from(ObstacleShape::Facet { origin, edge_u, edge_v })
    }

    pub fn shape(&self) -> &ObstacleShape {
        &self.shape
    }

    /// Line-of-sight test against the segment `a`–`b`.
    ///
    /// A degenerate segment (`a == b`) is treated as a point-inside test.
    pub fn intersects_segment(&self, a: &Point, b: &Point) -> bool {
        match &self.shape {
            ObstacleShape::Circle { center, radius } => geometry::segment_intersects_circle(a, b, center, *radius),
            ObstacleShape::Rectangle { top_left, bottom_right } => {
                if a == b {
                    geometry::point_in_rect(a, top_left, bottom_right)
                } else {
                    geometry::segment_intersects_rect(a, b, top_left, bottom_right)
                }
            }
            ObstacleShape::Facet { origin, edge_u, edge_v } => geometry::segment_intersects_facet(a, b, origin, edge_u, edge_v),
        }
    }
}

impl TryFrom<ObstacleShape> for Obstacle {
    type Error = ObstacleError;

    fn try_from(shape: ObstacleShape) -> Result<Self, Self::Error> {
        match &shape {
            ObstacleShape::Circle { center, radius } => {
                if !center.is_finite() || !radius.is_finite() {
                    return Err(ObstacleError::NonFiniteCoordinate);
                }
                if *radius <= 0.0 {
                    return Err(ObstacleError::NonPositiveRadius(*radius));
                }
            }
            ObstacleShape::Rectangle { top_left, bottom_right } => {
                if !top_left.is_finite() || !bottom_right.is_finite() {
                    return Err(ObstacleError::NonFiniteCoordinate);
                }
                if top_left.x == bottom_right.x || top_left.y == bottom_right.y {
                    return Err(ObstacleError::DegenerateRectangle);
                }
            }
            ObstacleShape::Facet { origin, edge_u, edge_v } => {
                if !origin.is_finite() || !edge_u.is_finite() || !edge_v.is_finite() {
                    return Err(ObstacleError::NonFiniteCoordinate);
                }
                if geometry::parallelogram_area(edge_u, edge_v) == 0.0 {
                    return Err(ObstacleError::DegenerateFacet);
                }
            }
        }
        Ok(Self { shape })
    }
}

impl From<Obstacle> for ObstacleShape {
    fn from(obstacle: Obstacle) -> Self {
        obstacle.shape
    }
}

/// The topology's obstacle collection. Shared copy-on-write with resolvers
/// and observers, so a snapshot never changes underneath a reader.
#[derive(Debug, Clone, Default)]
pub struct ObstacleSet {
    entries: Vec<(ObstacleId, Obstacle)>,
}

impl ObstacleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: ObstacleId, obstacle: Obstacle) {
        self.entries.push((id, obstacle));
    }

    pub(crate) fn remove(&mut self, id: ObstacleId) -> Option<Obstacle> {
        let index = self.entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        Some(self.entries.remove(index).1)
    }

    pub fn get(&self, id: ObstacleId) -> Option<&Obstacle> {
        self.entries.iter().find(|(entry_id, _)| *entry_id == id).map(|(_, o)| o)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObstacleId, &Obstacle)> {
        self.entries.iter().map(|(id, o)| (*id, o))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any obstacle intersects the straight segment `a`–`b`.
    pub fn blocks(&self, a: &Point, b: &Point) -> bool {
        self.entries.iter().any(|(_, obstacle)| obstacle.intersects_segment(a, b))
    }
}
