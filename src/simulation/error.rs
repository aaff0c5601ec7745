//! Error taxonomy for the simulation engine.
//!
//! API misuse is returned synchronously as [`TopologyError`]. Faults raised by
//! user behavior code never propagate; they are captured as [`BehaviorError`]
//! and handed to observers.

use std::fmt;

use super::obstacle::ObstacleError;
use super::types::NodeId;

/// Errors surfaced to the caller of a topology or scheduler operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyError {
    /// Operation not allowed in the current scheduler state (e.g. `step()` while running).
    InvalidState(String),
    /// Operation referenced a node, link or obstacle that does not exist.
    UnknownEntity(String),
    /// Rejected reconfiguration; state is unchanged.
    InvalidConfiguration(String),
    /// Obstacle shape failed validation.
    InvalidObstacle(ObstacleError),
    /// The operator command queue is full.
    CommandRejected(String),
    /// The scheduler loop hit a fatal fault and stopped ticking.
    SchedulerFault(String),
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            TopologyError::UnknownEntity(msg) => write!(f, "Unknown entity: {}", msg),
            TopologyError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            TopologyError::InvalidObstacle(err) => write!(f, "Invalid obstacle: {}", err),
            TopologyError::CommandRejected(msg) => write!(f, "Command rejected: {}", msg),
            TopologyError::SchedulerFault(msg) => write!(f, "Scheduler fault: {}", msg),
        }
    }
}

impl std::error::Error for TopologyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TopologyError::InvalidObstacle(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ObstacleError> for TopologyError {
    fn from(err: ObstacleError) -> Self {
        TopologyError::InvalidObstacle(err)
    }
}

/// Behavior lifecycle hook in which a fault happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callback {
    Start,
    Clock,
    Message,
    Selection,
    Stop,
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Callback::Start => "on_start",
            Callback::Clock => "on_clock",
            Callback::Message => "on_message",
            Callback::Selection => "on_selection",
            Callback::Stop => "on_stop",
        };
        f.write_str(name)
    }
}

/// A fault inside one node's behavior, isolated from the rest of the tick.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorError {
    pub node_id: NodeId,
    pub tick: u64,
    pub callback: Callback,
    pub reason: String,
}

impl fmt::Display for BehaviorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} failed in {} at tick {}: {}", self.node_id, self.callback, self.tick, self.reason)
    }
}

impl std::error::Error for BehaviorError {}
