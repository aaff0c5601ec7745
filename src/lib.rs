//! Discrete-time simulator for mobile agents on a dynamically changing network.
//!
//! Build a [`Topology`], add nodes with a [`Behavior`], then either call
//! [`Topology::tick`] directly or hand the topology to a [`Simulator`], which
//! paces ticks on its own thread and exposes a [`SimulationHandle`] for
//! concurrent operators and observers.

pub mod config;
pub mod scene;
pub mod simulation;

pub use config::{ResolverKind, SimulationConfig};
pub use simulation::{
    Behavior, BehaviorError, ClockState, Link, LinkKind, LinkOrientation, Message, NodeContext, NodeId, Notification, Obstacle,
    Point, SimulationHandle, Simulator, TopologyError, Topology, TopologyObserver, TopologySnapshot,
};
