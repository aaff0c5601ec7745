//! Dynamic topology simulation core.
//!
//! A population of nodes with user-supplied behavior moves through a 2D (or
//! wrap-around) world. Each tick the engine delivers messages, runs every
//! node's callbacks, re-derives the wireless links and publishes one batch of
//! change notifications.
//!
//! ## Module Organization
//!
//! - `types`, `geometry`: identifiers, links, points and segment tests
//! - `obstacle`: validated line-of-sight blockers
//! - `resolver`: range, toroidal and obstacle-aware link resolution
//! - `node`, `registry`: node state and the node/link registries
//! - `behavior`, `context`: the behavior trait and the per-callback context
//! - `message`: the delayed message channel
//! - `notification`: batched observer fan-out
//! - `topology`: the aggregate and the tick algorithm
//! - `scheduler`, `pacing`, `command`: the clock thread, its speed-scaled
//!   virtual time and operator commands
//! - `snapshot`: bulk import/export

pub mod behavior;
pub mod command;
pub mod context;
pub mod error;
pub mod geometry;
pub mod message;
pub mod node;
pub mod notification;
pub mod obstacle;
pub mod pacing;
mod registry;
pub mod resolver;
pub mod scheduler;
pub mod snapshot;
pub mod topology;
pub mod types;

pub use behavior::{Behavior, BehaviorFactory, Idle};
pub use command::SimulationCommand;
pub use context::NodeContext;
pub use error::{BehaviorError, Callback, TopologyError};
pub use geometry::Point;
pub use message::{Message, MessageId, MessageStats};
pub use node::{NodeSnapshot, NodeState};
pub use notification::{Change, Notification, Subject, SubscriptionId, TopologyObserver};
pub use obstacle::{Obstacle, ObstacleError, ObstacleSet, ObstacleShape};
pub use resolver::{LinkEndpoint, LinkResolver, ObstacleAwareResolver, RangeResolver, RangeRule, ToroidalResolver};
pub use scheduler::{ClockState, SimulationHandle, Simulator};
pub use snapshot::{LinkRecord, NodeRecord, TopologySnapshot};
pub use topology::{TickReport, Topology};
pub use types::{Link, LinkKind, LinkOrientation, NodeId, ObstacleId, Properties};
