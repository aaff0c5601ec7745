//! User-supplied agent behavior.
//!
//! The engine holds behaviors as trait objects, so any number of agent kinds
//! can share one topology. Every hook has a no-op default. Returning an error
//! (or panicking) discards the effects staged during that node's turn and is
//! reported to observers; other nodes are unaffected.

use std::sync::Arc;

use super::context::NodeContext;
use super::message::Message;

pub trait Behavior: Send {
    /// First tick the node takes part in (and again after a restart).
    fn on_start(&mut self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once per tick, after the tick's messages have been handed to `on_message`.
    fn on_clock(&mut self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Once per delivered message, immediately before `on_clock`.
    fn on_message(&mut self, _ctx: &mut NodeContext<'_>, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// An external actor selected this node. Runs outside the tick cadence.
    fn on_selection(&mut self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The node is being removed; its links are already gone.
    fn on_stop(&mut self, _ctx: &mut NodeContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Behavior that does nothing. Used when no other factory is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Idle;

impl Behavior for Idle {}

/// Builds the behavior for nodes added without an explicit one.
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn Behavior> + Send + Sync>;

pub fn idle_factory() -> BehaviorFactory {
    Arc::new(|| Box::new(Idle))
}
