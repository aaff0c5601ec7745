//! Property-change notification bus.
//!
//! Mutations are recorded into a [`NotificationBatch`] while the structural
//! lock is held and published to observers once per tick (or once per
//! external mutation), after the lock is released. Observers therefore never
//! see a half-updated topology.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::error::BehaviorError;
use super::types::{Link, NodeId, ObstacleId};

/// Entity a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Topology,
    Node(NodeId),
    Link(Link),
    Obstacle(ObstacleId),
}

/// What happened to the subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Change {
    Added,
    Removed,
    /// Built-in attribute (`"position"`, `"communication_range"`, ...).
    Property(String),
    /// Entry in a node's user property map, whatever its key.
    UserProperty(String),
}

impl Change {
    pub fn property(key: impl Into<String>) -> Self {
        Change::Property(key.into())
    }

    pub fn user_property(key: impl Into<String>) -> Self {
        Change::UserProperty(key.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub subject: Subject,
    pub change: Change,
}

/// Notifications accumulated between two publications, one entry per logical change.
#[derive(Debug, Default)]
pub struct NotificationBatch {
    entries: Vec<Notification>,
    seen: HashSet<Notification>,
}

impl NotificationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a change; repeating the same change within one batch is a no-op.
    pub fn notify(&mut self, subject: Subject, change: Change) {
        let notification = Notification { subject, change };
        if self.seen.insert(notification.clone()) {
            self.entries.push(notification);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    /// Empties the batch, returning its entries in recording order.
    pub fn take(&mut self) -> Vec<Notification> {
        self.seen.clear();
        std::mem::take(&mut self.entries)
    }
}

/// Receives batched topology changes. Called on the thread that completed the
/// tick or mutation, outside the structural lock, so it may query the
/// simulation handle.
pub trait TopologyObserver: Send + Sync {
    fn on_notifications(&self, tick: u64, notifications: &[Notification]);

    /// A node's behavior failed; the rest of the simulation carried on.
    fn on_behavior_error(&self, _error: &BehaviorError) {}

    /// An operator command that is not a built-in clock command.
    fn on_command(&self, _command: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer registry.
#[derive(Default)]
pub struct NotificationBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn TopologyObserver>)>>,
    next_id: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn TopologyObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push((id, observer));
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(entry_id, _)| *entry_id != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Delivers one batch. Empty batches are not published.
    pub fn publish(&self, tick: u64, notifications: &[Notification]) {
        if notifications.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            observer.on_notifications(tick, notifications);
        }
    }

    pub fn report_errors(&self, errors: &[BehaviorError]) {
        if errors.is_empty() {
            return;
        }
        for observer in self.snapshot() {
            for error in errors {
                observer.on_behavior_error(error);
            }
        }
    }

    pub fn dispatch_command(&self, command: &str) {
        for observer in self.snapshot() {
            observer.on_command(command);
        }
    }

    // Observers may subscribe or unsubscribe from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn TopologyObserver>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }
}
