//! In-memory message channel between nodes.
//!
//! Messages are queued with a visible tick of `created + delay` (delay ≥ 1), so
//! nothing sent during tick T can be observed during tick T. Destinations are
//! resolved against the sender's neighbors when the message is sent.

use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::TopologyError;
use super::types::NodeId;

/// Minimum and default propagation delay in ticks.
pub const DEFAULT_MESSAGE_DELAY: u64 = 1;

/// Longest accepted propagation delay in ticks.
pub const MAX_MESSAGE_DELAY: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

/// An immutable message as seen by the recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    sender: NodeId,
    recipient: Option<NodeId>,
    payload: Arc<serde_json::Value>,
    flag: Option<String>,
    created_tick: u64,
    visible_tick: u64,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    /// Explicit recipient for unicast, `None` for a neighbor broadcast.
    pub fn recipient(&self) -> Option<NodeId> {
        self.recipient
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn flag(&self) -> Option<&str> {
        self.flag.as_deref()
    }

    pub fn created_tick(&self) -> u64 {
        self.created_tick
    }

    pub fn visible_tick(&self) -> u64 {
        self.visible_tick
    }
}

/// A send request staged by a behavior; becomes a `Message` when the node's
/// callbacks commit.
#[derive(Debug, Clone)]
pub(crate) struct OutgoingMessage {
    pub recipient: Option<NodeId>,
    pub destinations: Vec<NodeId>,
    pub payload: serde_json::Value,
    pub flag: Option<String>,
}

/// A message bound for one inbox.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub destination: NodeId,
    pub message: Message,
}

/// Counters exposed to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    /// Messages accepted into the channel (one per send call).
    pub sent: u64,
    /// Copies placed into an inbox.
    pub delivered: u64,
    /// Copies discarded because the destination no longer exists.
    pub dropped: u64,
}

#[derive(Debug)]
pub(crate) struct MessageEngine {
    delay: u64,
    pending: BTreeMap<u64, Vec<Envelope>>,
    next_id: u64,
    stats: MessageStats,
}

impl MessageEngine {
    pub fn new(delay: u64) -> Result<Self, TopologyError> {
        validate_delay(delay)?;
        Ok(Self {
            delay,
            pending: BTreeMap::new(),
            next_id: 0,
            stats: MessageStats::default(),
        })
    }

    pub fn delay(&self) -> u64 {
        self.delay
    }

    /// Applies to messages sent from now on; queued messages keep their visible tick.
    pub fn set_delay(&mut self, delay: u64) -> Result<(), TopologyError> {
        validate_delay(delay)?;
        self.delay = delay;
        Ok(())
    }

    pub fn stats(&self) -> MessageStats {
        self.stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Queue one send call. An empty destination list is a no-op.
    pub fn enqueue(&mut self, sender: NodeId, outgoing: OutgoingMessage, tick: u64) {
        if outgoing.destinations.is_empty() {
            return;
        }
        let visible_tick = tick.saturating_add(self.delay);
        let message = Message {
            id: MessageId(self.next_id),
            sender,
            recipient: outgoing.recipient,
            payload: Arc::new(outgoing.payload),
            flag: outgoing.flag,
            created_tick: tick,
            visible_tick,
        };
        self.next_id += 1;
        self.stats.sent += 1;

        let queue = self.pending.entry(visible_tick).or_default();
        for destination in outgoing.destinations {
            queue.push(Envelope {
                destination,
                message: message.clone(),
            });
        }
    }

    /// Removes and returns every envelope visible at or before `tick`, oldest first.
    pub fn take_due(&mut self, tick: u64) -> Vec<Envelope> {
        let later = match tick.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.pending, later);
        due.into_values().flatten().collect()
    }

    pub fn record_delivered(&mut self) {
        self.stats.delivered += 1;
    }

    pub fn record_dropped(&mut self, envelope: &Envelope) {
        debug!(
            "Dropping message {} from {} to {}: destination no longer exists",
            envelope.message.id.0, envelope.message.sender, envelope.destination
        );
        self.stats.dropped += 1;
    }

    /// Discards every in-flight message.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for MessageEngine {
    fn default() -> Self {
        Self {
            delay: DEFAULT_MESSAGE_DELAY,
            pending: BTreeMap::new(),
            next_id: 0,
            stats: MessageStats::default(),
        }
    }
}

pub(crate) fn validate_delay(delay: u64) -> Result<(), TopologyError> {
    if !(DEFAULT_MESSAGE_DELAY..=MAX_MESSAGE_DELAY).contains(&delay) {
        return Err(TopologyError::InvalidConfiguration(format!(
            "message delay must be within {}..={} ticks, got {}",
            DEFAULT_MESSAGE_DELAY, MAX_MESSAGE_DELAY, delay
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outgoing(destinations: &[u32]) -> OutgoingMessage {
        OutgoingMessage {
            recipient: None,
            destinations: destinations.iter().copied().map(NodeId).collect(),
            payload: json!("hello"),
            flag: None,
        }
    }

    #[test]
    fn out_of_range_delay_is_rejected() {
        assert!(matches!(MessageEngine::new(0), Err(TopologyError::InvalidConfiguration(_))));
        assert!(matches!(MessageEngine::new(u64::MAX), Err(TopologyError::InvalidConfiguration(_))));
        let mut engine = MessageEngine::new(1).unwrap();
        assert!(engine.set_delay(0).is_err());
        assert!(engine.set_delay(MAX_MESSAGE_DELAY + 1).is_err());
        assert_eq!(engine.delay(), 1);
        engine.set_delay(MAX_MESSAGE_DELAY).unwrap();
        assert_eq!(engine.delay(), MAX_MESSAGE_DELAY);
    }

    #[test]
    fn visible_tick_saturates_near_the_end_of_time() {
        let mut engine = MessageEngine::new(MAX_MESSAGE_DELAY).unwrap();
        engine.enqueue(NodeId(1), outgoing(&[2]), u64::MAX - 1);
        assert_eq!(engine.pending_count(), 1);
        assert!(engine.take_due(u64::MAX - 1).is_empty());
    }

    #[test]
    fn messages_become_due_after_the_delay() {
        let mut engine = MessageEngine::new(1).unwrap();
        engine.enqueue(NodeId(1), outgoing(&[2, 3]), 5);
        assert!(engine.take_due(5).is_empty());

        let due = engine.take_due(6);
        assert_eq!(due.len(), 2);
        assert!(due.iter().all(|e| e.message.created_tick() == 5 && e.message.visible_tick() == 6));
        assert_eq!(due[0].message.id(), due[1].message.id());
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().sent, 1);
    }

    #[test]
    fn longer_delay_holds_messages_back() {
        let mut engine = MessageEngine::new(3).unwrap();
        engine.enqueue(NodeId(1), outgoing(&[2]), 0);
        engine.enqueue(NodeId(1), outgoing(&[2]), 1);
        assert!(engine.take_due(2).is_empty());
        assert_eq!(engine.take_due(3).len(), 1);
        // A late catch-up takes everything overdue in order
        let due = engine.take_due(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.created_tick(), 1);
    }

    #[test]
    fn empty_broadcast_enqueues_nothing() {
        let mut engine = MessageEngine::new(1).unwrap();
        engine.enqueue(NodeId(1), outgoing(&[]), 0);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().sent, 0);
    }
}
