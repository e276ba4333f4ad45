//! Priority event bus with bridging rules.
//!
//! # Guarantees
//!
//! - **Priority order**: security events are delivered before lifecycle
//!   events, lifecycle before routine parameter updates
//! - **FIFO within a priority**: ties are broken by publish sequence
//! - **Cooperative**: `publish` only queues; delivery happens in [`EventBus::drain`]
//!   on the caller's thread, so handlers never run concurrently
//! - **Bridges fire once per cascade**: a bridge that already translated an
//!   event descended from the same root publish is skipped. The record lives
//!   for one drain, or for a whole [`EventBus::begin_turn`] span when one is
//!   open, so a cascade that leaves the bus and comes back still counts
//!
//! # Bridges
//!
//! A [`Bridge`] is a pure translation from one domain's vocabulary into
//! another's. The bus re-publishes whatever it returns as a new event that
//! shares the consumed event's `root`.
//!
//! ```ignore
//! let bus = EventBus::new();
//! bus.register_bridge(Arc::new(LightingToAmbient));
//!
//! let sub = bus.subscribe(Topic::Command, |envelope| {
//!     println!("bridged command: {:?}", envelope.signal);
//! });
//!
//! bus.publish(Signal::Region(event));
//! bus.drain();
//! sub.unsubscribe();
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::core::{EventEnvelope, EventId, Priority, Signal, Topic};

/// Handler invoked for each delivered event on a subscribed topic.
pub type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Translates events of one topic into signals for another domain.
///
/// Implementations must be pure: no side effects beyond the returned signal.
pub trait Bridge: Send + Sync + 'static {
    /// Stable name, used for cycle detection and logs.
    fn name(&self) -> &'static str;

    /// Topic whose events this bridge consumes.
    fn source(&self) -> Topic;

    fn translate(&self, signal: &Signal) -> Option<Signal>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Queued {
    priority: Priority,
    seq: u64,
    envelope: EventEnvelope,
}

impl Queued {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct BusInner {
    queue: Mutex<BinaryHeap<Queued>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    subscribers: DashMap<Topic, Vec<(SubscriptionId, Handler)>>,
    bridges: RwLock<Vec<Arc<dyn Bridge>>>,
    /// (root event, bridge) pairs that already fired during this drain, or
    /// during the open turn.
    visited: Mutex<HashSet<(EventId, &'static str)>>,
    draining: AtomicBool,
    turns: AtomicUsize,
}

/// Recover the guard from a poisoned lock; a panicking handler must not
/// wedge the bus.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(BinaryHeap::new()),
                sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
                subscribers: DashMap::new(),
                bridges: RwLock::new(Vec::new()),
                visited: Mutex::new(HashSet::new()),
                draining: AtomicBool::new(false),
                turns: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a signal for delivery. Returns the new event's id.
    pub fn publish(&self, signal: Signal) -> EventId {
        self.publish_envelope(EventEnvelope::new(signal))
    }

    pub fn publish_envelope(&self, envelope: EventEnvelope) -> EventId {
        let id = envelope.id;
        let seq = self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(event = %id, priority = ?envelope.priority, seq, "event queued");
        lock(&self.inner.queue).push(Queued {
            priority: envelope.priority,
            seq,
            envelope,
        });
        id
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner
            .subscribers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            topic,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn register_bridge(&self, bridge: Arc<dyn Bridge>) {
        debug!(bridge = bridge.name(), source = ?bridge.source(), "bridge registered");
        self.inner
            .bridges
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(bridge);
    }

    /// Keep cycle detection state across drains until the guard drops.
    ///
    /// Owners that route bridged events through their own queue and publish
    /// the results later hold a turn so a cascade is still recognized when
    /// it re-enters the bus in a later drain.
    pub fn begin_turn(&self) -> TurnGuard {
        self.inner.turns.fetch_add(1, AtomicOrdering::AcqRel);
        TurnGuard {
            inner: self.inner.clone(),
        }
    }

    /// Events waiting for delivery.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.subscribers.get(&topic).map_or(0, |subs| subs.len())
    }

    /// Deliver queued events until the queue is empty, including events
    /// published by handlers and bridges along the way.
    ///
    /// Re-entrant calls (a handler draining the bus it is called from)
    /// return immediately; the outer drain picks up their events.
    pub fn drain(&self) -> usize {
        if self
            .inner
            .draining
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return 0;
        }
        let _guard = DrainGuard(&self.inner);

        let mut delivered = 0;
        loop {
            let next = lock(&self.inner.queue).pop();
            let Some(Queued { envelope, .. }) = next else {
                break;
            };
            self.deliver(&envelope);
            self.run_bridges(&envelope);
            delivered += 1;
        }
        if self.inner.turns.load(AtomicOrdering::Acquire) == 0 {
            lock(&self.inner.visited).clear();
        }
        delivered
    }

    fn deliver(&self, envelope: &EventEnvelope) {
        let topic = envelope.signal.topic();
        // Clone out so handlers may subscribe or publish without deadlocking.
        let handlers: Vec<Handler> = self
            .inner
            .subscribers
            .get(&topic)
            .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        trace!(event = %envelope.id, ?topic, handlers = handlers.len(), "delivering event");
        for handler in handlers {
            handler(envelope);
        }
    }

    fn run_bridges(&self, envelope: &EventEnvelope) {
        let topic = envelope.signal.topic();
        let bridges: Vec<Arc<dyn Bridge>> = self
            .inner
            .bridges
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|bridge| bridge.source() == topic)
            .cloned()
            .collect();

        for bridge in bridges {
            let Some(translated) = bridge.translate(&envelope.signal) else {
                continue;
            };
            if translated == envelope.signal {
                warn!(bridge = bridge.name(), "bridge returned the event it consumed, dropped");
                continue;
            }
            if !lock(&self.inner.visited).insert((envelope.root, bridge.name())) {
                warn!(
                    bridge = bridge.name(),
                    root = %envelope.root,
                    hops = ?envelope.hops,
                    "bridge cycle suppressed"
                );
                continue;
            }
            debug!(bridge = bridge.name(), root = %envelope.root, "bridge fired");
            self.publish_envelope(envelope.bridged(bridge.name(), translated));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending", &self.pending())
            .field("topics", &self.inner.subscribers.len())
            .finish()
    }
}

struct DrainGuard<'a>(&'a BusInner);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.draining.store(false, AtomicOrdering::Release);
    }
}

/// Handle returned by [`EventBus::begin_turn`].
#[must_use = "the turn ends when the guard is dropped"]
pub struct TurnGuard {
    inner: Arc<BusInner>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.inner.turns.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
            lock(&self.inner.visited).clear();
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Stop delivery to this handler. No-op if the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Some(mut subs) = inner.subscribers.get_mut(&self.topic) {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BloomCommand, Command, RegionId, SystemEvent};
    use crate::region::RegionEvent;
    use crate::security::{SecurityEvent, SecurityLevel, TransitionOrigin};

    fn recorder(bus: &EventBus, topic: Topic) -> (Subscription, Arc<Mutex<Vec<EventEnvelope>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(topic, move |envelope| sink.lock().unwrap().push(envelope.clone()));
        (sub, seen)
    }

    fn preset_applied(name: &str) -> Signal {
        Signal::Region(RegionEvent::PresetApplied {
            region: RegionId::Bloom,
            name: name.to_string(),
        })
    }

    fn level_changed() -> Signal {
        Signal::Security(SecurityEvent::LevelChanged {
            from: SecurityLevel::Normal,
            to: SecurityLevel::Warning,
            origin: TransitionOrigin::Escalation,
        })
    }

    #[test]
    fn delivers_by_priority_then_fifo() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for topic in [Topic::Region(RegionId::Bloom), Topic::Security, Topic::System] {
            let sink = order.clone();
            bus.subscribe(topic, move |envelope| sink.lock().unwrap().push(envelope.priority));
        }

        bus.publish(preset_applied("subtle"));
        bus.publish(Signal::System(SystemEvent::Disposed));
        bus.publish(preset_applied("dramatic"));
        bus.publish(level_changed());

        assert_eq!(bus.drain(), 4);
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                Priority::Security,
                Priority::Lifecycle,
                Priority::Routine,
                Priority::Routine
            ]
        );
    }

    #[test]
    fn equal_priority_keeps_publish_order() {
        let bus = EventBus::new();
        let (_sub, seen) = recorder(&bus, Topic::Region(RegionId::Bloom));

        for name in ["a", "b", "c", "d"] {
            bus.publish(preset_applied(name));
        }
        bus.drain();

        let names: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.signal {
                Signal::Region(RegionEvent::PresetApplied { name, .. }) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (sub, seen) = recorder(&bus, Topic::System);

        bus.publish(Signal::System(SystemEvent::Disposed));
        bus.drain();
        sub.unsubscribe();
        bus.publish(Signal::System(SystemEvent::Disposed));
        bus.drain();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(Topic::System), 0);
    }

    #[test]
    fn handlers_may_publish_during_drain() {
        let bus = EventBus::new();
        let relay = bus.clone();
        bus.subscribe(Topic::Security, move |_| {
            relay.publish(Signal::System(SystemEvent::Disposed));
            // Nested drain is a no-op; the outer drain delivers it.
            assert_eq!(relay.drain(), 0);
        });
        let (_sub, seen) = recorder(&bus, Topic::System);

        bus.publish(level_changed());
        assert_eq!(bus.drain(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    struct Echo;

    impl Bridge for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn source(&self) -> Topic {
            Topic::System
        }

        fn translate(&self, signal: &Signal) -> Option<Signal> {
            Some(signal.clone())
        }
    }

    /// Two bridges that translate into each other's source topic.
    struct Ping;
    struct Pong;

    impl Bridge for Ping {
        fn name(&self) -> &'static str {
            "ping"
        }

        fn source(&self) -> Topic {
            Topic::Region(RegionId::Bloom)
        }

        fn translate(&self, _signal: &Signal) -> Option<Signal> {
            Some(Signal::Command(Command::Bloom(BloomCommand::Enable)))
        }
    }

    impl Bridge for Pong {
        fn name(&self) -> &'static str {
            "pong"
        }

        fn source(&self) -> Topic {
            Topic::Command
        }

        fn translate(&self, _signal: &Signal) -> Option<Signal> {
            Some(preset_applied("pong"))
        }
    }

    #[test]
    fn bridge_returning_consumed_event_is_dropped() {
        let bus = EventBus::new();
        bus.register_bridge(Arc::new(Echo));
        let (_sub, seen) = recorder(&bus, Topic::System);

        bus.publish(Signal::System(SystemEvent::Disposed));
        assert_eq!(bus.drain(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn bridge_cycles_terminate() {
        let bus = EventBus::new();
        bus.register_bridge(Arc::new(Ping));
        bus.register_bridge(Arc::new(Pong));
        let (_commands, commands) = recorder(&bus, Topic::Command);

        bus.publish(preset_applied("start"));
        // start -> ping -> pong -> (ping already fired for this root)
        assert_eq!(bus.drain(), 3);

        let commands = commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].hops.as_slice(), ["ping"]);
    }

    #[test]
    fn open_turn_remembers_bridges_across_drains() {
        let bus = EventBus::new();
        bus.register_bridge(Arc::new(Ping));
        let (_sub, commands) = recorder(&bus, Topic::Command);

        let turn = bus.begin_turn();
        let first = EventEnvelope::new(preset_applied("start"));
        let again = EventEnvelope {
            id: EventId::new(),
            ..first.clone()
        };
        bus.publish_envelope(first);
        bus.drain();
        // Same cascade coming back after the first drain finished.
        bus.publish_envelope(again.clone());
        bus.drain();
        assert_eq!(commands.lock().unwrap().len(), 1);

        drop(turn);
        bus.publish_envelope(again);
        bus.drain();
        assert_eq!(commands.lock().unwrap().len(), 2);
    }

    #[test]
    fn bridges_fire_again_for_a_new_root() {
        let bus = EventBus::new();
        bus.register_bridge(Arc::new(Ping));
        let (_sub, commands) = recorder(&bus, Topic::Command);

        bus.publish(preset_applied("one"));
        bus.publish(preset_applied("two"));
        bus.drain();

        assert_eq!(commands.lock().unwrap().len(), 2);
    }
}
