//! Synchronous publish/subscribe message bus
//!
//! The bus is the only communication channel between agents and components.
//! Delivery is synchronous, same-thread and depth-first: if a handler for
//! topic T1 publishes to T2, every T2 subscriber runs to completion before
//! the next T1 subscriber. There is no queue and no replay; a subscriber
//! that joins after a publish misses the message.
//!
//! # Handler contract
//!
//! Handlers are shared closures (`Fn`, not `FnMut`) so that a cascade may
//! legally re-enter a handler that is further up the call stack. A handler
//! that needs to mutate its owner borrows the owner's `RefCell` for the
//! computation only and releases it before publishing onward. A failing
//! handler is a `HandlerFault`: logged, counted, and skipped; the remaining
//! subscribers still receive the message.
//!
//! # Cascade bound
//!
//! Re-entrant publish depth is capped (default 64). Exceeding the cap is
//! fatal and surfaces as [`SimulationError::CascadeDepthExceeded`], which
//! handlers propagate upward via [`HandlerError::Fatal`].

pub mod message;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::error::SimulationError;

pub use message::{payload, FieldMap, Message};

/// Default bound on re-entrant publish depth
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 64;

/// Non-fatal outcome of a single handler invocation
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The subscribing agent/component has been dropped
    #[error("subscriber no longer alive")]
    SubscriberGone,

    /// The subscriber's state was already mutably borrowed (handler
    /// re-entered its own owner mid-computation)
    #[error("subscriber state already borrowed")]
    Reentrant,

    /// Any other recoverable handler failure
    #[error("{0}")]
    Other(String),

    /// A fatal error that must abort the whole publication chain
    /// (cascade overflow bubbling up through nested publishes)
    #[error(transparent)]
    Fatal(SimulationError),
}

/// Result type for bus handlers
pub type HandlerResult = Result<(), HandlerError>;

type BusHandler = dyn Fn(&Message) -> HandlerResult;

/// Handle returned by [`MessageBus::subscribe`], usable for unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    /// Caller-supplied identity, normally the subscriber's agent/component
    /// id. Subscribing twice with the same (topic, label) is a no-op.
    label: String,
    handler: Rc<BusHandler>,
}

/// Topic-based pub/sub bus with deterministic, synchronous delivery
pub struct MessageBus {
    topics: RefCell<BTreeMap<String, Vec<Subscription>>>,
    next_id: Cell<u64>,
    depth: Cell<usize>,
    max_depth: usize,
    fault_count: Cell<u64>,
    /// (tick, simulated time) stamped onto outgoing messages; updated by
    /// the harness at the start of every tick
    clock: Cell<(u64, f64)>,
}

impl MessageBus {
    /// Create a bus with the default cascade depth bound
    pub fn new() -> Rc<Self> {
        Self::with_max_depth(DEFAULT_MAX_CASCADE_DEPTH)
    }

    /// Create a bus with an explicit cascade depth bound
    pub fn with_max_depth(max_depth: usize) -> Rc<Self> {
        Rc::new(Self {
            topics: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
            depth: Cell::new(0),
            max_depth,
            fault_count: Cell::new(0),
            clock: Cell::new((0, 0.0)),
        })
    }

    /// Register `handler` for every future message on `topic`
    ///
    /// Idempotent per `(topic, label)`: a second subscription with the same
    /// label returns the original handle and registers nothing.
    /// Subscriptions created while a delivery is in flight take effect on
    /// the next publish, not retroactively.
    pub fn subscribe<F>(&self, topic: &str, label: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) -> HandlerResult + 'static,
    {
        let mut topics = self.topics.borrow_mut();
        let subs = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = subs.iter().find(|s| s.label == label) {
            debug!(topic, label, "duplicate subscription ignored");
            return SubscriptionId(existing.id);
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        subs.push(Subscription {
            id,
            label: label.to_string(),
            handler: Rc::new(handler),
        });
        debug!(topic, label, "subscribed");
        SubscriptionId(id)
    }

    /// Remove a subscription; returns false if the handle is unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.topics.borrow_mut();
        for subs in topics.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id.0) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `fields` synchronously to every current subscriber of `topic`
    ///
    /// Subscribers run in subscription order against a snapshot of the
    /// subscription list. Returns the number of handlers that ran (faulted
    /// handlers included). Publishing to a topic with no subscribers is a
    /// silent success.
    pub fn publish(&self, topic: &str, fields: FieldMap) -> Result<usize, SimulationError> {
        let depth = self.depth.get() + 1;
        if depth > self.max_depth {
            return Err(SimulationError::CascadeDepthExceeded {
                topic: topic.to_string(),
                depth: self.max_depth,
            });
        }

        // Snapshot before iterating: handlers may subscribe new callbacks
        // mid-delivery and those must only see the next publish.
        let snapshot: Vec<(String, Rc<BusHandler>)> = {
            let topics = self.topics.borrow();
            match topics.get(topic) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.label.clone(), Rc::clone(&s.handler)))
                    .collect(),
                None => return Ok(0),
            }
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let (tick, time) = self.clock.get();
        let message = Message::new(topic, tick, time, fields);

        self.depth.set(depth);
        let result = self.deliver(&message, &snapshot);
        self.depth.set(depth - 1);
        result.map(|_| snapshot.len())
    }

    fn deliver(
        &self,
        message: &Message,
        snapshot: &[(String, Rc<BusHandler>)],
    ) -> Result<(), SimulationError> {
        for (label, handler) in snapshot {
            match (*handler.as_ref())(message) {
                Ok(()) => {}
                Err(HandlerError::Fatal(err)) => return Err(err),
                Err(fault) => {
                    self.fault_count.set(self.fault_count.get() + 1);
                    warn!(
                        topic = message.topic(),
                        subscriber = label.as_str(),
                        error = %fault,
                        "message handler fault"
                    );
                }
            }
        }
        Ok(())
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .borrow()
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Total handler faults recovered since the bus was created
    pub fn fault_count(&self) -> u64 {
        self.fault_count.get()
    }

    /// Stamp the (tick, time) metadata carried by subsequent messages
    ///
    /// Called by the harness at the start of every tick.
    pub fn set_clock(&self, tick: u64, time: f64) {
        self.clock.set((tick, time));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = MessageBus::new();
        let delivered = bus.publish("nobody/home", payload(&[("x", 1.0)])).unwrap();
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_subscribe_then_publish_delivers_once() {
        let bus = MessageBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.subscribe("state/res/1", "probe", move |msg| {
            sink.borrow_mut().push(msg.get("water_level").unwrap());
            Ok(())
        });
        bus.publish("state/res/1", payload(&[("water_level", 10.5)]))
            .unwrap();
        assert_eq!(*seen.borrow(), vec![10.5]);
    }

    #[test]
    fn test_duplicate_subscription_is_noop() {
        let bus = MessageBus::new();
        let count = Rc::new(Cell::new(0u32));
        let c1 = Rc::clone(&count);
        let c2 = Rc::clone(&count);
        let first = bus.subscribe("t", "same-label", move |_| {
            c1.set(c1.get() + 1);
            Ok(())
        });
        let second = bus.subscribe("t", "same-label", move |_| {
            c2.set(c2.get() + 1);
            Ok(())
        });
        assert_eq!(first, second);
        bus.publish("t", FieldMap::new()).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = MessageBus::new();
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let id = bus.subscribe("t", "probe", move |_| {
            c.set(c.get() + 1);
            Ok(())
        });
        bus.publish("t", FieldMap::new()).unwrap();
        assert!(bus.unsubscribe(id));
        bus.publish("t", FieldMap::new()).unwrap();
        assert_eq!(count.get(), 1);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_faulting_handler_does_not_stop_remaining_subscribers() {
        let bus = MessageBus::new();
        let reached = Rc::new(Cell::new(false));
        bus.subscribe("t", "bad", |_| Err(HandlerError::Other("boom".into())));
        let r = Rc::clone(&reached);
        bus.subscribe("t", "good", move |_| {
            r.set(true);
            Ok(())
        });
        bus.publish("t", FieldMap::new()).unwrap();
        assert!(reached.get());
        assert_eq!(bus.fault_count(), 1);
    }

    #[test]
    fn test_mid_delivery_subscription_takes_effect_next_publish() {
        let bus = MessageBus::new();
        let late_calls = Rc::new(Cell::new(0u32));

        let bus_inner = Rc::clone(&bus);
        let late = Rc::clone(&late_calls);
        bus.subscribe("t", "first", move |_| {
            let late = Rc::clone(&late);
            bus_inner.subscribe("t", "late-joiner", move |_| {
                late.set(late.get() + 1);
                Ok(())
            });
            Ok(())
        });

        bus.publish("t", FieldMap::new()).unwrap();
        assert_eq!(late_calls.get(), 0, "not retroactive for in-flight delivery");
        bus.publish("t", FieldMap::new()).unwrap();
        assert_eq!(late_calls.get(), 1);
    }

    #[test]
    fn test_cascade_depth_exceeded() {
        let bus = MessageBus::with_max_depth(8);
        let bus_inner = Rc::clone(&bus);
        bus.subscribe("ping", "looper", move |_| {
            bus_inner
                .publish("ping", FieldMap::new())
                .map(|_| ())
                .map_err(HandlerError::Fatal)
        });
        let err = bus.publish("ping", FieldMap::new()).unwrap_err();
        match err {
            SimulationError::CascadeDepthExceeded { depth, .. } => assert_eq!(depth, 8),
            other => panic!("expected CascadeDepthExceeded, got {other}"),
        }
    }
}
