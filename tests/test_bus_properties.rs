//! Message bus delivery contract
//!
//! Covers the observable bus properties: exactly-once delivery per
//! subscriber, silent no-subscriber publishes, depth-first cascade
//! ordering, and the cascade depth bound.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use water_simulator_core_rs::bus::{payload, FieldMap, HandlerError, MessageBus};
use water_simulator_core_rs::SimulationError;

#[test]
fn test_subscribe_then_publish_delivers_exactly_once() {
    let bus = MessageBus::new();
    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    bus.subscribe("state/res/1", "probe", move |msg| {
        assert_eq!(msg.get("water_level"), Some(10.0));
        c.set(c.get() + 1);
        Ok(())
    });
    bus.publish("state/res/1", payload(&[("water_level", 10.0)]))
        .unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn test_publish_without_subscribers_is_a_silent_success() {
    let bus = MessageBus::new();
    let delivered = bus.publish("nobody", payload(&[("x", 1.0)])).unwrap();
    assert_eq!(delivered, 0);
}

#[test]
fn test_no_replay_for_late_subscribers() {
    let bus = MessageBus::new();
    bus.publish("topic", payload(&[("x", 1.0)])).unwrap();
    let count = Rc::new(Cell::new(0u32));
    let c = Rc::clone(&count);
    bus.subscribe("topic", "late", move |_| {
        c.set(c.get() + 1);
        Ok(())
    });
    // The earlier message is gone; only new publishes arrive
    assert_eq!(count.get(), 0);
    bus.publish("topic", FieldMap::new()).unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn test_nested_publish_completes_before_next_subscriber() {
    // Handler A on T1 publishes to T2. Every T2 subscriber must run
    // before T1's second subscriber.
    let bus = MessageBus::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let bus_inner = Rc::clone(&bus);
    let log_a = Rc::clone(&order);
    bus.subscribe("t1", "a", move |_| {
        log_a.borrow_mut().push("a:start");
        bus_inner
            .publish("t2", FieldMap::new())
            .map(|_| ())
            .map_err(HandlerError::Fatal)?;
        log_a.borrow_mut().push("a:end");
        Ok(())
    });
    let log_b = Rc::clone(&order);
    bus.subscribe("t2", "b", move |_| {
        log_b.borrow_mut().push("b");
        Ok(())
    });
    let log_c = Rc::clone(&order);
    bus.subscribe("t1", "c", move |_| {
        log_c.borrow_mut().push("c");
        Ok(())
    });

    bus.publish("t1", FieldMap::new()).unwrap();
    assert_eq!(*order.borrow(), vec!["a:start", "b", "a:end", "c"]);
}

#[test]
fn test_handler_fault_does_not_abort_publication() {
    let bus = MessageBus::new();
    let reached = Rc::new(Cell::new(false));
    bus.subscribe("t", "faulty", |_| Err(HandlerError::Other("boom".into())));
    let r = Rc::clone(&reached);
    bus.subscribe("t", "healthy", move |_| {
        r.set(true);
        Ok(())
    });
    bus.publish("t", FieldMap::new()).unwrap();
    assert!(reached.get());
    assert_eq!(bus.fault_count(), 1);
}

#[test]
fn test_cascade_beyond_default_depth_fails() {
    // Ping-pong between two topics; the dynamic depth crosses 64
    let bus = MessageBus::new();
    let bus_a = Rc::clone(&bus);
    bus.subscribe("ping", "a", move |_| {
        bus_a
            .publish("pong", FieldMap::new())
            .map(|_| ())
            .map_err(HandlerError::Fatal)
    });
    let bus_b = Rc::clone(&bus);
    bus.subscribe("pong", "b", move |_| {
        bus_b
            .publish("ping", FieldMap::new())
            .map(|_| ())
            .map_err(HandlerError::Fatal)
    });

    let err = bus.publish("ping", FieldMap::new()).unwrap_err();
    match err {
        SimulationError::CascadeDepthExceeded { depth, .. } => assert_eq!(depth, 64),
        other => panic!("expected CascadeDepthExceeded, got {other}"),
    }
}

#[test]
fn test_bounded_cascade_succeeds() {
    // A finite chain shorter than the bound completes normally
    let bus = MessageBus::new();
    let hops = Rc::new(Cell::new(0u32));
    let bus_inner = Rc::clone(&bus);
    let h = Rc::clone(&hops);
    bus.subscribe("chain", "hopper", move |msg| {
        let remaining = msg.get("remaining").unwrap_or(0.0);
        h.set(h.get() + 1);
        if remaining > 0.0 {
            bus_inner
                .publish("chain", payload(&[("remaining", remaining - 1.0)]))
                .map(|_| ())
                .map_err(HandlerError::Fatal)?;
        }
        Ok(())
    });
    bus.publish("chain", payload(&[("remaining", 20.0)])).unwrap();
    assert_eq!(hops.get(), 21);
}

#[test]
fn test_message_metadata_carries_clock() {
    let bus = MessageBus::new();
    bus.set_clock(7, 7.5);
    let seen = Rc::new(Cell::new((0u64, 0.0f64)));
    let s = Rc::clone(&seen);
    bus.subscribe("t", "probe", move |msg| {
        s.set((msg.tick(), msg.time()));
        Ok(())
    });
    bus.publish("t", FieldMap::new()).unwrap();
    assert_eq!(seen.get(), (7, 7.5));
}
