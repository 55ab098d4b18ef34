//! Scenario playback agent
//!
//! Replays a time-sorted script of `{time, topic, message}` events. Each
//! event is published exactly once, on the first tick whose simulated time
//! has reached the event's scheduled time; events are consumed, never
//! replayed.

use serde::Deserialize;
use std::rc::Rc;
use tracing::{debug, info};

use crate::agents::Agent;
use crate::bus::{FieldMap, MessageBus};
use crate::core::error::SimulationError;

/// One scripted event
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedEvent {
    pub time: f64,
    pub topic: String,
    pub message: FieldMap,
}

/// Publishes scripted events when their scheduled time is reached
pub struct ScenarioAgent {
    id: String,
    bus: Rc<MessageBus>,
    /// Sorted by time; `cursor` marks the first unpublished event
    events: Vec<ScriptedEvent>,
    cursor: usize,
}

impl ScenarioAgent {
    pub fn new(id: &str, bus: Rc<MessageBus>, mut events: Vec<ScriptedEvent>) -> Self {
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
        info!(id, events = events.len(), "scenario agent created");
        Self {
            id: id.to_string(),
            bus,
            events,
            cursor: 0,
        }
    }

    /// Events not yet published
    pub fn pending(&self) -> usize {
        self.events.len() - self.cursor
    }
}

impl Agent for ScenarioAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        while self.cursor < self.events.len() && self.events[self.cursor].time <= current_time {
            let event = &self.events[self.cursor];
            debug!(
                id = self.id.as_str(),
                topic = event.topic.as_str(),
                scheduled = event.time,
                "scripted event fired"
            );
            self.bus.publish(&event.topic, event.message.clone())?;
            self.cursor += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::payload;
    use std::cell::RefCell;

    fn event(time: f64, topic: &str, value: f64) -> ScriptedEvent {
        ScriptedEvent {
            time,
            topic: topic.to_string(),
            message: payload(&[("value", value)]),
        }
    }

    #[test]
    fn test_events_fire_once_in_order() {
        let bus = MessageBus::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        bus.subscribe("cmd", "probe", move |msg| {
            sink.borrow_mut().push(msg.get("value").unwrap());
            Ok(())
        });

        // Deliberately unsorted input
        let mut agent = ScenarioAgent::new(
            "script_1",
            bus,
            vec![event(20.0, "cmd", 2.0), event(5.0, "cmd", 1.0)],
        );

        agent.run(0.0).unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(agent.pending(), 2);

        agent.run(5.0).unwrap();
        assert_eq!(*log.borrow(), vec![1.0]);

        // Catch-up past several events at once still fires each exactly once
        agent.run(100.0).unwrap();
        assert_eq!(*log.borrow(), vec![1.0, 2.0]);
        agent.run(200.0).unwrap();
        assert_eq!(*log.borrow(), vec![1.0, 2.0]);
        assert_eq!(agent.pending(), 0);
    }
}
