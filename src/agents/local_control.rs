//! Local control agent
//!
//! Wraps one [`Controller`] and handles the messaging around it: it reacts
//! to observation messages by computing a control action and publishing it
//! on its action topic, accepts `new_setpoint` commands from a supervisor,
//! and optionally records feedback state from the controlled object.
//!
//! The whole perception-to-action path runs inside the synchronous publish
//! cascade: a digital twin's state publish triggers the observation
//! handler, which publishes the action, which the controlled component's
//! handler consumes, all before the twin's `run` returns.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agents::Agent;
use crate::bus::{payload, FieldMap, HandlerError, MessageBus};
use crate::control::Controller;
use crate::core::error::SimulationError;

/// Messaging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalControlConfig {
    pub observation_topic: String,
    /// Key extracted from observation messages as the process variable
    pub observation_key: String,
    pub action_topic: String,
    /// Topic carrying `new_setpoint` commands from a supervisor
    #[serde(default)]
    pub command_topic: Option<String>,
    /// Topic carrying state feedback from the controlled object
    #[serde(default)]
    pub feedback_topic: Option<String>,
}

/// A control agent driving one actuator through the bus
pub struct LocalControlAgent {
    id: String,
    controller: Box<dyn Controller>,
    bus: Rc<MessageBus>,
    config: LocalControlConfig,
    dt: f64,
    latest_feedback: FieldMap,
}

impl LocalControlAgent {
    /// Create the agent and register its bus handlers
    pub fn spawn(
        id: &str,
        controller: Box<dyn Controller>,
        bus: &Rc<MessageBus>,
        config: LocalControlConfig,
        dt: f64,
    ) -> Rc<RefCell<Self>> {
        let agent = Rc::new(RefCell::new(Self {
            id: id.to_string(),
            controller,
            bus: Rc::clone(bus),
            config: config.clone(),
            dt,
            latest_feedback: FieldMap::new(),
        }));

        // Observation: compute and publish an action. The agent borrow is
        // released before publishing so the cascade may re-enter.
        {
            let weak = Rc::downgrade(&agent);
            let bus_out = Rc::clone(bus);
            let key = config.observation_key.clone();
            bus.subscribe(&config.observation_topic, id, move |msg| {
                let Some(observation) = msg.get(&key) else {
                    warn!(topic = msg.topic(), key = key.as_str(), "observation key missing");
                    return Ok(());
                };
                let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
                let (action_topic, signal) = {
                    let mut agent = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
                    let dt = agent.dt;
                    let signal = agent.controller.compute_action(observation, dt);
                    (agent.config.action_topic.clone(), signal)
                };
                bus_out
                    .publish(&action_topic, payload(&[("control_signal", signal)]))
                    .map_err(HandlerError::Fatal)?;
                Ok(())
            });
        }

        if let Some(command_topic) = &config.command_topic {
            let weak = Rc::downgrade(&agent);
            bus.subscribe(command_topic, id, move |msg| {
                let Some(setpoint) = msg.get("new_setpoint") else {
                    return Ok(());
                };
                let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
                let mut agent = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
                debug!(id = agent.id.as_str(), setpoint, "setpoint command received");
                agent.controller.set_setpoint(setpoint);
                Ok(())
            });
        }

        if let Some(feedback_topic) = &config.feedback_topic {
            let weak = Rc::downgrade(&agent);
            bus.subscribe(feedback_topic, id, move |msg| {
                let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
                let mut agent = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
                agent.latest_feedback = msg.fields().clone();
                Ok(())
            });
        }

        info!(
            id,
            observation_topic = config.observation_topic.as_str(),
            action_topic = config.action_topic.as_str(),
            "local control agent created"
        );
        agent
    }

    /// Current controller setpoint (inspection)
    pub fn setpoint(&self) -> f64 {
        self.controller.setpoint()
    }

    /// Most recent feedback message, empty until one arrives
    pub fn latest_feedback(&self) -> &FieldMap {
        &self.latest_feedback
    }
}

impl Agent for LocalControlAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        // Event-driven: everything happens in the bus handlers.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{PidController, PidParameters};
    use std::cell::Cell;

    fn pid(setpoint: f64) -> Box<dyn Controller> {
        Box::new(
            PidController::new(PidParameters {
                kp: 1.0,
                ki: 0.0,
                kd: 0.0,
                setpoint,
                min_output: -10.0,
                max_output: 10.0,
            })
            .unwrap(),
        )
    }

    fn config() -> LocalControlConfig {
        LocalControlConfig {
            observation_topic: "state/res/1".to_string(),
            observation_key: "water_level".to_string(),
            action_topic: "action/gate/1".to_string(),
            command_topic: Some("command/gate/1".to_string()),
            feedback_topic: None,
        }
    }

    #[test]
    fn test_observation_triggers_action_in_same_cascade() {
        let bus = MessageBus::new();
        let _agent = LocalControlAgent::spawn("lca_1", pid(10.0), &bus, config(), 1.0);

        let seen = Rc::new(Cell::new(f64::NAN));
        let sink = Rc::clone(&seen);
        bus.subscribe("action/gate/1", "probe", move |msg| {
            sink.set(msg.get("control_signal").unwrap());
            Ok(())
        });

        bus.publish("state/res/1", payload(&[("water_level", 7.0)]))
            .unwrap();
        // error = 10 - 7 = 3, Kp = 1
        assert_eq!(seen.get(), 3.0);
    }

    #[test]
    fn test_missing_observation_key_is_skipped() {
        let bus = MessageBus::new();
        let _agent = LocalControlAgent::spawn("lca_1", pid(10.0), &bus, config(), 1.0);
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        bus.subscribe("action/gate/1", "probe", move |_| {
            c.set(c.get() + 1);
            Ok(())
        });
        bus.publish("state/res/1", payload(&[("volume", 100.0)]))
            .unwrap();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_command_updates_setpoint() {
        let bus = MessageBus::new();
        let agent = LocalControlAgent::spawn("lca_1", pid(10.0), &bus, config(), 1.0);
        bus.publish("command/gate/1", payload(&[("new_setpoint", 4.0)]))
            .unwrap();
        assert_eq!(agent.borrow().setpoint(), 4.0);
    }

    #[test]
    fn test_feedback_recorded() {
        let bus = MessageBus::new();
        let mut cfg = config();
        cfg.feedback_topic = Some("state/gate/1".to_string());
        let agent = LocalControlAgent::spawn("lca_1", pid(10.0), &bus, cfg, 1.0);
        bus.publish("state/gate/1", payload(&[("opening", 0.4)]))
            .unwrap();
        assert_eq!(agent.borrow().latest_feedback().get("opening"), Some(&0.4));
    }
}
