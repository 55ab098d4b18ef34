//! Central dispatcher
//!
//! The top of the control hierarchy. It watches key state topics, runs a
//! threshold rule table each tick, and publishes setpoint commands that
//! local control agents pick up on their command topics. Strategy beyond
//! the rule table (MPC, scheduling) plugs in by replacing this agent, not
//! by widening it.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::agents::Agent;
use crate::bus::{payload, FieldMap, HandlerError, MessageBus};
use crate::core::error::SimulationError;

/// One state topic the dispatcher follows
#[derive(Debug, Clone, Deserialize)]
pub struct StateSubscription {
    /// Name the rule table refers to
    pub name: String,
    pub topic: String,
}

fn default_command_key() -> String {
    "new_setpoint".to_string()
}

/// One threshold rule: `observed_key` of state `observed` against
/// `threshold` selects which setpoint is commanded
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRule {
    /// `name` of a state subscription
    pub observed: String,
    /// Key inside the observed state message, e.g. `water_level`
    pub observed_key: String,
    pub threshold: f64,
    /// Commanded when the observation exceeds the threshold
    pub above_setpoint: f64,
    /// Commanded otherwise
    pub below_setpoint: f64,
    pub command_topic: String,
    #[serde(default = "default_command_key")]
    pub command_key: String,
}

/// Rule-driven supervisory agent
pub struct CentralDispatcher {
    id: String,
    bus: Rc<MessageBus>,
    rules: Vec<DispatchRule>,
    /// Latest full message per subscription name
    latest: std::collections::BTreeMap<String, FieldMap>,
}

impl CentralDispatcher {
    /// Create the dispatcher and register its state subscriptions
    pub fn spawn(
        id: &str,
        bus: &Rc<MessageBus>,
        subscriptions: &[StateSubscription],
        rules: Vec<DispatchRule>,
    ) -> Rc<RefCell<Self>> {
        let dispatcher = Rc::new(RefCell::new(Self {
            id: id.to_string(),
            bus: Rc::clone(bus),
            rules,
            latest: Default::default(),
        }));

        for sub in subscriptions {
            let weak = Rc::downgrade(&dispatcher);
            let name = sub.name.clone();
            bus.subscribe(&sub.topic, id, move |msg| {
                let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
                let mut dispatcher =
                    this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
                dispatcher.latest.insert(name.clone(), msg.fields().clone());
                Ok(())
            });
        }

        info!(id, rules = dispatcher.borrow().rules.len(), "central dispatcher created");
        dispatcher
    }
}

impl Agent for CentralDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        // Evaluate every rule against the latest state; rules whose state
        // has not arrived yet are skipped until it does.
        let mut commands = Vec::new();
        for rule in &self.rules {
            let Some(state) = self.latest.get(&rule.observed) else {
                continue;
            };
            let Some(value) = state.get(&rule.observed_key).copied() else {
                continue;
            };
            let setpoint = if value > rule.threshold {
                rule.above_setpoint
            } else {
                rule.below_setpoint
            };
            debug!(
                id = self.id.as_str(),
                observed = rule.observed.as_str(),
                value,
                setpoint,
                "dispatch rule evaluated"
            );
            commands.push((
                rule.command_topic.clone(),
                rule.command_key.clone(),
                setpoint,
            ));
        }
        for (topic, key, setpoint) in commands {
            self.bus.publish(&topic, payload(&[(key.as_str(), setpoint)]))?;
        }
        Ok(())
    }
}
