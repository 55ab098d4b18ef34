//! Disturbance injection scenario
//!
//! A reservoir held at its setpoint by a PID control agent receives a
//! rainfall burst over ticks [300, 500). The volume must rise during the
//! active window, the controller must counteract, and the level must
//! return toward the baseline after the burst ends.

use std::cell::RefCell;
use std::rc::Rc;

use water_simulator_core_rs::agents::{DigitalTwinAgent, LocalControlAgent, LocalControlConfig,
    RainfallAgent};
use water_simulator_core_rs::agents::disturbance::RainfallConfig;
use water_simulator_core_rs::control::{PidController, PidParameters};
use water_simulator_core_rs::models::{
    Gate, GateParameters, Reservoir, ReservoirParameters, State, TopicBinding,
};
use water_simulator_core_rs::{MessageBus, RunMode, SimClock, SimulationHarness};

#[test]
fn test_rainfall_burst_is_absorbed_by_pid_control() {
    let bus = MessageBus::new();
    let mut h = SimulationHarness::new(SimClock::new(1.0, 800).unwrap(), Rc::clone(&bus));

    // Reservoir at its setpoint, subscribed to the rainfall topic
    let initial = State::from([("water_level".to_string(), 12.0)]);
    let res = Rc::new(RefCell::new(
        Reservoir::new(
            "res_1",
            &initial,
            ReservoirParameters {
                surface_area: Some(5000.0),
                ..Default::default()
            },
        )
        .unwrap(),
    ));
    Reservoir::connect_bus(
        &res,
        &bus,
        &[TopicBinding {
            topic: "disturbance/rainfall/res_1".to_string(),
            key: "inflow_rate".to_string(),
        }],
        &[],
    );
    h.add_component(res).unwrap();

    let gate_initial = State::from([("opening".to_string(), 0.0)]);
    let gate = Rc::new(RefCell::new(
        Gate::new(
            "gate_1",
            &gate_initial,
            GateParameters {
                discharge_coefficient: 0.6,
                width: 10.0,
                max_opening: 1.0,
                max_rate_of_change: 0.1,
            },
        )
        .unwrap(),
    ));
    Gate::connect_bus(&gate, &bus, "action/gate/1");
    h.add_component(gate).unwrap();
    h.add_connection("res_1", "gate_1").unwrap();

    // Perception and control agents
    let twin = DigitalTwinAgent::new(
        "twin_1",
        h.component("res_1").unwrap().clone(),
        Rc::clone(&bus),
        "state/reservoir/res_1",
        None,
    )
    .unwrap();
    h.add_agent(Rc::new(RefCell::new(twin)));

    let controller = Box::new(
        PidController::new(PidParameters {
            kp: -2.0,
            ki: 0.0,
            kd: 0.0,
            setpoint: 12.0,
            min_output: 0.0,
            max_output: 1.0,
        })
        .unwrap(),
    );
    let lca = LocalControlAgent::spawn(
        "lca_1",
        controller,
        &bus,
        LocalControlConfig {
            observation_topic: "state/reservoir/res_1".to_string(),
            observation_key: "water_level".to_string(),
            action_topic: "action/gate/1".to_string(),
            command_topic: None,
            feedback_topic: None,
        },
        1.0,
    );
    h.add_agent(lca);

    // Rainfall burst over ticks [300, 500)
    let rain = RainfallAgent::new(
        "rain_1",
        Rc::clone(&bus),
        RainfallConfig {
            topic: "disturbance/rainfall/res_1".to_string(),
            start_time: 300.0,
            duration: 200.0,
            inflow_rate: 150.0,
        },
    );
    h.add_agent(Rc::new(RefCell::new(rain)));

    h.build().unwrap();
    h.run(RunMode::MultiAgent).unwrap();

    let snaps = h.history().snapshots();
    assert_eq!(snaps.len(), 800);

    let level = |t: usize| snaps[t].states["res_1"]["water_level"];
    let volume = |t: usize| snaps[t].states["res_1"]["volume"];

    // Before the burst: resting at the setpoint
    assert!((level(299) - 12.0).abs() < 1e-6);

    // During the burst: volume rises and the gate is compensating
    assert!(volume(499) > volume(299));
    assert!(level(499) > 12.2);
    assert!(snaps[499].states["gate_1"]["opening"] > 0.5);

    // Inflow is visible on the reservoir during the active window only
    assert!((snaps[400].states["res_1"]["inflow"] - 150.0).abs() < 1e-9);
    assert!((snaps[600].states["res_1"]["inflow"]).abs() < 1e-9);

    // After the burst: the controller brings the level back down
    assert!(level(799) < level(499));
    assert!((level(799) - 12.0).abs() < 0.2);

    for snap in snaps {
        assert!(snap.states["res_1"]["volume"] >= 0.0);
    }
}
