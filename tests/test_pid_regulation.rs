//! PID regulation scenarios (orchestrated mode)
//!
//! A single reservoir/gate loop with the literal large-reservoir inputs,
//! a fast-draining variant that settles onto its setpoint within the run,
//! and a two-controller cascade (reservoir -> gate -> canal -> gate) with
//! independently converging loops.

use std::cell::RefCell;
use std::rc::Rc;

use water_simulator_core_rs::control::{PidController, PidParameters};
use water_simulator_core_rs::models::{
    CanalModelType, CanalParameters, Gate, GateParameters, Reservoir, ReservoirParameters, State,
    UnifiedCanal,
};
use water_simulator_core_rs::{
    ControllerBinding, MessageBus, RunMode, SimClock, SimulationHarness,
};

fn reservoir(id: &str, area: f64, level: f64) -> Rc<RefCell<Reservoir>> {
    let initial = State::from([("water_level".to_string(), level)]);
    Rc::new(RefCell::new(
        Reservoir::new(
            id,
            &initial,
            ReservoirParameters {
                surface_area: Some(area),
                ..Default::default()
            },
        )
        .unwrap(),
    ))
}

fn gate(id: &str, width: f64, opening: f64, max_roc: f64) -> Rc<RefCell<Gate>> {
    let initial = State::from([("opening".to_string(), opening)]);
    Rc::new(RefCell::new(
        Gate::new(
            id,
            &initial,
            GateParameters {
                discharge_coefficient: 0.6,
                width,
                max_opening: 1.0,
                max_rate_of_change: max_roc,
            },
        )
        .unwrap(),
    ))
}

fn pid(kp: f64, ki: f64, kd: f64, setpoint: f64) -> Box<PidController> {
    Box::new(
        PidController::new(PidParameters {
            kp,
            ki,
            kd,
            setpoint,
            min_output: 0.0,
            max_output: 1.0,
        })
        .unwrap(),
    )
}

/// Scenario A literal inputs: a 1.5 km^2 reservoir drains far too slowly
/// to reach the setpoint in 300 ticks, but the qualitative contract holds:
/// the control action saturates immediately, the opening ramps at the rate
/// limit to fully open, and the level falls monotonically toward the
/// setpoint while mass stays balanced.
#[test]
fn test_single_reservoir_gate_pid_drawdown() {
    let mut h = SimulationHarness::new(SimClock::new(1.0, 300).unwrap(), MessageBus::new());
    h.add_component(reservoir("reservoir_1", 1.5e6, 14.0)).unwrap();
    h.add_component(gate("gate_1", 10.0, 0.5, 0.1)).unwrap();
    h.add_connection("reservoir_1", "gate_1").unwrap();
    h.add_controller(ControllerBinding {
        controller: pid(-0.5, -0.01, -0.1, 12.0),
        controlled_id: "gate_1".to_string(),
        observed_id: "reservoir_1".to_string(),
        observation_key: "water_level".to_string(),
    });
    h.build().unwrap();
    h.run(RunMode::Orchestrated).unwrap();

    let snaps = h.history().snapshots();
    assert_eq!(snaps.len(), 300);

    // The saturated control action drives the opening up at exactly the
    // rate limit: 0.5 -> 1.0 within the first five ticks, then holds.
    assert!((snaps[0].states["gate_1"]["opening"] - 0.6).abs() < 1e-9);
    assert!((snaps[4].states["gate_1"]["opening"] - 1.0).abs() < 1e-9);
    assert!((snaps[299].states["gate_1"]["opening"] - 1.0).abs() < 1e-9);

    // Monotone drawdown toward the setpoint
    let mut prev = f64::INFINITY;
    for snap in snaps {
        let level = snap.states["reservoir_1"]["water_level"];
        assert!(level <= prev + 1e-12);
        assert!(level >= 12.0);
        prev = level;
    }
    assert!(snaps[299].states["reservoir_1"]["water_level"] < 14.0);

    // Mass balance: sum(inflow - outflow) * dt accounts for every lost m^3
    let initial_volume = 14.0 * 1.5e6;
    let final_volume = snaps[299].states["reservoir_1"]["volume"];
    let net_flow: f64 = snaps
        .iter()
        .map(|s| s.states["reservoir_1"]["inflow"] - s.states["reservoir_1"]["outflow"])
        .sum();
    assert!((initial_volume + net_flow - final_volume).abs() < 1e-6 * initial_volume);
}

/// A tank small enough to settle: the level must land within 0.5 of the
/// setpoint by the end of the run and stay non-negative throughout.
#[test]
fn test_pid_converges_on_fast_tank() {
    let mut h = SimulationHarness::new(SimClock::new(1.0, 300).unwrap(), MessageBus::new());
    h.add_component(reservoir("tank", 5000.0, 14.0)).unwrap();
    h.add_component(gate("outlet", 10.0, 0.0, 0.1)).unwrap();
    h.add_connection("tank", "outlet").unwrap();
    h.add_controller(ControllerBinding {
        controller: pid(-2.0, 0.0, 0.0, 12.0),
        controlled_id: "outlet".to_string(),
        observed_id: "tank".to_string(),
        observation_key: "water_level".to_string(),
    });
    h.build().unwrap();
    h.run(RunMode::Orchestrated).unwrap();

    let final_level = h.history().last().unwrap().states["tank"]["water_level"];
    assert!(
        (final_level - 12.0).abs() < 0.5,
        "final level {} not near setpoint",
        final_level
    );
    for snap in h.history().snapshots() {
        assert!(snap.states["tank"]["volume"] >= 0.0);
    }
}

/// Scenario B: two independent PID loops. The upstream loop holds the
/// reservoir at its level setpoint through gate_1; the downstream loop
/// holds the canal reach at its volume setpoint through gate_2.
#[test]
fn test_two_independent_controllers_converge() {
    let mut h = SimulationHarness::new(SimClock::new(1.0, 300).unwrap(), MessageBus::new());
    h.add_component(reservoir("res_1", 5000.0, 14.0)).unwrap();
    h.add_component(gate("gate_1", 10.0, 0.0, 0.1)).unwrap();
    let canal = UnifiedCanal::new(
        "canal_1",
        &State::from([("water_level".to_string(), 1.0)]),
        CanalParameters {
            model_type: CanalModelType::Integral,
            surface_area: Some(2000.0),
            outlet_coefficient: Some(0.0),
            ..Default::default()
        },
    )
    .unwrap();
    h.add_component(Rc::new(RefCell::new(canal))).unwrap();
    // Wider second gate so it can match the upstream feed without
    // saturating
    let initial = State::from([("opening".to_string(), 0.0)]);
    h.add_component(Rc::new(RefCell::new(
        Gate::new(
            "gate_2",
            &initial,
            GateParameters {
                discharge_coefficient: 0.8,
                width: 20.0,
                max_opening: 1.0,
                max_rate_of_change: 0.1,
            },
        )
        .unwrap(),
    )))
    .unwrap();

    h.add_connection("res_1", "gate_1").unwrap();
    h.add_connection("gate_1", "canal_1").unwrap();
    h.add_connection("canal_1", "gate_2").unwrap();

    h.add_controller(ControllerBinding {
        controller: pid(-2.0, 0.0, 0.0, 12.0),
        controlled_id: "gate_1".to_string(),
        observed_id: "res_1".to_string(),
        observation_key: "water_level".to_string(),
    });
    h.add_controller(ControllerBinding {
        controller: pid(-0.001, 0.0, 0.0, 4000.0),
        controlled_id: "gate_2".to_string(),
        observed_id: "canal_1".to_string(),
        observation_key: "volume".to_string(),
    });
    h.build().unwrap();
    h.run(RunMode::Orchestrated).unwrap();

    let last = h.history().last().unwrap();
    let res_level = last.states["res_1"]["water_level"];
    let canal_volume = last.states["canal_1"]["volume"];
    assert!(
        (res_level - 12.0).abs() < 0.5,
        "reservoir level {} not near setpoint",
        res_level
    );
    assert!(
        (canal_volume - 4000.0).abs() < 0.05 * 4000.0,
        "canal volume {} not within 5% of setpoint",
        canal_volume
    );
}
