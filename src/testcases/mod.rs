//! Prebuilt small networks used by the test suite.

use std::sync::{Arc, RwLock};

use num_complex::Complex64;

use crate::components::capacitor::Capacitor;
use crate::components::inductor::Inductor;
use crate::components::node::SimNode;
use crate::components::resistor::Resistor;
use crate::components::sources::{CurrentSource, VoltageSource};
use crate::components::switch::Switch;
use crate::solver::scalar::MnaScalar;
use crate::system::SystemTopology;

/// Two resistors in series across a 1 V DC source. The mid node divides the
/// source voltage as `r_ground_side / (r_source_side + r_ground_side)`.
pub fn voltage_divider(
    r_source_side: f64,
    r_ground_side: f64,
) -> (SystemTopology<f64>, Arc<SimNode<f64>>) {
    let mut sys = SystemTopology::new("voltage_divider", 0.0);
    let arena = sys.arena().clone();
    let gnd = sys.ground();
    let n1 = sys.node("n1", Complex64::new(1.0, 0.0));
    let ratio = r_ground_side / (r_source_side + r_ground_side);
    let n2 = sys.node("n2", Complex64::new(ratio, 0.0));

    sys.add_component(VoltageSource::new(
        "vs",
        Arc::clone(&n1),
        Arc::clone(&gnd),
        1.0,
        0.0,
        &arena,
    ));
    sys.add_component(Resistor::new(
        "r_top",
        n1,
        Arc::clone(&n2),
        r_source_side,
        &arena,
    ));
    sys.add_component(Resistor::new("r_bottom", Arc::clone(&n2), gnd, r_ground_side, &arena));
    (sys, n2)
}

/// A 1 V DC source feeding a resistor in series with a switch to ground.
pub fn switched_network() -> (
    SystemTopology<f64>,
    Arc<RwLock<Switch<f64>>>,
    Arc<SimNode<f64>>,
) {
    let mut sys = SystemTopology::new("switched", 0.0);
    let arena = sys.arena().clone();
    let gnd = sys.ground();
    let n1 = sys.node("n1", Complex64::new(1.0, 0.0));
    let n2 = sys.node("n2", Complex64::new(1.0, 0.0));

    sys.add_component(VoltageSource::new(
        "vs",
        Arc::clone(&n1),
        Arc::clone(&gnd),
        1.0,
        0.0,
        &arena,
    ));
    sys.add_component(Resistor::new("r1", n1, Arc::clone(&n2), 1.0, &arena));
    let sw = sys.add_switch(Switch::new("sw", Arc::clone(&n2), gnd, 1e9, 1.0, &arena));
    (sys, sw, n2)
}

/// Series RLC driven by a unit source at 50 Hz; returns the capacitor node.
pub fn rlc_series<S: MnaScalar>() -> (SystemTopology<S>, Arc<SimNode<S>>) {
    let mut sys = SystemTopology::new("rlc_series", 50.0);
    let arena = sys.arena().clone();
    let gnd = sys.ground();
    let n1 = sys.node("n1", Complex64::new(0.0, 0.0));
    let n2 = sys.node("n2", Complex64::new(0.0, 0.0));
    let n3 = sys.node("n3", Complex64::new(0.0, 0.0));

    sys.add_component(VoltageSource::new(
        "vs",
        Arc::clone(&n1),
        Arc::clone(&gnd),
        1.0,
        0.0,
        &arena,
    ));
    sys.add_component(Resistor::new("r", n1, Arc::clone(&n2), 20.0, &arena));
    sys.add_component(Inductor::new("l", n2, Arc::clone(&n3), 0.01, &arena));
    sys.add_component(Capacitor::new("c", Arc::clone(&n3), gnd, 1e-4, &arena));
    (sys, n3)
}

/// Parallel RL fed by a 1 A current source, registered harmonic-capable,
/// with the {50, 150, 250} Hz frequency set.
pub fn harmonic_rl() -> SystemTopology<Complex64> {
    let mut sys = SystemTopology::new("harmonic_rl", 50.0);
    sys.set_frequencies(vec![50.0, 150.0, 250.0]);
    let arena = sys.arena().clone();
    let gnd = sys.ground();
    let n1 = sys.node("n1", Complex64::new(0.0, 0.0));

    sys.add_harmonic_component(CurrentSource::new(
        "is",
        Arc::clone(&n1),
        Arc::clone(&gnd),
        1.0,
        0.0,
        &arena,
    ));
    sys.add_harmonic_component(Resistor::new("r", Arc::clone(&n1), Arc::clone(&gnd), 10.0, &arena));
    sys.add_harmonic_component(Inductor::new("l", n1, gnd, 0.01, &arena));
    sys
}
