//! Small reference networks shared by the tests, the demo and downstream
//! users. All values are on a 100 MVA base.

use crate::basic::circuit::{Branch, Bus, Generator, Load, NumericalCircuit};

/// [`three_bus`] in its JSON form.
pub const THREE_BUS_JSON: &str = r#"{
    "sbase": 100.0,
    "bus": {
        "bus_type": ["slack", "pq", "pq"],
        "active": [true, true, true],
        "vnom_kv": [1.0, 1.0, 1.0],
        "vmin": [0.9, 0.9, 0.9],
        "vmax": [1.1, 1.1, 1.1],
        "v_set": [1.0, 1.0, 1.0],
        "va_set": [0.0, 0.0, 0.0],
        "p_set": [0.0, 0.0, 0.0],
        "q_set": [0.0, 0.0, 0.0],
        "y_shunt": [[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]]
    },
    "branch": {
        "f": [0, 0],
        "t": [1, 2],
        "r": [0.01, 0.02],
        "x": [0.03, 0.05],
        "g": [0.0, 0.0],
        "b": [0.0, 0.0],
        "tap_module": [1.0, 1.0],
        "tap_angle": [0.0, 0.0],
        "vtap_f": [1.0, 1.0],
        "vtap_t": [1.0, 1.0],
        "rate": [0.0, 0.0],
        "active": [true, true],
        "reducible": [false, false],
        "tap_control": [false, false],
        "tap_bus": [0, 0],
        "v_control": [1.0, 1.0],
        "tap_step": [0.0, 0.0],
        "tap_pos_min": [0, 0],
        "tap_pos_max": [0, 0]
    },
    "load": {
        "bus": [1],
        "active": [true],
        "s": [[50.0, 28.6]],
        "i": [[0.0, 0.0]],
        "y": [[0.0, 0.0]]
    }
}"#;

/// Parses a circuit from JSON, e.g. [`THREE_BUS_JSON`].
pub fn from_json(json: &str) -> serde_json::Result<NumericalCircuit> {
    serde_json::from_str(json)
}

/// Slack bus 0 feeding bus 1 (`R = 0.01, X = 0.03`) with a `0.5 + j0.286`
/// p.u. load and bus 2 (`R = 0.02, X = 0.05`) without load.
pub fn three_bus() -> NumericalCircuit {
    let mut c = NumericalCircuit::new(100.0);
    c.add_bus(Bus::slack());
    c.add_bus(Bus::pq());
    c.add_bus(Bus::pq());
    c.add_branch(Branch::line(0, 1, 0.01, 0.03, 0.0));
    c.add_branch(Branch::line(0, 2, 0.02, 0.05, 0.0));
    c.add_load(Load::constant_power(1, 50.0, 28.6));
    c
}

/// Slack bus 0 joined to bus 1 by a closed switch and to bus 2 by a line
/// carrying a load.
pub fn star() -> NumericalCircuit {
    let mut c = NumericalCircuit::new(100.0);
    c.add_bus(Bus::slack());
    c.add_bus(Bus::pq());
    c.add_bus(Bus::pq());
    c.add_branch(Branch::switch(0, 1));
    c.add_branch(Branch::line(0, 2, 0.01, 0.05, 0.0));
    c.add_load(Load::constant_power(2, 20.0, 5.0));
    c
}

/// [`three_bus`] plus a loaded bus 3 without any connection.
pub fn with_isolated_bus() -> NumericalCircuit {
    let mut c = three_bus();
    let lone = c.add_bus(Bus::pq());
    c.add_load(Load::constant_power(lone, 5.0, 1.0));
    c
}

/// Stagg and El-Abiad's five bus network: slack at 1.06 p.u., one
/// generator bus regulating 1.045 p.u. and four loads, `X/R = 3`
/// throughout. The regulating generator is `generator[0]`.
pub fn five_bus() -> NumericalCircuit {
    let mut c = NumericalCircuit::new(100.0);
    c.add_bus(Bus {
        v_set: 1.06,
        ..Bus::slack()
    });
    c.add_bus(Bus::pv());
    for _ in 0..3 {
        c.add_bus(Bus::pq());
    }
    for (f, t, r, x, b) in [
        (0, 1, 0.02, 0.06, 0.06),
        (0, 2, 0.08, 0.24, 0.05),
        (1, 2, 0.06, 0.18, 0.04),
        (1, 3, 0.06, 0.18, 0.04),
        (1, 4, 0.04, 0.12, 0.03),
        (2, 3, 0.01, 0.03, 0.02),
        (3, 4, 0.08, 0.24, 0.05),
    ] {
        c.add_branch(Branch::line(f, t, r, x, b).with_rate(100.0));
    }
    c.add_generator(Generator::new(1, 40.0, 1.045).with_snom(100.0));
    for (bus, p, q) in [(1, 20.0, 10.0), (2, 45.0, 15.0), (3, 40.0, 5.0), (4, 60.0, 10.0)] {
        c.add_load(Load::constant_power(bus, p, q));
    }
    c
}

/// A PQ-only radial feeder: slack, then two loaded buses in a row.
/// `load[0]` sits at bus 1.
pub fn radial_pq() -> NumericalCircuit {
    let mut c = NumericalCircuit::new(100.0);
    c.add_bus(Bus::slack());
    c.add_bus(Bus::pq());
    c.add_bus(Bus::pq());
    c.add_branch(Branch::line(0, 1, 0.01, 0.05, 0.0));
    c.add_branch(Branch::line(1, 2, 0.015, 0.06, 0.0));
    c.add_load(Load::constant_power(1, 20.0, 10.0));
    c.add_load(Load::constant_power(2, 15.0, 5.0));
    c
}
