use nalgebra::DVector;
use num_complex::Complex64;
use serde::Serialize;

use crate::basic::mismatch::compute_power;
use crate::basic::options::QControl;
use crate::basic::pf::IslandModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QLimit {
    Lower,
    Upper,
}

/// A PV bus turned into a PQ bus because its regulating units ran out of
/// reactive power.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QLimitSwitch {
    /// Bus index in the island model.
    pub bus: usize,
    pub limit: QLimit,
    /// Reactive output the units would have needed (MVAr).
    pub q_required: f64,
    /// Reactive output fixed from now on (MVAr).
    pub q_fixed: f64,
}

/// Checks the reactive output of the PV buses against their limits and
/// switches the violating ones to PQ, with the generation fixed at the
/// violated limit.
///
/// [`QControl::Direct`] switches every violation at once,
/// [`QControl::Iterative`] only the largest one. Buses are never switched
/// back from PQ to PV. Returns the switches made, empty when the voltages
/// respect all limits.
pub fn enforce_q_limits(model: &mut IslandModel, v: &DVector<Complex64>, mode: QControl) -> Vec<QLimitSwitch> {
    if mode == QControl::None || model.pv.is_empty() {
        return Vec::new();
    }
    let sbase = model.circuit.sbase;
    let scalc = compute_power(&model.admittance.ybus, v);
    let vm = v.map(|c| c.norm());
    let sspec = model.injections.sbus(&vm);

    let mut violations: Vec<(f64, QLimitSwitch)> = model
        .pv
        .iter()
        .filter_map(|&bus| {
            // units' share of the bus injection
            let q_gen = scalc[bus].im - sspec[bus].im;
            let (q_min, q_max) = (model.injections.q_min[bus], model.injections.q_max[bus]);
            let (limit, bound) = if q_gen > q_max {
                (QLimit::Upper, q_max)
            } else if q_gen < q_min {
                (QLimit::Lower, q_min)
            } else {
                return None;
            };
            let switch = QLimitSwitch {
                bus,
                limit,
                q_required: q_gen * sbase,
                q_fixed: bound * sbase,
            };
            Some(((q_gen - bound).abs(), switch))
        })
        .collect();

    if mode == QControl::Iterative {
        violations.sort_by(|a, b| b.0.total_cmp(&a.0));
        violations.truncate(1);
    }

    violations
        .into_iter()
        .map(|(_, switch)| {
            let q_rest = model.injections.s0[switch.bus].im;
            model.switch_to_pq(switch.bus, q_rest + switch.q_fixed / sbase);
            log::warn!(
                "bus {} switched from PV to PQ: Q = {:.3} MVAr beyond its {:?} limit {:.3} MVAr",
                switch.bus,
                switch.q_required,
                switch.limit,
                switch.q_fixed
            );
            switch
        })
        .collect()
}
