use nalgebra::DVector;
use num_complex::Complex64;
use serde::Serialize;

use crate::basic::error::Result;
use crate::basic::options::TapControl;
use crate::basic::pf::IslandModel;

/// A tap changer that moved during the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TapChange {
    /// Branch index in the island model.
    pub branch: usize,
    pub from: f64,
    pub to: f64,
    pub position: i32,
}

/// Position of a module on a changer with the given step.
pub fn tap_position(module: f64, step: f64) -> i32 {
    ((module - 1.0) / step).round() as i32
}

/// Nearest admissible module: `1 + pos·step` with the position clamped.
pub fn discretize(module: f64, step: f64, pos_min: i32, pos_max: i32) -> (f64, i32) {
    let pos = tap_position(module, step).clamp(pos_min, pos_max.max(pos_min));
    (1.0 + pos as f64 * step, pos)
}

/// Moves the regulating tap changers towards `m·|V_ctrl|/v_control`.
///
/// With [`TapControl::Direct`] each changer jumps to the discretised target,
/// with [`TapControl::Iterative`] it moves one step towards it. The island
/// admittances are rebuilt when anything moved.
pub fn adjust_taps(model: &mut IslandModel, v: &DVector<Complex64>, mode: TapControl) -> Result<Vec<TapChange>> {
    if mode == TapControl::None {
        return Ok(Vec::new());
    }
    let br = &mut model.circuit.branch;
    let mut changes = Vec::new();
    for k in 0..br.tap_control.len() {
        if !br.tap_control[k] || !model.conn.in_calculation[k] || !(br.tap_step[k] > 0.0) {
            continue;
        }
        let (m, step) = (br.tap_module[k], br.tap_step[k]);
        let target = m * v[br.tap_bus[k]].norm() / br.v_control[k];
        let (mut module, mut position) = discretize(target, step, br.tap_pos_min[k], br.tap_pos_max[k]);
        if mode == TapControl::Iterative {
            let current = tap_position(m, step);
            position = current + (position - current).signum();
            module = 1.0 + position as f64 * step;
        }
        if (module - m).abs() > 1e-12 {
            log::info!("tap of branch {k}: module {m:.4} -> {module:.4} (position {position})");
            br.tap_module[k] = module;
            changes.push(TapChange {
                branch: k,
                from: m,
                to: module,
                position,
            });
        }
    }
    if !changes.is_empty() {
        model.rebuild_admittance()?;
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus, Load, NumericalCircuit};
    use crate::basic::newtonpf::newton_pf;
    use crate::basic::pf::SolverConfig;
    use crate::basic::solver::DefaultSolver;
    use approx::assert_relative_eq;

    #[test]
    fn test_discretize() {
        let (module, pos) = discretize(1.026, 0.01, -10, 10);
        assert_eq!(pos, 3);
        assert_relative_eq!(module, 1.03);
        assert_eq!(discretize(0.5, 0.01, -10, 10).1, -10);
        assert_relative_eq!(discretize(0.5, 0.01, -10, 10).0, 0.9);
        assert_eq!(discretize(1.2, 0.025, -8, 8).1, 8);
        assert_eq!(tap_position(0.975, 0.0125), -2);
    }

    fn regulated_feeder() -> IslandModel {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pq());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 1, 0.01, 0.05, 0.0));
        let k = c.add_branch(Branch::transformer(1, 2, 0.002, 0.08, 1.0, 0.0));
        c.branch.tap_control[k] = true;
        c.branch.tap_bus[k] = 2;
        c.branch.v_control[k] = 1.0;
        c.branch.tap_step[k] = 0.01;
        c.branch.tap_pos_min[k] = -10;
        c.branch.tap_pos_max[k] = 10;
        c.add_load(Load::constant_power(2, 50.0, 20.0));
        IslandModel::new(c).unwrap()
    }

    fn solve(model: &IslandModel) -> DVector<Complex64> {
        let v0 = model.flat_start();
        newton_pf(&model.input(&v0), &SolverConfig::default(), &mut DefaultSolver::default())
            .unwrap()
            .v
    }

    #[test]
    fn test_direct_tap_moves_to_target() {
        let mut model = regulated_feeder();
        let v = solve(&model);
        assert!(v[2].norm() < 0.99);
        let changes = adjust_taps(&mut model, &v, TapControl::Direct).unwrap();
        assert_eq!(changes.len(), 1);
        let change = changes[0];
        assert!(change.to < 1.0);
        assert_eq!(change.position, tap_position(v[2].norm(), 0.01));
        assert_relative_eq!(model.circuit.branch.tap_module[1], change.to);

        // a lower module on the sending side raises the regulated voltage
        let v_new = solve(&model);
        assert!(v_new[2].norm() > v[2].norm());
    }

    #[test]
    fn test_iterative_tap_moves_one_step() {
        let mut model = regulated_feeder();
        let v = solve(&model);
        let changes = adjust_taps(&mut model, &v, TapControl::Iterative).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].position, -1);
        assert_relative_eq!(changes[0].to, 0.99);
        assert!(adjust_taps(&mut model, &v, TapControl::None).unwrap().is_empty());
    }
}
