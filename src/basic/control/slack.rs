use nalgebra::DVector;
use num_complex::Complex64;
use serde::Serialize;

use crate::basic::mismatch::compute_power;
use crate::basic::pf::IslandModel;

/// How the active power picked up by the slack was shared out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlackDistribution {
    /// Slack injection beyond its schedule (MW).
    pub p_slack: f64,
    /// `(bus, ΔP in MW)` per bus with installed generation.
    pub shares: Vec<(usize, f64)>,
}

/// Spreads the slack's unscheduled active power over the buses with
/// installed generation, proportionally to their nominal power, by adding
/// `ΔP_i = P_slack·snom_i/Σsnom` to the specified injections.
///
/// Returns `None` when the island has no installed power to share with.
pub fn distribute_slack(model: &mut IslandModel, v: &DVector<Complex64>) -> Option<SlackDistribution> {
    let scalc = compute_power(&model.admittance.ybus, v);
    let vm = v.map(|c| c.norm());
    let sspec = model.injections.sbus(&vm);
    let p_slack: f64 = model.slack.iter().map(|&b| scalc[b].re - sspec[b].re).sum();

    let active = &model.circuit.bus.active;
    let installed = &model.injections.installed_power;
    let total: f64 = (0..installed.len()).filter(|&b| active[b]).map(|b| installed[b]).sum();
    if !(total > 0.0) {
        log::warn!("distributed slack requested but the island has no installed generation");
        return None;
    }

    let sbase = model.circuit.sbase;
    let shares: Vec<(usize, f64)> = (0..installed.len())
        .filter(|&b| active[b] && installed[b] > 0.0)
        .map(|b| {
            let dp = p_slack * installed[b] / total;
            model.injections.s0[b].re += dp;
            (b, dp * sbase)
        })
        .collect();
    log::info!(
        "distributed {:.3} MW of slack power over {} buses",
        p_slack * sbase,
        shares.len()
    );
    Some(SlackDistribution {
        p_slack: p_slack * sbase,
        shares,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus, Generator, Load, NumericalCircuit};
    use crate::basic::newtonpf::newton_pf;
    use crate::basic::pf::SolverConfig;
    use crate::basic::solver::DefaultSolver;
    use approx::assert_relative_eq;

    fn solve(model: &IslandModel) -> DVector<Complex64> {
        let v0 = model.flat_start();
        newton_pf(&model.input(&v0), &SolverConfig::default(), &mut DefaultSolver::default())
            .unwrap()
            .v
    }

    #[test]
    fn test_slack_shared_by_snom() {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pv());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 2, 0.01, 0.1, 0.0));
        c.add_branch(Branch::line(1, 2, 0.01, 0.1, 0.0));
        c.add_generator(Generator::new(0, 0.0, 1.0).with_snom(100.0));
        c.add_generator(Generator::new(1, 0.0, 1.0).with_snom(300.0));
        c.add_load(Load::constant_power(2, 80.0, 0.0));
        let mut model = IslandModel::new(c).unwrap();

        let v = solve(&model);
        let dist = distribute_slack(&mut model, &v).unwrap();
        assert!(dist.p_slack > 80.0);
        assert_eq!(dist.shares.len(), 2);
        assert_relative_eq!(dist.shares[1].1, 0.75 * dist.p_slack, epsilon = 1e-9);
        assert_relative_eq!(model.injections.s0[1].re, 0.0075 * dist.p_slack, epsilon = 1e-9);

        // after the re-solve the PV unit carries three quarters of the load
        let v = solve(&model);
        let p1 = compute_power(&model.admittance.ybus, &v)[1].re * 100.0;
        assert!(p1 > 55.0 && p1 < 65.0);
    }

    #[test]
    fn test_no_installed_power() {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 1, 0.01, 0.1, 0.0));
        c.add_load(Load::constant_power(1, 10.0, 0.0));
        let mut model = IslandModel::new(c).unwrap();
        let v = solve(&model);
        assert!(distribute_slack(&mut model, &v).is_none());
    }
}
