use std::time::Instant;

use nalgebra::DVector;
use num_complex::Complex64;

use super::error::{PowerFlowError, Result};
use super::newtonpf::polar;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;
use super::sparse::slice::select;
use super::system::{DecoupledScheme, fast_decoupled_matrices};

/// `(Scalc − Sbus)/|V|`
fn scaled_mismatch(input: &SolverInput, v: &DVector<Complex64>) -> DVector<Complex64> {
    let vm = v.map(|c| c.norm());
    let mis = super::mismatch::compute_power(input.ybus, v) - input.sbus(&vm);
    mis.zip_map(&vm, |s, m| if m > 0.0 { s / m } else { s })
}

/// Fast-decoupled power flow (Stott and Alsac), XB or BX scheme.
///
/// `B'[pvpq, pvpq]` and `B''[pq, pq]` are factorized once; every iteration
/// runs an angle half-step followed by a magnitude half-step, checking the
/// power mismatch after each half.
pub fn fast_decoupled_pf<S: Solve + Default>(
    input: &SolverInput,
    config: &SolverConfig,
    scheme: DecoupledScheme,
) -> Result<SolverOutput> {
    let start = Instant::now();
    let pvpq = input.pvpq();
    let pq = input.pq;

    let (bp, bpp) = fast_decoupled_matrices(input.circuit, input.conn, input.y0, scheme)?;
    let mut p_solver = S::default();
    let mut q_solver = S::default();
    p_solver
        .factorize(&select(&bp, &pvpq, &pvpq))
        .map_err(|_| PowerFlowError::SingularJacobian { iteration: 0 })?;
    q_solver
        .factorize(&select(&bpp, pq, pq))
        .map_err(|_| PowerFlowError::SingularJacobian { iteration: 0 })?;

    let mut v = input.v0.clone();
    let mut vm = v.map(|c| c.norm());
    let mut va = v.map(|c| c.arg());
    let mut error = input.mismatch(&v, &pvpq).error;
    let mut iterations = 0;

    while error > config.tolerance && iterations < config.max_iter && !pvpq.is_empty() {
        if config.is_cancelled() {
            return Ok(SolverOutput::new(v, error, config.tolerance, iterations)
                .cancelled()
                .with_elapsed(start.elapsed()));
        }
        iterations += 1;

        // P half-step
        let mis = scaled_mismatch(input, &v);
        let mut dva: Vec<f64> = pvpq.iter().map(|&b| mis[b].re).collect();
        p_solver.solve_factored(&mut dva)?;
        pvpq.iter().zip(&dva).for_each(|(&b, d)| va[b] -= d);
        v = polar(&vm, &va);
        error = input.mismatch(&v, &pvpq).error;
        if error <= config.tolerance || pq.is_empty() {
            log::debug!("FD iteration {iterations} (P): error {error:.3e}");
            continue;
        }

        // Q half-step
        let mis = scaled_mismatch(input, &v);
        let mut dvm: Vec<f64> = pq.iter().map(|&b| mis[b].im).collect();
        q_solver.solve_factored(&mut dvm)?;
        pq.iter().zip(&dvm).for_each(|(&b, d)| vm[b] -= d);
        v = polar(&vm, &va);
        error = input.mismatch(&v, &pvpq).error;
        log::debug!("FD iteration {iterations}: error {error:.3e}");
    }

    let out = SolverOutput::new(v, error, config.tolerance, iterations).with_elapsed(start.elapsed());
    if !out.converged && config.is_cancelled() {
        return Ok(out.cancelled());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::newtonpf::newton_pf;
    use crate::basic::pf::IslandModel;
    use crate::basic::solver::DefaultSolver;
    use crate::testcases;

    #[test]
    fn test_fast_decoupled_matches_nr() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let v0 = model.flat_start();
        let input = model.input(&v0);
        let config = SolverConfig {
            max_iter: 50,
            tolerance: 1e-8,
            ..Default::default()
        };
        let nr = newton_pf(&input, &config, &mut DefaultSolver::default()).unwrap();
        for scheme in [DecoupledScheme::XB, DecoupledScheme::BX] {
            let fd = fast_decoupled_pf::<DefaultSolver>(&input, &config, scheme).unwrap();
            assert!(fd.converged, "{scheme:?} error {}", fd.error);
            for (a, b) in nr.v.iter().zip(fd.v.iter()) {
                assert!((a.norm() - b.norm()).abs() < 1e-4);
                assert!((a.arg() - b.arg()).abs() < 1e-4);
            }
        }
    }
}
