use std::time::Instant;

use nalgebra_sparse::CscMatrix;

use super::error::{PowerFlowError, Result};
use super::jacobian::jacobian;
use super::newtonpf::polar;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;

/// Levenberg-Marquardt power flow.
///
/// Solves `(JᵀJ + λI)·dx = Jᵀf` and accepts the step when the gain ratio is
/// positive. On acceptance `λ *= max(1/3, 1 − (2ρ − 1)³)`, otherwise λ grows
/// by `ν` and `ν` doubles. Slower than Newton-Raphson but it keeps making
/// progress from poor starting points, which makes it the robust member of
/// the retry chain.
pub fn levenberg_marquardt_pf<S: Solve>(
    input: &SolverInput,
    config: &SolverConfig,
    solver: &mut S,
) -> Result<SolverOutput> {
    let start = Instant::now();
    let pvpq = input.pvpq();
    let pq = input.pq;
    let npvpq = pvpq.len();
    let nx = npvpq + pq.len();

    let mut v = input.v0.clone();
    let mut m = input.mismatch(&v, &pvpq);
    let mut iterations = 0;
    let mut lambda = 0.0;
    let mut nu = 2.0;
    let mut j = CscMatrix::zeros(nx, nx);
    let mut update_jacobian = true;

    while m.error > config.tolerance && iterations < config.max_iter && nx > 0 {
        if config.is_cancelled() {
            return Ok(SolverOutput::new(v, m.error, config.tolerance, iterations)
                .cancelled()
                .with_elapsed(start.elapsed()));
        }
        if update_jacobian {
            j = jacobian(input.ybus, &v, Some(input.i0), &pvpq, pq);
        }
        let jt = j.transpose();
        let jtj = &jt * &j;
        if iterations == 0 {
            let max_diag = jtj
                .diagonal_as_csc()
                .values()
                .iter()
                .fold(0.0f64, |a, b| a.max(*b));
            lambda = 1e-3 * max_diag;
        }
        let a = &jtj + &(CscMatrix::identity(nx) * lambda);
        let rhs = &jt * &m.fx;
        let mut dx = rhs.clone();
        solver
            .solve(&a, dx.as_mut_slice())
            .map_err(|_| PowerFlowError::SingularJacobian { iteration: iterations })?;

        let mut vm = v.map(|c| c.norm());
        let mut va = v.map(|c| c.arg());
        pvpq.iter().enumerate().for_each(|(k, &b)| va[b] -= dx[k]);
        pq.iter().enumerate().for_each(|(k, &b)| vm[b] -= dx[npvpq + k]);
        let v_new = polar(&vm, &va);
        let m_new = input.mismatch(&v_new, &pvpq);

        let f = 0.5 * m.fx.norm_squared();
        let f_new = 0.5 * m_new.fx.norm_squared();
        let predicted = dx.dot(&(&dx * lambda + &rhs));
        let rho = if predicted > 0.0 { (f - f_new) / (0.5 * predicted) } else { -1.0 };

        if rho > 0.0 {
            lambda *= (1.0f64 / 3.0).max(1.0 - (2.0 * rho - 1.0).powi(3));
            nu = 2.0;
            v = v_new;
            m = m_new;
            update_jacobian = true;
        } else {
            lambda *= nu;
            nu *= 2.0;
            update_jacobian = false;
        }
        iterations += 1;
        log::debug!("LM iteration {iterations}: error {:.3e}, lambda {lambda:.3e}", m.error);
    }

    let out = SolverOutput::new(v, m.error, config.tolerance, iterations).with_elapsed(start.elapsed());
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
    fn test_lm_matches_nr() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let v0 = model.flat_start();
        let input = model.input(&v0);
        let config = SolverConfig {
            max_iter: 100,
            ..Default::default()
        };
        let reference = newton_pf(&input, &config, &mut DefaultSolver::default()).unwrap();
        let out = levenberg_marquardt_pf(&input, &config, &mut DefaultSolver::default()).unwrap();
        assert!(out.converged, "error {}", out.error);
        for (a, b) in reference.v.iter().zip(out.v.iter()) {
            assert!((a - b).norm() < 1e-5);
        }
    }
}
