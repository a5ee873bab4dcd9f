use std::time::Instant;

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::error::{PowerFlowError, Result};
use super::jacobian::jacobian;
use super::mismatch::Mismatch;
use super::options::StepPolicy;
use super::pf::{SolverConfig, SolverInput, SolverOutput};
use super::solver::Solve;

/// Polar to rectangular.
pub(crate) fn polar(vm: &DVector<f64>, va: &DVector<f64>) -> DVector<Complex64> {
    vm.zip_map(va, Complex64::from_polar)
}

/// Applies `x - mu·dx` to the angles of `pvpq` and the magnitudes of `pq`.
fn take_step(
    input: &SolverInput,
    vm: &DVector<f64>,
    va: &DVector<f64>,
    dx: &DVector<f64>,
    mu: f64,
    pvpq: &[usize],
) -> (DVector<Complex64>, Mismatch) {
    let npvpq = pvpq.len();
    let mut vm = vm.clone();
    let mut va = va.clone();
    pvpq.iter().enumerate().for_each(|(k, &b)| va[b] -= mu * dx[k]);
    input
        .pq
        .iter()
        .enumerate()
        .for_each(|(k, &b)| vm[b] -= mu * dx[npvpq + k]);
    let v = polar(&vm, &va);
    let m = input.mismatch(&v, pvpq);
    (v, m)
}

/// Newton-Raphson power flow in polar coordinates.
///
/// The unknowns are the angles of the PV and PQ buses followed by the
/// magnitudes of the PQ buses; slack buses never move. `config.step`
/// chooses how much of each Newton direction is taken:
///
/// * [`StepPolicy::Plain`]: the full step.
/// * [`StepPolicy::LineSearch`]: the step is quartered on the same
///   direction while the error grows (at most 10 times, down to `µ = 0.01`).
/// * [`StepPolicy::Iwamoto`]: the optimal multiplier of Iwamoto and Tamura,
///   see [`iwamoto_multiplier`].
///
/// A failed factorization is fatal and reported as
/// [`PowerFlowError::SingularJacobian`]. Running out of iterations is not an
/// error; the output then has `converged == false` and the last iterate.
pub fn newton_pf<S: Solve>(
    input: &SolverInput,
    config: &SolverConfig,
    solver: &mut S,
) -> Result<SolverOutput> {
    let start = Instant::now();
    let pvpq = input.pvpq();
    let pq = input.pq;

    let mut v = input.v0.clone();
    let mut vm = v.map(|c| c.norm());
    let mut va = v.map(|c| c.arg());
    let mut m = input.mismatch(&v, &pvpq);
    let mut iterations = 0;

    if pvpq.is_empty() {
        return Ok(SolverOutput::new(v, m.error, config.tolerance, 0).with_elapsed(start.elapsed()));
    }

    while m.error > config.tolerance && iterations < config.max_iter {
        if config.is_cancelled() {
            return Ok(SolverOutput::new(v, m.error, config.tolerance, iterations)
                .cancelled()
                .with_elapsed(start.elapsed()));
        }

        let j = jacobian(input.ybus, &v, Some(input.i0), &pvpq, pq);
        let mut dx = m.fx.clone();
        solver
            .solve(&j, dx.as_mut_slice())
            .map_err(|_| PowerFlowError::SingularJacobian { iteration: iterations })?;

        let mu = match config.step {
            StepPolicy::Iwamoto => iwamoto_multiplier(input.ybus, &j, &m.fx, &dx, &pvpq, pq)
                .unwrap_or_else(|| {
                    log::warn!("Iwamoto multiplier unavailable at iteration {iterations}, using a full step");
                    1.0
                }),
            _ => 1.0,
        };
        let (mut v_new, mut m_new) = take_step(input, &vm, &va, &dx, mu, &pvpq);

        if config.step == StepPolicy::LineSearch {
            let mut mu = 1.0;
            let mut tries = 0;
            while !(m_new.error < m.error) && tries < 10 && mu > 0.01 {
                mu *= 0.25;
                tries += 1;
                (v_new, m_new) = take_step(input, &vm, &va, &dx, mu, &pvpq);
            }
            if tries > 0 {
                log::debug!("line search reduced the step to {mu}");
            }
        }

        v = v_new;
        m = m_new;
        // |V| and arg(V) again in case a magnitude went negative
        vm = v.map(|c| c.norm());
        va = v.map(|c| c.arg());
        iterations += 1;
        log::debug!("NR iteration {iterations}: error {:.3e}", m.error);
    }

    let out = SolverOutput::new(v, m.error, config.tolerance, iterations).with_elapsed(start.elapsed());
    if !out.converged && config.is_cancelled() {
        return Ok(out.cancelled());
    }
    Ok(out)
}

/// Iwamoto and Tamura, "A Load Flow Calculation Method for Ill-Conditioned
/// Power Systems", IEEE Trans. PAS-100 (1981).
///
/// Minimises `F(µ) = ½‖a − µb + µ²c‖²` with `a = f`, `b = J·dx` and
/// `c = ½·J(dV)·dx`, where `dV = dVm·e^{j·dVa}` is the increment as a phasor.
/// Returns `None` when `dV` vanishes at a PQ bus or the cubic `F'(µ) = 0`
/// has no usable positive root.
pub fn iwamoto_multiplier(
    ybus: &CscMatrix<Complex64>,
    j: &CscMatrix<f64>,
    fx: &DVector<f64>,
    dx: &DVector<f64>,
    pvpq: &[usize],
    pq: &[usize],
) -> Option<f64> {
    let n = ybus.nrows();
    let npvpq = pvpq.len();
    let mut dva = DVector::zeros(n);
    let mut dvm = DVector::zeros(n);
    pvpq.iter().enumerate().for_each(|(k, &b)| dva[b] = dx[k]);
    pq.iter().enumerate().for_each(|(k, &b)| dvm[b] = dx[npvpq + k]);
    if pq.iter().any(|&b| dvm[b] == 0.0) {
        return None;
    }
    let dv = polar(&dvm, &dva);

    let j2 = jacobian(ybus, &dv, None, pvpq, pq);
    let a = fx;
    let b = j * dx;
    let c = (&j2 * dx) * 0.5;

    let g0 = -a.dot(&b);
    let g1 = b.dot(&b) + 2.0 * a.dot(&c);
    let g2 = -3.0 * b.dot(&c);
    let g3 = 2.0 * c.dot(&c);

    let f = |mu: f64| (a - &b * mu + &c * (mu * mu)).norm_squared();
    real_cubic_roots(g3, g2, g1, g0)?
        .into_iter()
        .filter(|r| *r > 0.0 && r.is_finite())
        .min_by(|x, y| f(*x).total_cmp(&f(*y)))
}

/// Real roots of `c3·x³ + c2·x² + c1·x + c0`, `None` when the leading
/// coefficient vanishes.
pub(crate) fn real_cubic_roots(c3: f64, c2: f64, c1: f64, c0: f64) -> Option<Vec<f64>> {
    let scale = c2.abs().max(c1.abs()).max(c0.abs());
    if !(c3.abs() > 1e-14 * scale) || !c3.is_finite() {
        return None;
    }
    let (a, b, c) = (c2 / c3, c1 / c3, c0 / c3);
    // x = t - a/3 gives t³ + p·t + q = 0
    let p = b - a * a / 3.0;
    let q = 2.0 * a * a * a / 27.0 - a * b / 3.0 + c;
    let shift = -a / 3.0;
    let disc = (q / 2.0).powi(2) + (p / 3.0).powi(3);

    let roots = if disc > 0.0 {
        let s = disc.sqrt();
        vec![(-q / 2.0 + s).cbrt() + (-q / 2.0 - s).cbrt() + shift]
    } else if p == 0.0 {
        vec![shift]
    } else {
        let r = 2.0 * (-p / 3.0).sqrt();
        let phi = ((3.0 * q / (2.0 * p)) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0).acos() / 3.0;
        (0..3)
            .map(|k| r * (phi - 2.0 * std::f64::consts::PI * k as f64 / 3.0).cos() + shift)
            .collect()
    };
    Some(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::pf::IslandModel;
    use crate::basic::solver::DefaultSolver;
    use crate::testcases;
    use approx::assert_relative_eq;

    fn solve(model: &IslandModel, step: StepPolicy) -> SolverOutput {
        let v0 = model.flat_start();
        let config = SolverConfig {
            step,
            ..Default::default()
        };
        newton_pf(&model.input(&v0), &config, &mut DefaultSolver::default()).unwrap()
    }

    #[test]
    fn test_three_bus_converges() {
        let model = IslandModel::new(testcases::three_bus()).unwrap();
        let out = solve(&model, StepPolicy::Plain);
        assert!(out.converged);
        assert!(out.iterations <= 10);
        assert!(out.error < 1e-6);

        // power balance at every non-slack bus
        let v0 = model.flat_start();
        let input = model.input(&v0);
        let m = input.mismatch(&out.v, &input.pvpq());
        for &b in model.pv.iter().chain(&model.pq) {
            assert!(m.mis[b].re.abs() < 1e-6);
        }
        for &b in &model.pq {
            assert!(m.mis[b].im.abs() < 1e-6);
        }
        // slack unchanged
        assert_relative_eq!(out.v[0].re, 1.0);
        assert_relative_eq!(out.v[0].im, 0.0);
    }

    #[test]
    fn test_step_policies_agree() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let plain = solve(&model, StepPolicy::Plain);
        for step in [StepPolicy::LineSearch, StepPolicy::Iwamoto] {
            let other = solve(&model, step);
            assert!(other.converged, "{step:?}");
            for (a, b) in plain.v.iter().zip(other.v.iter()) {
                assert!((a - b).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn test_max_iter_returns_last_iterate() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let v0 = model.flat_start();
        let config = SolverConfig {
            max_iter: 1,
            tolerance: 1e-12,
            ..Default::default()
        };
        let out = newton_pf(&model.input(&v0), &config, &mut DefaultSolver::default()).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
        assert!(out.error.is_finite());
    }

    #[test]
    fn test_cancelled_before_first_iteration() {
        let model = IslandModel::new(testcases::five_bus()).unwrap();
        let v0 = model.flat_start();
        let config = SolverConfig::default();
        config.cancel.cancel();
        let out = newton_pf(&model.input(&v0), &config, &mut DefaultSolver::default()).unwrap();
        assert!(out.cancelled);
        assert!(!out.converged);
        assert_eq!(out.iterations, 0);
        assert_eq!(out.v, v0);
    }

    #[test]
    fn test_cubic_roots() {
        // (x - 1)(x - 2)(x + 3) = x³ - 7x + 6
        let mut r = real_cubic_roots(1.0, 0.0, -7.0, 6.0).unwrap();
        r.sort_by(f64::total_cmp);
        assert_relative_eq!(r[0], -3.0, epsilon = 1e-10);
        assert_relative_eq!(r[1], 1.0, epsilon = 1e-10);
        assert_relative_eq!(r[2], 2.0, epsilon = 1e-10);

        // x³ + x - 2 has the single real root 1
        let r = real_cubic_roots(2.0, 0.0, 2.0, -4.0).unwrap();
        assert_eq!(r.len(), 1);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-10);

        assert!(real_cubic_roots(0.0, 1.0, 1.0, 1.0).is_none());
    }
}
